pub mod challenge;
pub mod handshake;
pub mod security_config;
pub mod siteverify;
pub mod verify;

use axum::http::HeaderMap;

/// Origin allowlist checks key off the `Origin` header, falling back to the
/// host portion of `Referer` for older/non-fetch clients (§4.6 step 1).
pub fn origin_header(headers: &HeaderMap) -> Option<String> {
    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        return Some(origin.to_string());
    }
    headers
        .get(axum::http::header::REFERER)
        .and_then(|v| v.to_str().ok())
        .and_then(|referer| {
            referer.split('/').nth(2).map(|host| {
                let scheme = referer.split("://").next().unwrap_or("https");
                format!("{scheme}://{host}")
            })
        })
}
