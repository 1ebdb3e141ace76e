//! `POST /siteverify` — server-to-server single-use redemption of a
//! verification token (C10).

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};
use crate::models::RiskBand;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SiteverifyRequest {
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteverifyResponse {
    success: bool,
    risk_score: Option<f64>,
    risk_band: Option<RiskBand>,
}

fn bearer_secret(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn siteverify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SiteverifyRequest>,
) -> GatewayResult<Json<SiteverifyResponse>> {
    let secret = bearer_secret(&headers).ok_or(GatewayError::MalformedRequest("missing bearer secret key".into()))?;
    let secret_hash = hex::encode(Sha256::digest(secret.as_bytes()));

    let sitekey_record = crate::db::fetch_sitekey_by_secret_hash(&state.db, &secret_hash)
        .await?
        .ok_or(GatewayError::UnknownSitekey)?;

    let record = state.verification_tokens.consume(&req.token).await?;

    // Cross-tenant replay defense (§4.10 step 3, scenario 6 in §8).
    if record.payload.sitekey != sitekey_record.sitekey {
        return Err(GatewayError::InvalidOrUsedToken);
    }
    if chrono::Utc::now() >= record.payload.expires_at {
        return Err(GatewayError::Expired);
    }

    Ok(Json(SiteverifyResponse {
        success: true,
        risk_score: Some(record.payload.risk_score),
        risk_band: Some(record.payload.risk_band),
    }))
}
