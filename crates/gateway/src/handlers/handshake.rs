//! `POST /handshake` — negotiates a session key (C3).

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub sitekey: String,
    pub client_public_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub server_public_key: String,
    pub server_nonce: String,
    pub expires_in_sec: u64,
}

pub async fn handshake(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HandshakeRequest>,
) -> GatewayResult<Json<HandshakeResponse>> {
    if crate::db::fetch_sitekey(&state.db, &req.sitekey).await?.is_none() {
        return Err(GatewayError::UnknownSitekey);
    }

    let client_pub_raw = STANDARD
        .decode(&req.client_public_key)
        .map_err(|_| GatewayError::MalformedRequest("clientPublicKey is not valid base64".into()))?;

    let (server_pub, server_nonce, expires_in_sec) =
        state.session_store.handshake(&req.sitekey, &client_pub_raw).await?;

    Ok(Json(HandshakeResponse {
        server_public_key: STANDARD.encode(server_pub),
        server_nonce: hex::encode(server_nonce),
        expires_in_sec,
    }))
}
