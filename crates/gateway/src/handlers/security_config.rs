//! `POST /security-config` — encrypted, nonce-bound per-sitekey
//! configuration delivery (C9). Not enveloped per §6's interface table;
//! the AEAD layer alone protects the policy snapshot.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use captcha_protocol::crypto;
use captcha_protocol::wire::SealedWire;

use crate::error::{GatewayError, GatewayResult};
use crate::models::PolicyRecord;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfigRequest {
    sitekey: String,
    client_public_key: String,
    #[serde(default)]
    client_timestamp: Option<i64>,
    nonce: String,
}

#[derive(Debug, Serialize)]
struct ConfigSnapshot {
    policy: PolicyRecord,
    nonce: String,
    #[serde(rename = "serverTimestamp")]
    server_timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfigResponse {
    config_id: String,
    encrypted: SealedWire,
}

pub async fn security_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SecurityConfigRequest>,
) -> GatewayResult<Json<SecurityConfigResponse>> {
    let _ = req.client_timestamp; // freshness check is a client-side obligation, §4.9/§9

    let client_pub_raw = STANDARD
        .decode(&req.client_public_key)
        .map_err(|_| GatewayError::MalformedRequest("clientPublicKey is not valid base64".into()))?;

    let session = state
        .session_store
        .lookup(&req.sitekey, &client_pub_raw)
        .await
        .ok_or(GatewayError::NoSession)?;

    let policy = state
        .policy(&req.sitekey)
        .await?
        .ok_or(GatewayError::UnknownSitekey)?;

    let (config_id, _) = state.config_tokens.issue(()).await;

    let snapshot = ConfigSnapshot { policy, nonce: req.nonce, server_timestamp: chrono::Utc::now().timestamp_millis() };
    let plaintext = serde_json::to_vec(&snapshot)
        .map_err(|e| GatewayError::Internal(format!("cannot serialize config snapshot: {e}")))?;

    let key = crypto::derive_child(&session.master_key, &config_id, "config")?;
    let sealed = crypto::aead_seal(&key, &plaintext, config_id.as_bytes())?;

    Ok(Json(SecurityConfigResponse { config_id, encrypted: SealedWire::from(&sealed) }))
}
