//! `POST /verify` (enveloped) — the nine-step verification orchestrator
//! (C8), inlined here per the teacher's "handler contains the full business
//! logic" style rather than split into a separate orchestrator module.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use captcha_protocol::crypto;
use captcha_protocol::envelope::{self, Envelope};
use captcha_protocol::pow;
use captcha_protocol::wire::{SealedWire, SolutionBody};

use crate::error::{GatewayError, GatewayResult};
use crate::handlers::origin_header;
use crate::models::{RiskBand, RiskDecision, RiskMetadata};
use crate::risk::{self, RiskContext};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    challenge_token: String,
    solution: SealedWire,
    metadata: SealedWire,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    success: bool,
    verification_token: Option<String>,
    risk_score: Option<f64>,
    risk_band: Option<RiskBand>,
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> GatewayResult<Json<Envelope>> {
    let plaintext_fallback = envelope::is_plaintext(&envelope);
    let req: VerifyRequest = envelope::unwrap(&envelope)?;
    let ip = addr.ip();

    // Step 1: consume the challenge token atomically.
    let record = state.challenge_tokens.consume(&req.challenge_token).await?;
    let challenge_id =
        crate::token::token_id(&req.challenge_token).ok_or(GatewayError::InvalidOrUsedToken)?;

    // Step 2: expiry check. `now == expiresAt` counts as expired (§8).
    if chrono::Utc::now() >= record.payload.expires_at {
        return Err(GatewayError::Expired);
    }

    // Step 3: policy filter on ip.
    let policy = state
        .policy(&record.payload.sitekey)
        .await?
        .ok_or(GatewayError::UnknownSitekey)?;
    let origin = origin_header(&headers);
    let fingerprint_hash = record.payload.fingerprint_hash.as_deref();
    state.policy_filter.check(&policy, ip, origin.as_deref(), fingerprint_hash).await?;

    // Step 4: session lookup + per-challenge key derivation.
    let client_pub_raw = STANDARD
        .decode(&record.payload.session_key)
        .map_err(|_| GatewayError::Internal("corrupt session key in challenge record".into()))?;
    let session = state
        .session_store
        .lookup(&record.payload.sitekey, &client_pub_raw)
        .await
        .ok_or(GatewayError::NoSession)?;

    let k_solution = crypto::derive_child(&session.master_key, challenge_id, "decrypt")?;
    let k_metadata = crypto::derive_child(&session.master_key, challenge_id, "metadata")?;

    // Step 5: open both payloads.
    let solution_sealed: crypto::Sealed =
        (&req.solution).try_into().map_err(|_| GatewayError::MalformedRequest("bad solution encoding".into()))?;
    let metadata_sealed: crypto::Sealed =
        (&req.metadata).try_into().map_err(|_| GatewayError::MalformedRequest("bad metadata encoding".into()))?;

    let solution_plaintext = match crypto::aead_open(
        &k_solution,
        &solution_sealed.iv,
        &solution_sealed.ciphertext,
        &solution_sealed.tag,
        challenge_id.as_bytes(),
    ) {
        Ok(p) => p,
        Err(_) => {
            record_failure(&state, &policy, ip, fingerprint_hash).await;
            return Err(GatewayError::DecryptFailed);
        }
    };
    let metadata_plaintext = match crypto::aead_open(
        &k_metadata,
        &metadata_sealed.iv,
        &metadata_sealed.ciphertext,
        &metadata_sealed.tag,
        challenge_id.as_bytes(),
    ) {
        Ok(p) => p,
        Err(_) => {
            record_failure(&state, &policy, ip, fingerprint_hash).await;
            return Err(GatewayError::DecryptFailed);
        }
    };

    let solution: SolutionBody = serde_json::from_slice(&solution_plaintext)
        .map_err(|_| GatewayError::MalformedRequest("solution body is not valid JSON".into()))?;
    let metadata: RiskMetadata =
        serde_json::from_slice(&metadata_plaintext).unwrap_or_default();

    // Step 6: proof-of-work.
    if !pow::verify(&record.payload.pow_params, solution.pow_solution) {
        record_failure(&state, &policy, ip, fingerprint_hash).await;
        return Err(GatewayError::PowFailed);
    }

    // Step 7: puzzle-specific comparison.
    if !record.payload.answer.matches(&solution.answer) {
        record_failure(&state, &policy, ip, fingerprint_hash).await;
        return Err(GatewayError::WrongAnswer);
    }

    // Step 8: risk scorer.
    let seen_fingerprint_before = match fingerprint_hash {
        Some(hash) => state.policy_filter.seen_fingerprint_before(hash).await,
        None => false,
    };
    let ctx = RiskContext {
        seen_fingerprint_before,
        ip_failure_rate: 0.0,
        baseline_local_hour: None,
        plaintext_fallback,
    };
    let assessment = risk::assess(&policy, &metadata, &ctx)?;
    if assessment.decision == RiskDecision::Reject {
        return Err(GatewayError::RiskCritical);
    }
    if assessment.decision == RiskDecision::HarderNext {
        let key = crate::policy::harder_next_key(fingerprint_hash, ip);
        state.policy_filter.mark_harder_next(&key).await;
    }

    // Step 9: mint the verification token.
    state.policy_filter.record_success(ip).await;
    if let Some(hash) = fingerprint_hash {
        state.policy_filter.record_fingerprint_success(hash).await;
    }
    let verification_payload = crate::models::VerificationPayload {
        sitekey: record.payload.sitekey.clone(),
        risk_score: assessment.score_0_100,
        risk_band: assessment.band,
        expires_at: chrono::Utc::now() + chrono::Duration::milliseconds(policy.token_expiry_ms),
    };
    let (_, verification_token) = state.verification_tokens.issue(verification_payload).await;

    let response = VerifyResponse {
        success: true,
        verification_token: Some(verification_token),
        risk_score: Some(assessment.score_0_100),
        risk_band: Some(assessment.band),
    };
    Ok(Json(envelope::wrap(&response)?))
}

/// Accounts a verify failure against both the IP and (if present) the
/// fingerprint, per §4.8's per-IP/per-fingerprint failure counters.
async fn record_failure(
    state: &AppState,
    policy: &crate::models::PolicyRecord,
    ip: std::net::IpAddr,
    fingerprint_hash: Option<&str>,
) {
    state.policy_filter.record_failure(policy, ip).await;
    if let Some(hash) = fingerprint_hash {
        state.policy_filter.record_fingerprint_failure(policy, hash).await;
    }
}
