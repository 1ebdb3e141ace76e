//! `POST /challenge` (enveloped) — issues a puzzle plus PoW under the
//! session's per-challenge key (C4 + C1 + C11).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use captcha_protocol::crypto;
use captcha_protocol::envelope::{self, Envelope};
use captcha_protocol::puzzle::ChallengeType;
use captcha_protocol::wire::{ChallengeResponseBody, SealedWire};

use crate::error::{GatewayError, GatewayResult};
use crate::handlers::origin_header;
use crate::models::{ChallengePayload, RiskBand, RiskDecision, RiskMetadata};
use crate::risk::{self, RiskContext};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeRequest {
    sitekey: String,
    client_public_key: String,
    #[serde(default)]
    requested_type: Option<ChallengeType>,
    #[serde(default)]
    fingerprint: Option<String>,
}

/// Untagged so a trusted-fingerprint bypass (§9) and a normal puzzle
/// issuance serialize as two distinct, self-describing response shapes
/// rather than one struct full of optional fields.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(untagged)]
enum ChallengeResponse {
    Skipped { verification_token: String, risk_score: f64, risk_band: RiskBand },
    Puzzle { token: String, sealed: SealedWire },
}

pub async fn issue_challenge(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> GatewayResult<Json<Envelope>> {
    let plaintext_fallback = envelope::is_plaintext(&envelope);
    let req: ChallengeRequest = envelope::unwrap(&envelope)?;

    let policy = state
        .policy(&req.sitekey)
        .await?
        .ok_or(GatewayError::UnknownSitekey)?;

    let origin = origin_header(&headers);
    let fingerprint_hash = req.fingerprint.as_deref().map(|f| hex::encode(Sha256::digest(f.as_bytes())));
    state.policy_filter.check(&policy, addr.ip(), origin.as_deref(), fingerprint_hash.as_deref()).await?;

    let client_pub_raw = STANDARD
        .decode(&req.client_public_key)
        .map_err(|_| GatewayError::MalformedRequest("clientPublicKey is not valid base64".into()))?;

    let session = state
        .session_store
        .lookup(&req.sitekey, &client_pub_raw)
        .await
        .ok_or(GatewayError::NoSession)?;

    if policy.allow_skip_for_trusted_fingerprints {
        if let Some(hash) = fingerprint_hash.as_deref() {
            if state.policy_filter.is_fingerprint_trusted(hash).await {
                if let Some(response) = try_skip(&state, &policy, hash, plaintext_fallback).await? {
                    return Ok(Json(envelope::wrap(&response)?));
                }
            }
        }
    }

    let harder_next_key = crate::policy::harder_next_key(fingerprint_hash.as_deref(), addr.ip());
    let risk_band = if state.policy_filter.take_harder_next(&harder_next_key).await {
        Some(RiskBand::High)
    } else {
        None
    };
    let challenge_type = state.challenge_factory.select_type(&policy, req.requested_type, risk_band);
    let (puzzle, answer) = state.challenge_factory.build(challenge_type);
    let pow_params = state.challenge_factory.build_pow(&policy);

    let session_key = STANDARD.encode(session.client_public_key);
    let ip_hash = hex::encode(Sha256::digest(addr.ip().to_string().as_bytes()));

    let now = chrono::Utc::now();
    let payload = ChallengePayload {
        sitekey: req.sitekey.clone(),
        session_key,
        puzzle: puzzle.clone(),
        answer,
        pow_params: pow_params.clone(),
        ip_hash,
        fingerprint_hash: fingerprint_hash.clone(),
        created_at: now,
        expires_at: now + chrono::Duration::milliseconds(policy.challenge_timeout_ms),
    };

    let (challenge_id, token) = state.challenge_tokens.issue(payload).await;

    let body = ChallengeResponseBody { puzzle, pow_params };
    let plaintext = serde_json::to_vec(&body)
        .map_err(|e| GatewayError::Internal(format!("cannot serialize challenge body: {e}")))?;

    let k_encrypt = crypto::derive_child(&session.master_key, &challenge_id, "encrypt")?;
    let sealed = crypto::aead_seal(&k_encrypt, &plaintext, challenge_id.as_bytes())?;

    let response = ChallengeResponse::Puzzle { token, sealed: SealedWire::from(&sealed) };
    Ok(Json(envelope::wrap(&response)?))
}

/// Trusted-fingerprint bypass (§9): mints a verification token directly,
/// still subject to C6 (already run by the caller) and C7. Returns `Ok(None)`
/// if C7 rejects, falling back to normal puzzle issuance rather than
/// granting a free pass when risk scoring alone says no.
async fn try_skip(
    state: &AppState,
    policy: &crate::models::PolicyRecord,
    fingerprint_hash: &str,
    plaintext_fallback: bool,
) -> GatewayResult<Option<ChallengeResponse>> {
    let ctx = RiskContext {
        seen_fingerprint_before: true,
        ip_failure_rate: 0.0,
        baseline_local_hour: None,
        plaintext_fallback,
    };
    let assessment = risk::assess(policy, &RiskMetadata::default(), &ctx)?;
    if assessment.decision == RiskDecision::Reject {
        return Ok(None);
    }

    let verification_payload = crate::models::VerificationPayload {
        sitekey: policy.sitekey.clone(),
        risk_score: assessment.score_0_100,
        risk_band: assessment.band,
        expires_at: chrono::Utc::now() + chrono::Duration::milliseconds(policy.token_expiry_ms),
    };
    let (_, verification_token) = state.verification_tokens.issue(verification_payload).await;
    state.policy_filter.record_fingerprint_success(fingerprint_hash).await;

    Ok(Some(ChallengeResponse::Skipped {
        verification_token,
        risk_score: assessment.score_0_100,
        risk_band: assessment.band,
    }))
}
