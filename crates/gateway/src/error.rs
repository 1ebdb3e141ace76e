//! Stable, coarse error codes for every request-path failure (spec §7).
//!
//! Handlers never panic on a recoverable condition — they return a
//! `GatewayError`, which carries the fine-grained reason into the logs
//! (`tracing::warn!`) and only the coarse code into the response body.
//! Only genuinely unrecoverable conditions (store unreachable, CSPRNG
//! failure) surface as `internal_error` / 500.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unknown sitekey")]
    UnknownSitekey,
    #[error("origin not allowed")]
    OriginMismatch,
    #[error("no session for this sitekey/client key")]
    NoSession,
    #[error("session expired")]
    SessionExpired,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("crypto error")]
    CryptoError,
    #[error("challenge token invalid or already used")]
    InvalidOrUsedToken,
    #[error("challenge expired")]
    Expired,
    #[error("wrong answer")]
    WrongAnswer,
    #[error("proof of work failed")]
    PowFailed,
    #[error("risk score is critical")]
    RiskCritical,
    #[error("ip blocked")]
    IpBlocked,
    #[error("country blocked")]
    CountryBlocked,
    #[error("vpn detected")]
    VpnDetected { remaining_time_minutes: Option<u64> },
    #[error("rate limited")]
    RateLimited,
    #[error("ip locked out, remaining {remaining_time_minutes} min")]
    IpLocked { remaining_time_minutes: u64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn code(&self) -> &'static str {
        match self {
            GatewayError::MalformedRequest(_) => "malformed_request",
            GatewayError::UnknownSitekey => "unknown_sitekey",
            GatewayError::OriginMismatch => "origin_mismatch",
            GatewayError::NoSession => "no_session",
            GatewayError::SessionExpired => "session_expired",
            GatewayError::HandshakeFailed => "handshake_failed",
            GatewayError::DecryptFailed => "decrypt_failed",
            GatewayError::CryptoError => "crypto_error",
            GatewayError::InvalidOrUsedToken => "invalid_or_used_token",
            GatewayError::Expired => "expired",
            // wrong_answer, pow_failed, risk_critical all render as one
            // generic user-safe message per §7, but keep distinct codes for
            // logging/metrics.
            GatewayError::WrongAnswer => "wrong_answer",
            GatewayError::PowFailed => "pow_failed",
            GatewayError::RiskCritical => "risk_critical",
            GatewayError::IpBlocked => "ip_blocked",
            GatewayError::CountryBlocked => "country_blocked",
            GatewayError::VpnDetected { .. } => "vpn_detected",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::IpLocked { .. } => "ip_locked",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            GatewayError::WrongAnswer | GatewayError::PowFailed | GatewayError::RiskCritical => {
                "verification failed"
            }
            GatewayError::MalformedRequest(_) => "the request could not be understood",
            GatewayError::UnknownSitekey => "unknown sitekey",
            GatewayError::OriginMismatch => "origin not allowed for this sitekey",
            GatewayError::NoSession => "no active session",
            GatewayError::SessionExpired => "session expired, please retry",
            GatewayError::HandshakeFailed => "handshake failed",
            GatewayError::DecryptFailed | GatewayError::CryptoError => "request could not be processed",
            GatewayError::InvalidOrUsedToken => "token is invalid or already used",
            GatewayError::Expired => "challenge expired",
            GatewayError::IpBlocked => "your network is blocked",
            GatewayError::CountryBlocked => "not available in your region",
            GatewayError::VpnDetected { .. } => "vpn/proxy connections are not allowed",
            GatewayError::RateLimited => "too many requests, please slow down",
            GatewayError::IpLocked { .. } => "too many failed attempts, try again later",
            GatewayError::Internal(_) => "internal error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::MalformedRequest(_)
            | GatewayError::NoSession
            | GatewayError::SessionExpired
            | GatewayError::HandshakeFailed
            | GatewayError::DecryptFailed
            | GatewayError::CryptoError
            | GatewayError::InvalidOrUsedToken
            | GatewayError::Expired
            | GatewayError::WrongAnswer
            | GatewayError::PowFailed
            | GatewayError::RiskCritical => StatusCode::BAD_REQUEST,
            GatewayError::UnknownSitekey | GatewayError::OriginMismatch | GatewayError::IpBlocked | GatewayError::CountryBlocked => {
                StatusCode::FORBIDDEN
            }
            GatewayError::VpnDetected { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::IpLocked { .. } => StatusCode::FORBIDDEN,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn remaining_time_minutes(&self) -> Option<u64> {
        match self {
            GatewayError::IpLocked { remaining_time_minutes } => Some(*remaining_time_minutes),
            GatewayError::VpnDetected { remaining_time_minutes } => *remaining_time_minutes,
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    message: &'static str,
    #[serde(rename = "remainingTime", skip_serializing_if = "Option::is_none")]
    remaining_time: Option<u64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(code = self.code(), detail = %self, "request failed");
        let body = ErrorBody {
            success: false,
            error: self.code(),
            message: self.user_message(),
            remaining_time: self.remaining_time_minutes(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<captcha_protocol::crypto::CryptoError> for GatewayError {
    fn from(_: captcha_protocol::crypto::CryptoError) -> Self {
        GatewayError::CryptoError
    }
}

impl From<captcha_protocol::envelope::EnvelopeError> for GatewayError {
    fn from(err: captcha_protocol::envelope::EnvelopeError) -> Self {
        GatewayError::MalformedRequest(err.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
