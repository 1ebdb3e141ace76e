//! Domain types: the durable sitekey/policy records (§3, §6) and the
//! payloads carried inside token-service records for the three ephemeral
//! kinds (§4.5).

use captcha_protocol::puzzle::ChallengeType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SitekeyRecord {
    pub sitekey: String,
    pub secret_key_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeSelectionMode {
    Random,
    Sequential,
    RiskBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Paranoid,
}

impl Sensitivity {
    /// Multiplicative shift applied to the band threshold vector; higher
    /// sensitivity pulls thresholds down so bands trip earlier.
    pub fn multiplier(self) -> f64 {
        match self {
            Sensitivity::Low => 1.2,
            Sensitivity::Medium => 1.0,
            Sensitivity::High => 0.85,
            Sensitivity::Paranoid => 0.65,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskWeights {
    pub automation: f64,
    pub behavioral: f64,
    pub fingerprint: f64,
    pub reputation: f64,
    pub anomaly: f64,
    pub temporal: f64,
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.automation
            + self.behavioral
            + self.fingerprint
            + self.reputation
            + self.anomaly
            + self.temporal
    }

    /// §8: weight sum must be within 1 ± 0.05.
    pub fn is_valid(&self) -> bool {
        (self.sum() - 1.0).abs() <= 0.05
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            automation: 0.2,
            behavioral: 0.2,
            fingerprint: 0.15,
            reputation: 0.2,
            anomaly: 0.15,
            temporal: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self { low: 20.0, medium: 40.0, high: 65.0, critical: 85.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub sitekey: String,
    pub allowed_origins: Vec<String>,
    pub enabled_challenge_types: Vec<ChallengeType>,
    pub challenge_selection_mode: ChallengeSelectionMode,
    pub preferred_challenge_type: Option<ChallengeType>,
    pub allow_skip_for_trusted_fingerprints: bool,
    pub challenge_timeout_ms: i64,
    pub token_expiry_ms: i64,
    pub proof_of_work_difficulty: u8,
    pub blocked_ips: Vec<String>,
    pub blocked_countries: Vec<String>,
    pub anti_vpn: bool,
    pub rate_limit_max_requests: u32,
    pub consecutive_failure_threshold: u32,
    pub risk_weights: RiskWeights,
    pub risk_thresholds: RiskThresholds,
    pub risk_sensitivity: Sensitivity,
}

impl Default for PolicyRecord {
    fn default() -> Self {
        Self {
            sitekey: String::new(),
            allowed_origins: vec!["*".to_string()],
            enabled_challenge_types: ChallengeType::ALL.to_vec(),
            challenge_selection_mode: ChallengeSelectionMode::Random,
            preferred_challenge_type: None,
            allow_skip_for_trusted_fingerprints: false,
            challenge_timeout_ms: 60_000,
            token_expiry_ms: 60_000,
            proof_of_work_difficulty: 3,
            blocked_ips: Vec::new(),
            blocked_countries: Vec::new(),
            anti_vpn: false,
            rate_limit_max_requests: 30,
            consecutive_failure_threshold: 5,
            risk_weights: RiskWeights::default(),
            risk_thresholds: RiskThresholds::default(),
            risk_sensitivity: Sensitivity::Medium,
        }
    }
}

/// Row shape for the `policies` table; the record itself is stored as JSONB
/// so the column set can evolve without a migration per field (the teacher
/// stores S3 object metadata the same way, see the original `Object::metadata_json`).
#[derive(Debug, sqlx::FromRow)]
pub struct PolicyRow {
    pub sitekey: String,
    pub policy_json: serde_json::Value,
}

/// Behavioral/device signal bundle submitted alongside a solution, consumed
/// by the risk scorer (§4.7). Every field is optional — widgets degrade
/// gracefully and an absent signal simply scores neutrally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetadata {
    pub webdriver: Option<bool>,
    pub headless_ua: Option<bool>,
    pub plugins_count: Option<u32>,
    pub languages_count: Option<u32>,
    pub mouse_events: Option<u32>,
    pub keyboard_events: Option<u32>,
    pub solve_time_ms: Option<u64>,
    pub fingerprint: Option<String>,
    pub canvas_entropy: Option<f64>,
    pub webgl_entropy: Option<f64>,
    pub audio_entropy: Option<f64>,
    pub local_hour: Option<u8>,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Accept,
    AcceptAnnotate,
    HarderNext,
    Reject,
}

/// Payload stored in the challenge token record: everything C8 needs to
/// grade a solution without a second lookup.
#[derive(Debug, Clone)]
pub struct ChallengePayload {
    pub sitekey: String,
    pub session_key: String,
    pub puzzle: captcha_protocol::puzzle::Puzzle,
    pub answer: captcha_protocol::puzzle::Answer,
    pub pow_params: captcha_protocol::pow::PowParams,
    pub ip_hash: String,
    pub fingerprint_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Payload stored in the verification token record, returned verbatim (minus
/// internals) by `/siteverify`.
#[derive(Debug, Clone)]
pub struct VerificationPayload {
    pub sitekey: String,
    pub risk_score: f64,
    pub risk_band: RiskBand,
    pub expires_at: DateTime<Utc>,
}
