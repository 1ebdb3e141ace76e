//! Risk scorer (C7): six independently-scored features combined into a
//! single band via policy-supplied weights and thresholds (§4.7). Each
//! feature function is pure — `Metadata -> f64` in `[0,1]` — so the ensemble
//! itself is trivially unit-testable without a live request.

use crate::error::GatewayError;
use crate::models::{PolicyRecord, RiskBand, RiskDecision, RiskMetadata};

fn automation_score(m: &RiskMetadata) -> f64 {
    let mut score: f64 = 0.0;
    if m.webdriver == Some(true) {
        score += 0.5;
    }
    if m.headless_ua == Some(true) {
        score += 0.3;
    }
    if m.plugins_count == Some(0) {
        score += 0.1;
    }
    if m.languages_count == Some(0) {
        score += 0.1;
    }
    score.min(1.0)
}

fn behavioral_score(m: &RiskMetadata) -> f64 {
    let events = m.mouse_events.unwrap_or(0) + m.keyboard_events.unwrap_or(0);
    let too_few = events < 2;
    let too_fast = m.solve_time_ms.map(|t| t < 300).unwrap_or(false);
    let too_regular = m.solve_time_ms.map(|t| t > 0 && t % 1000 == 0).unwrap_or(false);

    if too_fast && too_few {
        1.0
    } else if too_fast || too_few {
        0.9
    } else if too_regular {
        0.6
    } else {
        0.1
    }
}

fn fingerprint_score(m: &RiskMetadata, seen_before: bool) -> f64 {
    let _ = m;
    if seen_before {
        0.1
    } else {
        0.6
    }
}

fn reputation_score(failure_rate: f64) -> f64 {
    failure_rate.clamp(0.0, 1.0)
}

fn anomaly_score(m: &RiskMetadata) -> f64 {
    let entropies = [m.canvas_entropy, m.webgl_entropy, m.audio_entropy];
    let present: Vec<f64> = entropies.into_iter().flatten().collect();
    if present.is_empty() {
        return 0.4;
    }
    let low_entropy_count = present.iter().filter(|&&e| e < 0.2).count();
    (low_entropy_count as f64 / present.len() as f64).min(1.0)
}

fn temporal_score(m: &RiskMetadata, baseline_hour: Option<u8>) -> f64 {
    match (m.local_hour, baseline_hour) {
        (Some(hour), Some(baseline)) => {
            let diff = (hour as i16 - baseline as i16).unsigned_abs().min(24 - (hour as i16 - baseline as i16).unsigned_abs());
            (diff as f64 / 12.0).min(1.0)
        }
        _ => 0.2,
    }
}

pub struct RiskContext {
    pub seen_fingerprint_before: bool,
    pub ip_failure_rate: f64,
    pub baseline_local_hour: Option<u8>,
    /// Request arrived over the plaintext envelope fallback (§4.11), not
    /// the six weighted features — bumped onto the final score directly.
    pub plaintext_fallback: bool,
}

/// Flat points added to the 0-100 score for a plaintext-fallback request,
/// on top of the six weighted features.
const PLAINTEXT_FALLBACK_RISK_BUMP: f64 = 15.0;

pub struct RiskAssessment {
    pub score_0_100: f64,
    pub band: RiskBand,
    pub decision: RiskDecision,
}

/// Scores `metadata` under `policy`'s weights/thresholds/sensitivity.
/// Returns `internal_error` if the policy's weights violate the §8 sum
/// invariant — a misconfigured policy must never silently score requests.
pub fn assess(
    policy: &PolicyRecord,
    metadata: &RiskMetadata,
    ctx: &RiskContext,
) -> Result<RiskAssessment, GatewayError> {
    if !policy.risk_weights.is_valid() {
        return Err(GatewayError::Internal("risk weight sum out of bounds".to_string()));
    }

    let w = policy.risk_weights;
    let features = [
        w.automation * automation_score(metadata),
        w.behavioral * behavioral_score(metadata),
        w.fingerprint * fingerprint_score(metadata, ctx.seen_fingerprint_before),
        w.reputation * reputation_score(ctx.ip_failure_rate),
        w.anomaly * anomaly_score(metadata),
        w.temporal * temporal_score(metadata, ctx.baseline_local_hour),
    ];
    let risk: f64 = features.iter().sum();
    let mut score_0_100 = (risk * 100.0).clamp(0.0, 100.0);
    if ctx.plaintext_fallback {
        score_0_100 = (score_0_100 + PLAINTEXT_FALLBACK_RISK_BUMP).min(100.0);
    }

    let shift = policy.risk_sensitivity.multiplier();
    // `t.low` has no band below Low to gate, so only medium/high/critical are cut points.
    let t = policy.risk_thresholds;
    let (medium, high, critical) = (t.medium * shift, t.high * shift, t.critical * shift);

    let (band, decision) = if score_0_100 >= critical {
        (RiskBand::Critical, RiskDecision::Reject)
    } else if score_0_100 >= high {
        (RiskBand::High, RiskDecision::HarderNext)
    } else if score_0_100 >= medium {
        (RiskBand::Medium, RiskDecision::AcceptAnnotate)
    } else {
        (RiskBand::Low, RiskDecision::Accept)
    };

    Ok(RiskAssessment { score_0_100, band, decision })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RiskContext {
        RiskContext { seen_fingerprint_before: true, ip_failure_rate: 0.0, baseline_local_hour: Some(14), plaintext_fallback: false }
    }

    #[test]
    fn clean_signal_scores_low_and_accepts() {
        let policy = PolicyRecord::default();
        let metadata = RiskMetadata {
            mouse_events: Some(40),
            keyboard_events: Some(5),
            solve_time_ms: Some(4500),
            canvas_entropy: Some(0.8),
            webgl_entropy: Some(0.8),
            audio_entropy: Some(0.8),
            local_hour: Some(14),
            ..Default::default()
        };
        let result = assess(&policy, &metadata, &ctx()).unwrap();
        assert_eq!(result.band, RiskBand::Low);
        assert_eq!(result.decision, RiskDecision::Accept);
    }

    #[test]
    fn webdriver_plus_instant_solve_scores_critical() {
        let policy = PolicyRecord::default();
        let metadata = RiskMetadata {
            webdriver: Some(true),
            headless_ua: Some(true),
            plugins_count: Some(0),
            languages_count: Some(0),
            mouse_events: Some(0),
            keyboard_events: Some(0),
            solve_time_ms: Some(10),
            canvas_entropy: Some(0.05),
            webgl_entropy: Some(0.05),
            audio_entropy: Some(0.05),
            ..Default::default()
        };
        let ctx = RiskContext { seen_fingerprint_before: false, ip_failure_rate: 1.0, baseline_local_hour: None, plaintext_fallback: false };
        let result = assess(&policy, &metadata, &ctx).unwrap();
        assert_eq!(result.band, RiskBand::Critical);
        assert_eq!(result.decision, RiskDecision::Reject);
    }

    #[test]
    fn plaintext_fallback_bumps_the_score() {
        let policy = PolicyRecord::default();
        let metadata = RiskMetadata {
            mouse_events: Some(40),
            keyboard_events: Some(5),
            solve_time_ms: Some(4500),
            canvas_entropy: Some(0.8),
            webgl_entropy: Some(0.8),
            audio_entropy: Some(0.8),
            local_hour: Some(14),
            ..Default::default()
        };
        let clean = assess(&policy, &metadata, &ctx()).unwrap();
        let mut bumped_ctx = ctx();
        bumped_ctx.plaintext_fallback = true;
        let bumped = assess(&policy, &metadata, &bumped_ctx).unwrap();
        assert!(bumped.score_0_100 > clean.score_0_100);
    }

    #[test]
    fn invalid_weight_sum_is_rejected_as_internal_error() {
        let mut policy = PolicyRecord::default();
        policy.risk_weights.automation = 5.0;
        let metadata = RiskMetadata::default();
        assert!(matches!(assess(&policy, &metadata, &ctx()), Err(GatewayError::Internal(_))));
    }

    #[test]
    fn higher_sensitivity_lowers_the_trip_point() {
        let mut policy = PolicyRecord::default();
        let metadata = RiskMetadata {
            mouse_events: Some(5),
            keyboard_events: Some(1),
            solve_time_ms: Some(5000),
            ..Default::default()
        };
        let ctx = RiskContext { seen_fingerprint_before: false, ip_failure_rate: 0.3, baseline_local_hour: None, plaintext_fallback: false };

        policy.risk_sensitivity = crate::models::Sensitivity::Low;
        let lax = assess(&policy, &metadata, &ctx).unwrap();

        policy.risk_sensitivity = crate::models::Sensitivity::Paranoid;
        let strict = assess(&policy, &metadata, &ctx).unwrap();

        assert!(strict.score_0_100 == lax.score_0_100);
        assert!(strict.band as u8 >= lax.band as u8 || strict.decision != lax.decision);
    }
}
