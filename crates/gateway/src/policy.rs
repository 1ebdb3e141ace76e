//! Policy filter (C6): the ordered, short-circuiting gatekeeper chain from
//! §4.6. Every rejection logs `(sitekey, ip-hash, reason)` at `warn` and
//! returns a user-safe coarse error; callers never see which finer-grained
//! step actually tripped beyond the returned error code.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use moka::future::Cache;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::geofence::GeoFenceManager;
use crate::models::PolicyRecord;

/// Abstracts the VPN/proxy reputation signal so the filter's decision logic
/// doesn't hardcode a vendor (§SPEC_FULL C6) — a real integration is an
/// external collaborator per §1.
pub trait ReputationSource: Send + Sync {
    fn is_vpn_or_proxy(&self, ip: IpAddr) -> bool;
}

/// Always reports clean; a placeholder until a real feed is wired in.
pub struct NeverFlagged;

impl ReputationSource for NeverFlagged {
    fn is_vpn_or_proxy(&self, _ip: IpAddr) -> bool {
        false
    }
}

#[derive(Clone)]
struct IpCounterRecord {
    window_start: DateTime<Utc>,
    requests_in_window: u32,
    failure_count: u32,
    blocked_until: Option<DateTime<Utc>>,
}

impl Default for IpCounterRecord {
    fn default() -> Self {
        Self { window_start: Utc::now(), requests_in_window: 0, failure_count: 0, blocked_until: None }
    }
}

/// Per-fingerprint state (§2's glossary): `firstSeenAt`/`successCount`/
/// `failureCount`/`trustedUntil`. A fingerprint earns trust after
/// `TRUST_AFTER_SUCCESSES` clean verifies and loses it the moment a failure
/// is recorded; it gets banned the same way an IP gets locked out.
#[derive(Clone)]
struct FingerprintRecord {
    #[allow(dead_code)]
    first_seen_at: DateTime<Utc>,
    success_count: u32,
    failure_count: u32,
    trusted_until: Option<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

impl Default for FingerprintRecord {
    fn default() -> Self {
        Self {
            first_seen_at: Utc::now(),
            success_count: 0,
            failure_count: 0,
            trusted_until: None,
            blocked_until: None,
        }
    }
}

const TRUST_AFTER_SUCCESSES: u32 = 3;
const TRUST_TTL: chrono::Duration = chrono::Duration::hours(24);

pub struct PolicyFilter {
    geo: Arc<GeoFenceManager>,
    reputation: Arc<dyn ReputationSource>,
    ip_counters: Cache<String, Arc<tokio::sync::Mutex<IpCounterRecord>>>,
    fingerprints: Cache<String, Arc<tokio::sync::Mutex<FingerprintRecord>>>,
    /// Set of (fingerprint-or-ip) keys whose *next* `/challenge` issuance
    /// must select a hard variant, per spec.md §4.7's "`high` → require
    /// harder variant on next issuance". Entries are consumed on read.
    harder_next: Cache<String, ()>,
}

fn hash_ip(ip: IpAddr) -> String {
    hex::encode(Sha256::digest(ip.to_string().as_bytes()))
}

/// The key a "harder next challenge" flag is tracked under: the
/// fingerprint when one was submitted, otherwise the hashed IP. Used by
/// both `/verify` (to set the flag) and `/challenge` (to read it) so the
/// two agree on identity without a fingerprint always being present.
pub fn harder_next_key(fingerprint_hash: Option<&str>, ip: IpAddr) -> String {
    fingerprint_hash.map(str::to_string).unwrap_or_else(|| hash_ip(ip))
}

impl PolicyFilter {
    pub fn new(geo: Arc<GeoFenceManager>, reputation: Arc<dyn ReputationSource>) -> Self {
        Self {
            geo,
            reputation,
            ip_counters: Cache::builder().time_to_live(Duration::from_secs(2 * 60 * 60)).build(),
            fingerprints: Cache::builder().time_to_live(Duration::from_secs(7 * 24 * 60 * 60)).build(),
            harder_next: Cache::builder().time_to_live(Duration::from_secs(60 * 60)).build(),
        }
    }

    fn origin_allowed(policy: &PolicyRecord, origin: Option<&str>) -> bool {
        if policy.allowed_origins.iter().any(|o| o == "*") {
            return true;
        }
        let Some(origin) = origin else { return false };
        policy.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    fn ip_blocked(policy: &PolicyRecord, ip: IpAddr) -> bool {
        policy.blocked_ips.iter().any(|cidr| {
            cidr.parse::<IpNetwork>().map(|net| net.contains(ip)).unwrap_or(false)
        })
    }

    /// Runs the full ordered chain. `ip` must already be the caller's real
    /// address (proxy-stripping happens upstream of this filter).
    /// `fingerprint_hash` is the client-submitted fingerprint, already
    /// hashed by the caller; `None` skips the fingerprint-ban check.
    pub async fn check(
        &self,
        policy: &PolicyRecord,
        ip: IpAddr,
        origin: Option<&str>,
        fingerprint_hash: Option<&str>,
    ) -> Result<(), GatewayError> {
        let ip_hash = hash_ip(ip);

        if !Self::origin_allowed(policy, origin) {
            tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, "origin_mismatch");
            return Err(GatewayError::OriginMismatch);
        }

        if Self::ip_blocked(policy, ip) {
            tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, "ip_blocked");
            return Err(GatewayError::IpBlocked);
        }

        let country = self.geo.get_country_code(ip);
        if policy.blocked_countries.iter().any(|c| c == &country) {
            tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, country = %country, "country_blocked");
            return Err(GatewayError::CountryBlocked);
        }

        if policy.anti_vpn && self.reputation.is_vpn_or_proxy(ip) {
            tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, "vpn_detected");
            return Err(GatewayError::VpnDetected { remaining_time_minutes: None });
        }

        let counter = self
            .ip_counters
            .get_with(ip_hash.clone(), async { Arc::new(tokio::sync::Mutex::new(IpCounterRecord::default())) })
            .await;

        {
            let mut guard = counter.lock().await;
            let now = Utc::now();
            if now.signed_duration_since(guard.window_start) >= chrono::Duration::seconds(60) {
                guard.window_start = now;
                guard.requests_in_window = 0;
            }
            guard.requests_in_window += 1;
            if guard.requests_in_window > policy.rate_limit_max_requests {
                tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, "rate_limited");
                return Err(GatewayError::RateLimited);
            }

            if let Some(blocked_until) = guard.blocked_until {
                if now < blocked_until {
                    let remaining_minutes =
                        (blocked_until.signed_duration_since(now).num_seconds() + 59) / 60;
                    tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, "ip_locked");
                    return Err(GatewayError::IpLocked {
                        remaining_time_minutes: remaining_minutes.max(0) as u64,
                    });
                }
            }
        }

        if let Some(fingerprint_hash) = fingerprint_hash {
            if let Some(record) = self.fingerprints.get(fingerprint_hash).await {
                let guard = record.lock().await;
                if let Some(blocked_until) = guard.blocked_until {
                    if Utc::now() < blocked_until {
                        let remaining_minutes =
                            (blocked_until.signed_duration_since(Utc::now()).num_seconds() + 59) / 60;
                        tracing::warn!(sitekey = %policy.sitekey, ip_hash = %ip_hash, "fingerprint_locked");
                        return Err(GatewayError::IpLocked {
                            remaining_time_minutes: remaining_minutes.max(0) as u64,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether `fingerprint_hash` has been observed in a prior request at
    /// all — the novelty signal the risk scorer's fingerprint feature uses.
    pub async fn seen_fingerprint_before(&self, fingerprint_hash: &str) -> bool {
        self.fingerprints.get(fingerprint_hash).await.is_some()
    }

    /// Whether `fingerprint_hash` currently holds earned trust, i.e. is
    /// eligible for the `allowSkipForTrustedFingerprints` bypass.
    pub async fn is_fingerprint_trusted(&self, fingerprint_hash: &str) -> bool {
        match self.fingerprints.get(fingerprint_hash).await {
            Some(record) => {
                let guard = record.lock().await;
                guard.trusted_until.map(|t| Utc::now() < t).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Records a failed verify against `fingerprint_hash`: resets trust and,
    /// after `policy.consecutive_failure_threshold` failures, bans it for
    /// two hours — the same accounting `record_failure` does for IPs.
    pub async fn record_fingerprint_failure(&self, policy: &PolicyRecord, fingerprint_hash: &str) {
        let record = self
            .fingerprints
            .get_with(fingerprint_hash.to_string(), async {
                Arc::new(tokio::sync::Mutex::new(FingerprintRecord::default()))
            })
            .await;
        let mut guard = record.lock().await;
        guard.failure_count += 1;
        guard.trusted_until = None;
        if guard.failure_count >= policy.consecutive_failure_threshold {
            guard.blocked_until = Some(Utc::now() + chrono::Duration::hours(2));
        }
    }

    /// Records a successful verify against `fingerprint_hash`: clears the
    /// failure counter and, after `TRUST_AFTER_SUCCESSES` clean verifies,
    /// grants trust for `TRUST_TTL`.
    pub async fn record_fingerprint_success(&self, fingerprint_hash: &str) {
        let record = self
            .fingerprints
            .get_with(fingerprint_hash.to_string(), async {
                Arc::new(tokio::sync::Mutex::new(FingerprintRecord::default()))
            })
            .await;
        let mut guard = record.lock().await;
        guard.failure_count = 0;
        guard.success_count += 1;
        if guard.success_count >= TRUST_AFTER_SUCCESSES {
            guard.trusted_until = Some(Utc::now() + TRUST_TTL);
        }
    }

    /// Records a verification failure for `ip`; after
    /// `policy.consecutive_failure_threshold` consecutive failures within the
    /// window, locks the IP out for two hours (§4.8).
    pub async fn record_failure(&self, policy: &PolicyRecord, ip: IpAddr) {
        let ip_hash = hash_ip(ip);
        let counter = self
            .ip_counters
            .get_with(ip_hash, async { Arc::new(tokio::sync::Mutex::new(IpCounterRecord::default())) })
            .await;
        let mut guard = counter.lock().await;
        guard.failure_count += 1;
        if guard.failure_count >= policy.consecutive_failure_threshold {
            guard.blocked_until = Some(Utc::now() + chrono::Duration::hours(2));
        }
    }

    /// Clears the consecutive-failure counter for `ip` on a successful verify.
    pub async fn record_success(&self, ip: IpAddr) {
        let ip_hash = hash_ip(ip);
        if let Some(counter) = self.ip_counters.get(&ip_hash).await {
            let mut guard = counter.lock().await;
            guard.failure_count = 0;
        }
    }

    /// Flags `key` (see [`harder_next_key`]) so its next `/challenge`
    /// issuance is forced to a hard variant, per §4.7's `high`-band policy.
    pub async fn mark_harder_next(&self, key: &str) {
        self.harder_next.insert(key.to_string(), ()).await;
    }

    /// Consumes the "harder next" flag for `key`, if set. One-shot: a
    /// second call before the next `mark_harder_next` returns `false`.
    pub async fn take_harder_next(&self, key: &str) -> bool {
        let flagged = self.harder_next.get(key).await.is_some();
        if flagged {
            self.harder_next.invalidate(key).await;
        }
        flagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn filter() -> PolicyFilter {
        PolicyFilter::new(Arc::new(GeoFenceManager::new()), Arc::new(NeverFlagged))
    }

    #[tokio::test]
    async fn wildcard_origin_allows_anything() {
        let f = filter();
        let mut policy = PolicyRecord::default();
        policy.allowed_origins = vec!["*".to_string()];
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert!(f.check(&policy, ip, Some("https://anywhere.example"), None).await.is_ok());
    }

    #[tokio::test]
    async fn mismatched_origin_is_rejected() {
        let f = filter();
        let mut policy = PolicyRecord::default();
        policy.allowed_origins = vec!["https://good.example".to_string()];
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let result = f.check(&policy, ip, Some("https://evil.example"), None).await;
        assert!(matches!(result, Err(GatewayError::OriginMismatch)));
    }

    #[tokio::test]
    async fn cidr_blocked_ip_is_rejected() {
        let f = filter();
        let mut policy = PolicyRecord::default();
        policy.blocked_ips = vec!["10.0.0.0/8".to_string()];
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        let result = f.check(&policy, ip, None, None).await;
        assert!(matches!(result, Err(GatewayError::IpBlocked)));
    }

    #[tokio::test]
    async fn rate_limit_trips_on_the_n_plus_first_request() {
        let f = filter();
        let mut policy = PolicyRecord::default();
        policy.rate_limit_max_requests = 3;
        let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
        for _ in 0..3 {
            assert!(f.check(&policy, ip, None, None).await.is_ok());
        }
        assert!(matches!(f.check(&policy, ip, None, None).await, Err(GatewayError::RateLimited)));
    }

    #[tokio::test]
    async fn lockout_engages_after_consecutive_failure_threshold() {
        let f = filter();
        let mut policy = PolicyRecord::default();
        policy.consecutive_failure_threshold = 2;
        let ip = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

        f.record_failure(&policy, ip).await;
        assert!(f.check(&policy, ip, None, None).await.is_ok());
        f.record_failure(&policy, ip).await;
        assert!(matches!(f.check(&policy, ip, None, None).await, Err(GatewayError::IpLocked { .. })));
    }

    #[tokio::test]
    async fn fingerprint_earns_trust_after_enough_clean_verifies() {
        let f = filter();
        let fp = "fp-trusted";
        assert!(!f.is_fingerprint_trusted(fp).await);
        for _ in 0..TRUST_AFTER_SUCCESSES {
            f.record_fingerprint_success(fp).await;
        }
        assert!(f.is_fingerprint_trusted(fp).await);
    }

    #[tokio::test]
    async fn a_single_failure_revokes_earned_trust() {
        let f = filter();
        let policy = PolicyRecord::default();
        let fp = "fp-revoked";
        for _ in 0..TRUST_AFTER_SUCCESSES {
            f.record_fingerprint_success(fp).await;
        }
        assert!(f.is_fingerprint_trusted(fp).await);
        f.record_fingerprint_failure(&policy, fp).await;
        assert!(!f.is_fingerprint_trusted(fp).await);
    }

    #[tokio::test]
    async fn harder_next_flag_is_consumed_on_first_read() {
        let f = filter();
        let key = "fp-needs-hard-next";
        assert!(!f.take_harder_next(key).await);
        f.mark_harder_next(key).await;
        assert!(f.take_harder_next(key).await);
        assert!(!f.take_harder_next(key).await);
    }

    #[test]
    fn harder_next_key_prefers_fingerprint_over_ip() {
        let ip = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(harder_next_key(Some("fp-abc"), ip), "fp-abc");
        assert_eq!(harder_next_key(None, ip), hash_ip(ip));
    }

    #[tokio::test]
    async fn fingerprint_locks_out_after_consecutive_failure_threshold() {
        let f = filter();
        let mut policy = PolicyRecord::default();
        policy.consecutive_failure_threshold = 2;
        let ip = IpAddr::V4(Ipv4Addr::new(7, 7, 7, 7));
        let fp = "fp-banned";

        f.record_fingerprint_failure(&policy, fp).await;
        assert!(f.check(&policy, ip, None, Some(fp)).await.is_ok());
        f.record_fingerprint_failure(&policy, fp).await;
        assert!(matches!(
            f.check(&policy, ip, None, Some(fp)).await,
            Err(GatewayError::IpLocked { .. })
        ));
    }
}
