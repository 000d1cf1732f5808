//! ---
//! bastion_section: "04-admission-control"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Blocklist and bucketed rate limiting for request admission."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! Fixed-window request counting and the admission gate in front of it.
//!
//! Buckets are keyed by `(identity, floor(now / window))`. A bucket from an earlier
//! window can never be hit again because its key no longer matches, so eviction is
//! purely a memory concern and runs lazily every `sweep_every` admissions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bastion_common::config::RateLimitConfig;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::blocklist::Blocklist;

/// Machine-readable reason for a blocklisted identity.
pub const REASON_BLOCKLISTED: &str = "blocklisted";
/// Machine-readable reason when the blocklist could not be consulted.
pub const REASON_BLOCKLIST_UNAVAILABLE: &str = "blocklist_unavailable";

/// Result of asking whether a request may proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    /// Proceed.
    Admitted,
    /// Over the ceiling for the current window.
    RateLimited {
        /// Seconds until the window rolls over; always at least one.
        retry_after_secs: u64,
        /// Ceiling that was exceeded.
        limit: u32,
    },
    /// Refused outright.
    Blocked {
        /// Why, e.g. [`REASON_BLOCKLISTED`].
        reason: String,
    },
}

impl AdmissionOutcome {
    /// Stable reason code.
    pub fn reason(&self) -> &str {
        match self {
            AdmissionOutcome::Admitted => "admitted",
            AdmissionOutcome::RateLimited { .. } => "rate_limited",
            AdmissionOutcome::Blocked { reason } => reason,
        }
    }

    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted)
    }

    /// `Retry-After` for rate-limited outcomes.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionOutcome::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    identity: String,
    window_index: i64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    expires_at: DateTime<Utc>,
}

/// Per-identity request counter over fixed windows.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window_secs: i64,
    trusted: HashSet<String>,
    sweep_every: u64,
    buckets: DashMap<BucketKey, Bucket>,
    ceilings: DashMap<String, u32>,
    admissions: AtomicU64,
}

impl RateLimiter {
    /// Limiter configured from the `[rate_limit]` section.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window_secs: config.window.as_secs().max(1) as i64,
            trusted: config.trusted.iter().cloned().collect(),
            sweep_every: config.sweep_every.max(1),
            buckets: DashMap::new(),
            ceilings: DashMap::new(),
            admissions: AtomicU64::new(0),
        }
    }

    /// Whether `identity` bypasses limiting and blocking.
    pub fn is_trusted(&self, identity: &str) -> bool {
        self.trusted.contains(identity)
    }

    /// Effective ceiling for `identity`.
    pub fn ceiling_for(&self, identity: &str) -> u32 {
        self.ceilings
            .get(identity)
            .map(|ceiling| *ceiling)
            .unwrap_or(self.max_requests)
    }

    /// Install a lower (or higher) ceiling for one identity.
    pub fn set_ceiling(&self, identity: &str, max_requests: u32) {
        self.ceilings.insert(identity.to_owned(), max_requests.max(1));
    }

    /// Drop an identity's ceiling override. Returns `true` if one was set.
    pub fn clear_ceiling(&self, identity: &str) -> bool {
        self.ceilings.remove(identity).is_some()
    }

    fn window_index(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.window_secs)
    }

    fn window_end(&self, index: i64) -> DateTime<Utc> {
        Utc.timestamp_opt((index + 1) * self.window_secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Count one request from `identity` at `now`.
    pub fn check(&self, identity: &str, now: DateTime<Utc>) -> AdmissionOutcome {
        if self.is_trusted(identity) {
            return AdmissionOutcome::Admitted;
        }
        let index = self.window_index(now);
        let expires_at = self.window_end(index);
        let limit = self.ceiling_for(identity);

        // The entry guard holds the shard lock, so increment and read are one step.
        let count = {
            let mut bucket = self
                .buckets
                .entry(BucketKey {
                    identity: identity.to_owned(),
                    window_index: index,
                })
                .or_insert(Bucket {
                    count: 0,
                    expires_at,
                });
            bucket.count = bucket.count.saturating_add(1);
            bucket.count
        };

        let seen = self.admissions.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % self.sweep_every == 0 {
            self.sweep_expired(now);
        }

        if count > limit {
            let retry_after_secs = (expires_at - now).num_seconds().max(1) as u64;
            debug!(identity, count, limit, retry_after_secs, "rate limit exceeded");
            AdmissionOutcome::RateLimited {
                retry_after_secs,
                limit,
            }
        } else {
            AdmissionOutcome::Admitted
        }
    }

    /// Requests counted for `identity` in the window containing `now`.
    pub fn usage(&self, identity: &str, now: DateTime<Utc>) -> u32 {
        self.buckets
            .get(&BucketKey {
                identity: identity.to_owned(),
                window_index: self.window_index(now),
            })
            .map(|bucket| bucket.count)
            .unwrap_or(0)
    }

    /// Forget every bucket belonging to `identity`.
    pub fn reset(&self, identity: &str) {
        self.buckets.retain(|key, _| key.identity != identity);
    }

    /// Evict buckets whose window has ended. Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "expired rate limit buckets swept");
        }
        removed
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Blocklist check followed by rate limiting.
#[derive(Clone)]
pub struct AdmissionGate {
    limiter: Arc<RateLimiter>,
    blocklist: Arc<dyn Blocklist>,
}

impl AdmissionGate {
    /// Combine a limiter with a blocklist.
    pub fn new(limiter: Arc<RateLimiter>, blocklist: Arc<dyn Blocklist>) -> Self {
        Self { limiter, blocklist }
    }

    /// The limiter behind the gate.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide on one request. A blocklist failure refuses the request.
    pub async fn admit(&self, identity: &str, now: DateTime<Utc>) -> AdmissionOutcome {
        if !self.limiter.is_trusted(identity) {
            match self.blocklist.is_blocked(identity).await {
                Ok(true) => {
                    return AdmissionOutcome::Blocked {
                        reason: REASON_BLOCKLISTED.to_owned(),
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    error!(identity, error = %err, "blocklist check failed; refusing request");
                    return AdmissionOutcome::Blocked {
                        reason: REASON_BLOCKLIST_UNAVAILABLE.to_owned(),
                    };
                }
            }
        }
        self.limiter.check(identity, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::{BlockEntry, BlocklistError, InMemoryBlocklist};
    use async_trait::async_trait;

    fn config(max_requests: u32, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(window_secs),
            throttled_max_requests: 1,
            sweep_every: 1_000_000,
            ..RateLimitConfig::default()
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_710_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn ceiling_admissions_then_limited() {
        let limiter = RateLimiter::new(&config(3, 60));
        // 1_710_000_000 is a multiple of 60.
        for _ in 0..3 {
            assert!(limiter.check("10.0.0.9", at(10)).is_admitted());
        }
        let outcome = limiter.check("10.0.0.9", at(10));
        assert_eq!(
            outcome,
            AdmissionOutcome::RateLimited {
                retry_after_secs: 50,
                limit: 3
            }
        );
        assert_eq!(outcome.reason(), "rate_limited");
        assert_eq!(limiter.usage("10.0.0.9", at(10)), 4);
        assert!(limiter.check("10.0.0.9", at(60)).is_admitted());
        assert!(limiter.check("10.0.0.10", at(10)).is_admitted());
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(&config(1, 60));
        let late = at(59) + chrono::Duration::milliseconds(900);
        limiter.check("x", late);
        assert_eq!(limiter.check("x", late).retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn trusted_identities_bypass_limiting() {
        let limiter = RateLimiter::new(&config(1, 60));
        for _ in 0..10 {
            assert!(limiter.check("127.0.0.1", at(0)).is_admitted());
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn ceiling_overrides_apply_per_identity() {
        let limiter = RateLimiter::new(&config(5, 60));
        limiter.set_ceiling("10.0.0.7", 1);
        assert!(limiter.check("10.0.0.7", at(0)).is_admitted());
        assert!(!limiter.check("10.0.0.7", at(0)).is_admitted());
        assert!(limiter.clear_ceiling("10.0.0.7"));
        assert!(limiter.check("10.0.0.7", at(0)).is_admitted());
        limiter.reset("10.0.0.7");
        assert_eq!(limiter.usage("10.0.0.7", at(0)), 0);
    }

    #[test]
    fn sweep_drops_only_expired_buckets() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            sweep_every: 3,
            ..config(10, 60)
        });
        limiter.check("a", at(0));
        limiter.check("b", at(0));
        assert_eq!(limiter.bucket_count(), 2);
        // Third admission lands in the next window and triggers the sweep.
        limiter.check("a", at(61));
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.usage("a", at(61)), 1);
    }

    #[test]
    fn concurrent_checks_do_not_lose_updates() {
        let limiter = RateLimiter::new(&config(10_000, 600));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        limiter.check("10.1.1.1", at(5));
                    }
                });
            }
        });
        assert_eq!(limiter.usage("10.1.1.1", at(5)), 2_000);
    }

    struct FailingBlocklist;

    #[async_trait]
    impl Blocklist for FailingBlocklist {
        async fn is_blocked(&self, _identity: &str) -> Result<bool, BlocklistError> {
            Err(BlocklistError::Unavailable("connection refused".into()))
        }
        async fn block(
            &self,
            _identity: &str,
            _reason: &str,
            _at: DateTime<Utc>,
        ) -> Result<bool, BlocklistError> {
            Err(BlocklistError::Unavailable("connection refused".into()))
        }
        async fn unblock(&self, _identity: &str) -> Result<bool, BlocklistError> {
            Err(BlocklistError::Unavailable("connection refused".into()))
        }
        async fn entries(&self) -> Result<Vec<BlockEntry>, BlocklistError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn gate_blocks_before_counting() {
        let blocklist = Arc::new(InMemoryBlocklist::default());
        let limiter = Arc::new(RateLimiter::new(&config(100, 60)));
        let gate = AdmissionGate::new(limiter, blocklist.clone());
        blocklist.block("10.0.0.5", "test", at(0)).await.unwrap();
        let outcome = gate.admit("10.0.0.5", at(0)).await;
        assert_eq!(outcome.reason(), REASON_BLOCKLISTED);
        assert_eq!(gate.limiter().usage("10.0.0.5", at(0)), 0);
        assert!(gate.admit("10.0.0.6", at(0)).await.is_admitted());
    }

    #[tokio::test]
    async fn gate_fails_closed_when_blocklist_is_down() {
        let gate = AdmissionGate::new(
            Arc::new(RateLimiter::new(&config(100, 60))),
            Arc::new(FailingBlocklist),
        );
        assert_eq!(
            gate.admit("10.0.0.6", at(0)).await.reason(),
            REASON_BLOCKLIST_UNAVAILABLE
        );
        assert!(gate.admit("127.0.0.1", at(0)).await.is_admitted());
    }
}
