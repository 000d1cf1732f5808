//! ---
//! bastion_section: "07-observability"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Prometheus counters for security decisions."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Security decision metrics exported via Prometheus.
#[derive(Clone)]
pub struct SecurityMetrics {
    registry: Arc<Registry>,
    policy_evaluations_total: IntCounter,
    policy_denials_total: IntCounter,
    admissions_blocked_total: IntCounter,
    admissions_rate_limited_total: IntCounter,
    security_events_total: IntCounter,
    security_alerts_total: IntCounterVec,
    totp_failures_total: IntCounter,
}

impl SecurityMetrics {
    /// Register metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> anyhow::Result<Self> {
        let policy_evaluations_total =
            IntCounter::new("policy_evaluations_total", "Access decisions evaluated")?;
        let policy_denials_total =
            IntCounter::new("policy_denials_total", "Access decisions that denied")?;
        let admissions_blocked_total = IntCounter::new(
            "admissions_blocked_total",
            "Requests refused because the source is blocked",
        )?;
        let admissions_rate_limited_total = IntCounter::new(
            "admissions_rate_limited_total",
            "Requests refused for exceeding the rate ceiling",
        )?;
        let security_events_total =
            IntCounter::new("security_events_total", "Security events recorded")?;
        let security_alerts_total = IntCounterVec::new(
            Opts::new("security_alerts_total", "Alerts raised by the pattern detector"),
            &["pattern"],
        )?;
        let totp_failures_total =
            IntCounter::new("totp_failures_total", "One-time codes that failed to verify")?;

        registry.register(Box::new(policy_evaluations_total.clone()))?;
        registry.register(Box::new(policy_denials_total.clone()))?;
        registry.register(Box::new(admissions_blocked_total.clone()))?;
        registry.register(Box::new(admissions_rate_limited_total.clone()))?;
        registry.register(Box::new(security_events_total.clone()))?;
        registry.register(Box::new(security_alerts_total.clone()))?;
        registry.register(Box::new(totp_failures_total.clone()))?;

        Ok(Self {
            registry,
            policy_evaluations_total,
            policy_denials_total,
            admissions_blocked_total,
            admissions_rate_limited_total,
            security_events_total,
            security_alerts_total,
            totp_failures_total,
        })
    }

    /// Access the underlying registry.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Count one policy evaluation and whether it denied.
    pub fn observe_evaluation(&self, denied: bool) {
        self.policy_evaluations_total.inc();
        if denied {
            self.policy_denials_total.inc();
        }
    }

    /// Count a blocked admission.
    pub fn inc_blocked(&self) {
        self.admissions_blocked_total.inc();
    }

    /// Count a rate-limited admission.
    pub fn inc_rate_limited(&self) {
        self.admissions_rate_limited_total.inc();
    }

    /// Count a recorded event.
    pub fn inc_event(&self) {
        self.security_events_total.inc();
    }

    /// Count an alert for `pattern`.
    pub fn inc_alert(&self, pattern: &str) {
        self.security_alerts_total.with_label_values(&[pattern]).inc();
    }

    /// Count a failed one-time code.
    pub fn inc_totp_failure(&self) {
        self.totp_failures_total.inc();
    }
}
