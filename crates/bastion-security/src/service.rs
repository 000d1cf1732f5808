//! ---
//! bastion_section: "01-core-functionality"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Facade wiring the security decision components together."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! One [`SecurityCore`] per process owns the policy set, the admission gate, the
//! detector worker, and the MFA registry. Collaborators (event log, blocklist,
//! notification sink, clock) are injected through [`SecurityCoreBuilder`].

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use bastion_common::config::AppConfig;
use bastion_common::time::{Clock, SystemClock};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::{AlertBook, AlertCallback, AlertError, CallbackRegistry, SecurityAlert};
use crate::attributes::DecisionContext;
use crate::audit::FileEventLog;
use crate::blocklist::{BlockEntry, Blocklist, BlocklistError, InMemoryBlocklist};
use crate::detector::{DetectorHandle, PatternDetector};
use crate::evaluator::{Decision, PolicyEvaluationResult, PolicyEvaluator};
use crate::events::{
    event_types, EventDraft, EventLog, EventLogError, InMemoryEventLog, SecurityEvent, Severity,
};
use crate::metrics::SecurityMetrics;
use crate::mfa::{MfaEnrollment, MfaError, MfaRegistry};
use crate::notify::{LogNotifier, NotificationSink};
use crate::patterns::{canonical, SecurityPattern};
use crate::rate_limit::{AdmissionGate, AdmissionOutcome, RateLimiter};
use crate::response::{Countermeasures, ResponseExecutor};
use crate::totp;

/// Collects collaborators before the core is started.
pub struct SecurityCoreBuilder {
    config: AppConfig,
    clock: Option<Arc<dyn Clock>>,
    event_log: Option<Arc<dyn EventLog>>,
    blocklist: Option<Arc<dyn Blocklist>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    metrics: Option<SecurityMetrics>,
    patterns: Option<Vec<SecurityPattern>>,
}

impl SecurityCoreBuilder {
    /// Start from configuration; every collaborator has a default.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: None,
            event_log: None,
            blocklist: None,
            notifier: None,
            metrics: None,
            patterns: None,
        }
    }

    /// Time source; [`SystemClock`] by default.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Event store; file-backed when `[event_log] path` is set, in memory otherwise.
    pub fn event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Blocklist store; in memory, seeded from `[rate_limit] static_blocklist`, by default.
    pub fn blocklist(mut self, blocklist: Arc<dyn Blocklist>) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    /// Alert delivery; [`LogNotifier`] by default.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Prometheus counters; disabled by default.
    pub fn metrics(mut self, metrics: SecurityMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Detection patterns; the canonical five by default.
    pub fn patterns(mut self, patterns: Vec<SecurityPattern>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    /// Wire everything and spawn the detector task. Must run inside a tokio runtime.
    pub fn build(self) -> Result<SecurityCore> {
        let config = self.config;
        config.validate()?;
        let zone = config.detector.local_zone()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let event_log: Arc<dyn EventLog> = match (self.event_log, &config.event_log.path) {
            (Some(log), _) => log,
            (None, Some(path)) => Arc::new(
                FileEventLog::open(path)
                    .with_context(|| format!("unable to open event log {}", path.display()))?,
            ),
            (None, None) => Arc::new(InMemoryEventLog::new()),
        };
        let blocklist = self.blocklist.unwrap_or_else(|| {
            Arc::new(InMemoryBlocklist::new(
                config.rate_limit.static_blocklist.iter().cloned(),
            ))
        });
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let evaluator = Arc::new(PolicyEvaluator::new(zone));
        if let Some(path) = &config.policies.path {
            let document = fs::read_to_string(path)
                .with_context(|| format!("unable to read policy file {}", path.display()))?;
            let loaded = evaluator
                .load_json(&document)
                .with_context(|| format!("invalid policy file {}", path.display()))?;
            info!(policies = loaded, path = %path.display(), "policies loaded");
        }

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let gate = AdmissionGate::new(limiter.clone(), blocklist.clone());
        let countermeasures = Arc::new(Countermeasures::default());
        let mfa = Arc::new(MfaRegistry::new(&config.totp));
        let alerts = Arc::new(AlertBook::default());
        let callbacks = Arc::new(CallbackRegistry::default());

        let responder = Arc::new(ResponseExecutor::new(
            blocklist.clone(),
            limiter.clone(),
            countermeasures.clone(),
            mfa.clone(),
            notifier,
            event_log.clone(),
            config.rate_limit.throttled_max_requests,
        ));
        let patterns: Vec<SecurityPattern> = self
            .patterns
            .unwrap_or_else(|| canonical(&config.detector.suspicious_agents))
            .into_iter()
            .filter(|pattern| !config.detector.disabled_patterns.contains(&pattern.id))
            .collect();
        info!(patterns = patterns.len(), "pattern detector configured");
        let detector = Arc::new(PatternDetector::new(
            patterns,
            event_log.clone(),
            responder,
            callbacks.clone(),
            alerts.clone(),
            self.metrics.clone(),
            clock.clone(),
            zone,
            config.detector.query_timeout,
        ));
        let worker = DetectorHandle::spawn(detector.clone());

        Ok(SecurityCore {
            config,
            clock,
            evaluator,
            gate,
            limiter,
            blocklist,
            event_log,
            detector,
            worker,
            mfa,
            countermeasures,
            alerts,
            callbacks,
            metrics: self.metrics,
        })
    }
}

/// Entry point for request handling code.
pub struct SecurityCore {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    evaluator: Arc<PolicyEvaluator>,
    gate: AdmissionGate,
    limiter: Arc<RateLimiter>,
    blocklist: Arc<dyn Blocklist>,
    event_log: Arc<dyn EventLog>,
    detector: Arc<PatternDetector>,
    worker: DetectorHandle,
    mfa: Arc<MfaRegistry>,
    countermeasures: Arc<Countermeasures>,
    alerts: Arc<AlertBook>,
    callbacks: Arc<CallbackRegistry>,
    metrics: Option<SecurityMetrics>,
}

impl SecurityCore {
    /// Builder seeded with `config`.
    pub fn builder(config: AppConfig) -> SecurityCoreBuilder {
        SecurityCoreBuilder::new(config)
    }

    /// Effective configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Policy administration.
    pub fn policies(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// Rate limiter, for ceiling administration.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Pattern detector, for pattern administration.
    pub fn detector(&self) -> &PatternDetector {
        &self.detector
    }

    /// MFA enrollment registry.
    pub fn mfa(&self) -> &MfaRegistry {
        &self.mfa
    }

    /// Flags installed by response actions.
    pub fn countermeasures(&self) -> &Countermeasures {
        &self.countermeasures
    }

    /// Evaluate an access request. `mfaEnabled` on the subject is taken from the
    /// MFA registry, whatever the caller supplied.
    pub fn evaluate_policy(&self, context: &DecisionContext) -> PolicyEvaluationResult {
        let mut context = context.clone();
        context.subject.mfa_enabled = self.mfa.is_enabled(&context.subject.id);
        let result = self.evaluator.evaluate(&context);
        if let Some(metrics) = &self.metrics {
            metrics.observe_evaluation(result.decision == Decision::Deny);
        }
        result
    }

    /// Gate one request from `identity`. Refusals are recorded as security events.
    pub async fn admit_request(&self, identity: &str) -> AdmissionOutcome {
        let outcome = self.gate.admit(identity, self.clock.now()).await;
        let draft = match &outcome {
            AdmissionOutcome::Admitted => return outcome,
            AdmissionOutcome::Blocked { reason } => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_blocked();
                }
                EventDraft::new(event_types::BLOCKED_IP_ACCESS_ATTEMPT, Severity::Medium)
                    .with_source_ip(identity)
                    .with_details(json!({ "reason": reason }))
            }
            AdmissionOutcome::RateLimited {
                retry_after_secs,
                limit,
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_rate_limited();
                }
                EventDraft::new(event_types::RATE_LIMIT_EXCEEDED, Severity::Medium)
                    .with_source_ip(identity)
                    .with_details(json!({ "limit": limit, "retry_after": retry_after_secs }))
            }
        };
        if let Err(err) = self.record_and_analyze(draft).await {
            warn!(identity, error = %err, "failed to record admission refusal");
        }
        outcome
    }

    /// Record an event and queue it for pattern analysis.
    pub async fn record_and_analyze(
        &self,
        draft: EventDraft,
    ) -> Result<SecurityEvent, EventLogError> {
        let event = self.event_log.record(draft, self.clock.now()).await?;
        if let Some(metrics) = &self.metrics {
            metrics.inc_event();
        }
        self.worker.submit(event.clone());
        Ok(event)
    }

    /// Fresh Base32 TOTP secret.
    pub fn generate_totp_secret(&self) -> String {
        totp::generate_secret()
    }

    /// Current code for `secret`.
    pub fn generate_totp_code(&self, secret: &str) -> String {
        totp::generate_code(secret, self.clock.now())
    }

    /// Verify `code` against `secret` with the configured drift tolerance.
    pub fn verify_totp_code(&self, secret: &str, code: &str) -> bool {
        let valid = totp::verify_code(
            secret,
            code,
            self.clock.now(),
            self.config.totp.tolerance_steps,
        );
        if !valid {
            if let Some(metrics) = &self.metrics {
                metrics.inc_totp_failure();
            }
        }
        valid
    }

    /// Start MFA enrollment for a user.
    pub fn enroll_mfa(&self, user_id: &str) -> Result<MfaEnrollment, MfaError> {
        self.mfa.enroll(user_id, self.clock.now())
    }

    /// Activate a pending MFA enrollment.
    pub fn confirm_mfa(&self, user_id: &str, code: &str) -> Result<(), MfaError> {
        let result = self.mfa.confirm(user_id, code, self.clock.now());
        if matches!(result, Err(MfaError::InvalidCode)) {
            if let Some(metrics) = &self.metrics {
                metrics.inc_totp_failure();
            }
        }
        result
    }

    /// Check a second factor; the result is what the caller puts in `mfaVerified`.
    pub fn verify_mfa(&self, user_id: &str, code: &str) -> Result<bool, MfaError> {
        let valid = self.mfa.verify(user_id, code, self.clock.now())?;
        if !valid {
            if let Some(metrics) = &self.metrics {
                metrics.inc_totp_failure();
            }
        }
        Ok(valid)
    }

    /// Block an identity by hand.
    pub async fn block(&self, identity: &str, reason: &str) -> Result<bool, BlocklistError> {
        self.blocklist.block(identity, reason, self.clock.now()).await
    }

    /// Lift a dynamic block.
    pub async fn unblock(&self, identity: &str) -> Result<bool, BlocklistError> {
        self.blocklist.unblock(identity).await
    }

    /// Current blocklist.
    pub async fn blocked_entries(&self) -> Result<Vec<BlockEntry>, BlocklistError> {
        self.blocklist.entries().await
    }

    /// Alerts raised so far.
    pub fn alerts(&self, active_only: bool) -> Vec<SecurityAlert> {
        self.alerts.list(active_only)
    }

    /// Close an alert.
    pub fn resolve_alert(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<SecurityAlert, AlertError> {
        let alert = self.alerts.resolve(id, resolved_by, notes, self.clock.now())?;
        info!(alert_id = %id, resolved_by, "alert resolved");
        Ok(alert)
    }

    /// Add a synchronous alert callback.
    pub fn register_alert_callback(&self, callback: Arc<dyn AlertCallback>) {
        self.callbacks.register(callback);
    }

    /// Wait for the detector to analyze everything submitted so far.
    pub async fn drain(&self) {
        self.worker.drain().await;
    }

    /// Finish queued analysis and stop the detector.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
        info!("security core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_common::time::ManualClock;
    use chrono::{TimeZone, Utc};
    use prometheus::Registry;

    fn core_with(config: AppConfig) -> (SecurityCore, Arc<ManualClock>, Arc<InMemoryEventLog>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap(),
        ));
        let log = Arc::new(InMemoryEventLog::new());
        let core = SecurityCore::builder(config)
            .clock(clock.clone())
            .event_log(log.clone())
            .build()
            .unwrap();
        (core, clock, log)
    }

    #[tokio::test]
    async fn refusals_are_recorded() {
        let mut config = AppConfig::default();
        config.rate_limit.max_requests = 1;
        config.rate_limit.throttled_max_requests = 1;
        config.rate_limit.static_blocklist = vec!["203.0.113.9".into()];
        let (core, _clock, log) = core_with(config);

        assert!(core.admit_request("10.0.0.1").await.is_admitted());
        assert_eq!(log.len(), 0);
        assert_eq!(core.admit_request("10.0.0.1").await.reason(), "rate_limited");
        assert_eq!(core.admit_request("203.0.113.9").await.reason(), "blocklisted");
        let types: Vec<String> = log.snapshot().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                event_types::RATE_LIMIT_EXCEEDED.to_string(),
                event_types::BLOCKED_IP_ACCESS_ATTEMPT.to_string()
            ]
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn subject_mfa_flag_comes_from_registry() {
        let (core, _clock, _log) = core_with(AppConfig::default());
        core.policies()
            .load_json(
                r#"[{"id": "mfa-only", "name": "mfa only", "subject": {"mfaEnabled": true},
                     "action": "read", "effect": "allow"}]"#,
            )
            .unwrap();
        let context: DecisionContext = serde_json::from_value(json!({
            "subject": {"id": "alice", "mfaEnabled": true},
            "resource": {"type": "report"},
            "action": "read",
            "environment": {"time": "2024-03-04T10:00:00Z"}
        }))
        .unwrap();
        assert!(!core.evaluate_policy(&context).is_allowed());

        let enrollment = core.enroll_mfa("alice").unwrap();
        let code = core.generate_totp_code(&enrollment.secret);
        core.confirm_mfa("alice", &code).unwrap();
        assert!(core.evaluate_policy(&context).is_allowed());
        assert!(core.verify_mfa("alice", &code).unwrap());
    }

    #[tokio::test]
    async fn disabled_patterns_are_skipped_and_metrics_count() {
        let mut config = AppConfig::default();
        config.detector.disabled_patterns = vec!["off_hours_access".into()];
        let registry = Arc::new(Registry::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 23, 0, 0).unwrap(),
        ));
        let core = SecurityCore::builder(config)
            .clock(clock)
            .metrics(SecurityMetrics::new(registry.clone()).unwrap())
            .build()
            .unwrap();
        assert_eq!(core.detector().patterns().len(), 4);

        core.record_and_analyze(
            EventDraft::new(event_types::SUCCESSFUL_LOGIN, Severity::Low).with_subject("night-owl"),
        )
        .await
        .unwrap();
        core.drain().await;
        assert!(core.alerts(false).is_empty());
        assert!(!core.verify_totp_code(&core.generate_totp_secret(), "abc"));

        let families = registry.gather();
        let value = |name: &str| {
            families
                .iter()
                .find(|family| family.get_name() == name)
                .map(|family| family.get_metric()[0].get_counter().get_value())
        };
        assert_eq!(value("security_events_total"), Some(1.0));
        assert_eq!(value("totp_failures_total"), Some(1.0));
    }
}
