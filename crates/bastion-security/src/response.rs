//! ---
//! bastion_section: "06-anomaly-detection"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Pattern detection, alerting, and automated response."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! Automated countermeasures attached to alerts.
//!
//! Each action is idempotent and runs in isolation: a failure is logged and audited,
//! and the remaining actions of the alert still run.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::alerts::SecurityAlert;
use crate::blocklist::{Blocklist, BlocklistError};
use crate::events::{event_types, EventDraft, EventLog, Severity};
use crate::mfa::MfaRegistry;
use crate::notify::NotificationSink;
use crate::rate_limit::RateLimiter;

/// Response an alert can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Add the alert's source address to the blocklist.
    BlockIp,
    /// Add the alert's subject to the blocklist.
    BlockUser,
    /// Send the alert to the notification sink.
    NotifyAdmin,
    /// Flag the source for closer monitoring.
    IncreaseMonitoring,
    /// Flag the source as needing a CAPTCHA.
    RequireCaptcha,
    /// Force MFA on the alert's subject.
    RequireMfa,
    /// Install the throttled ceiling for the source.
    RateLimit,
    /// Flag the subject's permissions for review.
    AuditPermissions,
}

impl ResponseAction {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::BlockIp => "block_ip",
            ResponseAction::BlockUser => "block_user",
            ResponseAction::NotifyAdmin => "notify_admin",
            ResponseAction::IncreaseMonitoring => "increase_monitoring",
            ResponseAction::RequireCaptcha => "require_captcha",
            ResponseAction::RequireMfa => "require_mfa",
            ResponseAction::RateLimit => "rate_limit",
            ResponseAction::AuditPermissions => "audit_permissions",
        }
    }
}

impl fmt::Display for ResponseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| format!("unknown response action: {s}"))
    }
}

/// Flags kept by [`Countermeasures`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Countermeasure {
    /// Source under increased monitoring.
    IncreasedMonitoring,
    /// Source must solve a CAPTCHA.
    Captcha,
    /// Subject's permissions are under review.
    PermissionAudit,
}

/// Identity flags installed by response actions and cleared by administrators.
#[derive(Debug, Default)]
pub struct Countermeasures {
    flags: RwLock<HashMap<Countermeasure, HashSet<String>>>,
}

impl Countermeasures {
    /// Set a flag. Returns `false` if it was already set.
    pub fn flag(&self, kind: Countermeasure, identity: &str) -> bool {
        self.flags
            .write()
            .entry(kind)
            .or_default()
            .insert(identity.to_owned())
    }

    /// Whether a flag is set.
    pub fn is_flagged(&self, kind: Countermeasure, identity: &str) -> bool {
        self.flags
            .read()
            .get(&kind)
            .is_some_and(|set| set.contains(identity))
    }

    /// Clear a flag. Returns `true` if it was set.
    pub fn clear(&self, kind: Countermeasure, identity: &str) -> bool {
        self.flags
            .write()
            .get_mut(&kind)
            .is_some_and(|set| set.remove(identity))
    }

    /// Identities carrying `kind`, sorted.
    pub fn flagged(&self, kind: Countermeasure) -> Vec<String> {
        let mut identities: Vec<String> = self
            .flags
            .read()
            .get(&kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        identities.sort();
        identities
    }
}

/// Why an action could not run.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// The alert lacks the identity the action targets.
    #[error("{action} needs a {field} on the alert")]
    MissingTarget {
        /// Action that failed.
        action: ResponseAction,
        /// Alert field that was empty.
        field: &'static str,
    },
    /// The blocklist store failed.
    #[error(transparent)]
    Blocklist(#[from] BlocklistError),
    /// The notification sink failed.
    #[error("notification failed: {0}")]
    Notification(String),
}

/// What an action did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Action that ran.
    pub action: ResponseAction,
    /// Identity the action targeted, if any.
    pub target: Option<String>,
    /// `false` when the action was a no-op because the state already held.
    pub changed: bool,
}

/// Runs the response actions of an alert against the shared security state.
pub struct ResponseExecutor {
    blocklist: Arc<dyn Blocklist>,
    limiter: Arc<RateLimiter>,
    countermeasures: Arc<Countermeasures>,
    mfa: Arc<MfaRegistry>,
    notifier: Arc<dyn NotificationSink>,
    event_log: Arc<dyn EventLog>,
    throttled_max_requests: u32,
}

impl ResponseExecutor {
    /// Wire the executor to the state it mutates.
    pub fn new(
        blocklist: Arc<dyn Blocklist>,
        limiter: Arc<RateLimiter>,
        countermeasures: Arc<Countermeasures>,
        mfa: Arc<MfaRegistry>,
        notifier: Arc<dyn NotificationSink>,
        event_log: Arc<dyn EventLog>,
        throttled_max_requests: u32,
    ) -> Self {
        Self {
            blocklist,
            limiter,
            countermeasures,
            mfa,
            notifier,
            event_log,
            throttled_max_requests,
        }
    }

    /// Run every action of `alert` in order and audit each one.
    pub async fn run_all(
        &self,
        alert: &SecurityAlert,
        now: DateTime<Utc>,
    ) -> Vec<Result<ActionReport, ResponseError>> {
        let mut results = Vec::with_capacity(alert.actions.len());
        for &action in &alert.actions {
            let result = self.execute(action, alert, now).await;
            match &result {
                Ok(report) => debug!(
                    alert_id = %alert.id,
                    action = %action,
                    target = report.target.as_deref().unwrap_or("-"),
                    changed = report.changed,
                    "response action executed"
                ),
                Err(err) => error!(
                    alert_id = %alert.id,
                    action = %action,
                    error = %err,
                    "response action failed"
                ),
            }
            self.audit(alert, action, &result, now).await;
            results.push(result);
        }
        results
    }

    /// Run one action.
    pub async fn execute(
        &self,
        action: ResponseAction,
        alert: &SecurityAlert,
        now: DateTime<Utc>,
    ) -> Result<ActionReport, ResponseError> {
        let reason = format!("{} alert {}", alert.alert_type, alert.id);
        let (target, changed) = match action {
            ResponseAction::BlockIp => {
                let ip = require(action, "source_ip", alert.source_ip.as_deref())?;
                (Some(ip), self.blocklist.block(ip, &reason, now).await?)
            }
            ResponseAction::BlockUser => {
                let user = require(action, "subject_id", alert.subject_id.as_deref())?;
                (Some(user), self.blocklist.block(user, &reason, now).await?)
            }
            ResponseAction::NotifyAdmin => {
                self.notifier
                    .notify(alert)
                    .await
                    .map_err(|err| ResponseError::Notification(format!("{err:#}")))?;
                (None, true)
            }
            ResponseAction::IncreaseMonitoring => {
                let who = require(action, "source_ip or subject_id", source_or_subject(alert))?;
                let changed = self
                    .countermeasures
                    .flag(Countermeasure::IncreasedMonitoring, who);
                (Some(who), changed)
            }
            ResponseAction::RequireCaptcha => {
                let who = require(action, "source_ip or subject_id", source_or_subject(alert))?;
                (Some(who), self.countermeasures.flag(Countermeasure::Captcha, who))
            }
            ResponseAction::RequireMfa => {
                let user = require(action, "subject_id", alert.subject_id.as_deref())?;
                (Some(user), self.mfa.force(user, now))
            }
            ResponseAction::RateLimit => {
                let who = require(action, "source_ip or subject_id", source_or_subject(alert))?;
                let changed = self.limiter.ceiling_for(who) != self.throttled_max_requests;
                self.limiter.set_ceiling(who, self.throttled_max_requests);
                (Some(who), changed)
            }
            ResponseAction::AuditPermissions => {
                let user = require(action, "subject_id", alert.subject_id.as_deref())?;
                let changed = self
                    .countermeasures
                    .flag(Countermeasure::PermissionAudit, user);
                (Some(user), changed)
            }
        };
        if changed {
            info!(action = %action, target = target.unwrap_or("-"), "countermeasure applied");
        }
        Ok(ActionReport {
            action,
            target: target.map(str::to_owned),
            changed,
        })
    }

    async fn audit(
        &self,
        alert: &SecurityAlert,
        action: ResponseAction,
        result: &Result<ActionReport, ResponseError>,
        now: DateTime<Utc>,
    ) {
        let details = match result {
            Ok(report) => json!({
                "alert_id": alert.id,
                "pattern": alert.pattern_id,
                "action": action,
                "target": report.target,
                "changed": report.changed,
                "status": "ok",
            }),
            Err(err) => json!({
                "alert_id": alert.id,
                "pattern": alert.pattern_id,
                "action": action,
                "status": "failed",
                "error": err.to_string(),
            }),
        };
        // The target lives in details so audit records never feed source-keyed patterns.
        let draft = EventDraft::new(event_types::SECURITY_ACTION_EXECUTED, Severity::Low)
            .with_action(action.as_str())
            .with_details(details);
        if let Err(err) = self.event_log.record(draft, now).await {
            warn!(action = %action, error = %err, "failed to record response action");
        }
    }
}

fn source_or_subject(alert: &SecurityAlert) -> Option<&str> {
    alert
        .source_ip
        .as_deref()
        .or(alert.subject_id.as_deref())
}

fn require<'a>(
    action: ResponseAction,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ResponseError> {
    value.ok_or(ResponseError::MissingTarget { action, field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertType;
    use crate::blocklist::InMemoryBlocklist;
    use crate::events::{EventFilter, InMemoryEventLog};
    use async_trait::async_trait;
    use bastion_common::config::{RateLimitConfig, TotpConfig};
    use uuid::Uuid;

    struct FailingNotifier;

    #[async_trait]
    impl NotificationSink for FailingNotifier {
        async fn notify(&self, _alert: &SecurityAlert) -> anyhow::Result<()> {
            anyhow::bail!("smtp relay down")
        }
    }

    struct Fixture {
        executor: ResponseExecutor,
        blocklist: Arc<InMemoryBlocklist>,
        limiter: Arc<RateLimiter>,
        countermeasures: Arc<Countermeasures>,
        mfa: Arc<MfaRegistry>,
        log: Arc<InMemoryEventLog>,
    }

    fn fixture() -> Fixture {
        let blocklist = Arc::new(InMemoryBlocklist::default());
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        let countermeasures = Arc::new(Countermeasures::default());
        let mfa = Arc::new(MfaRegistry::new(&TotpConfig::default()));
        let log = Arc::new(InMemoryEventLog::new());
        let executor = ResponseExecutor::new(
            blocklist.clone(),
            limiter.clone(),
            countermeasures.clone(),
            mfa.clone(),
            Arc::new(FailingNotifier),
            log.clone(),
            10,
        );
        Fixture {
            executor,
            blocklist,
            limiter,
            countermeasures,
            mfa,
            log,
        }
    }

    fn alert(source_ip: Option<&str>, subject_id: Option<&str>) -> SecurityAlert {
        SecurityAlert {
            id: Uuid::new_v4(),
            pattern_id: "test".into(),
            alert_type: AlertType::SuspiciousPattern,
            severity: Severity::High,
            title: "test".into(),
            description: "test".into(),
            subject_id: subject_id.map(str::to_owned),
            source_ip: source_ip.map(str::to_owned),
            correlation_key: source_ip.map(str::to_owned),
            timestamp: Utc::now(),
            trigger_event: 1,
            matched_events: 1,
            actions: Vec::new(),
            active: true,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }

    #[tokio::test]
    async fn failures_do_not_stop_sibling_actions() {
        let f = fixture();
        let mut raised = alert(Some("10.0.0.5"), None);
        raised.actions = vec![
            ResponseAction::NotifyAdmin,
            ResponseAction::BlockUser,
            ResponseAction::BlockIp,
            ResponseAction::RateLimit,
            ResponseAction::IncreaseMonitoring,
        ];
        let results = f.executor.run_all(&raised, Utc::now()).await;
        assert!(matches!(results[0], Err(ResponseError::Notification(_))));
        assert!(matches!(
            results[1],
            Err(ResponseError::MissingTarget { field: "subject_id", .. })
        ));
        assert!(results[2..].iter().all(Result::is_ok));
        assert!(f.blocklist.is_blocked("10.0.0.5").await.unwrap());
        assert_eq!(f.limiter.ceiling_for("10.0.0.5"), 10);
        assert!(f
            .countermeasures
            .is_flagged(Countermeasure::IncreasedMonitoring, "10.0.0.5"));

        let audited = f
            .log
            .query(
                &EventFilter {
                    event_type: Some(event_types::SECURITY_ACTION_EXECUTED.into()),
                    ..EventFilter::default()
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(audited.len(), 5);
        assert!(audited.iter().all(|event| event.source_ip.is_none()));
        assert_eq!(audited[0].details["status"], "failed");
        assert_eq!(audited[2].details["target"], "10.0.0.5");
    }

    #[tokio::test]
    async fn actions_are_idempotent() {
        let f = fixture();
        let raised = alert(None, Some("mallory"));
        let first = f
            .executor
            .execute(ResponseAction::RequireMfa, &raised, Utc::now())
            .await
            .unwrap();
        let second = f
            .executor
            .execute(ResponseAction::RequireMfa, &raised, Utc::now())
            .await
            .unwrap();
        assert!(first.changed);
        assert!(!second.changed);
        assert!(f.mfa.is_forced("mallory"));

        f.executor
            .execute(ResponseAction::AuditPermissions, &raised, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            f.countermeasures.flagged(Countermeasure::PermissionAudit),
            vec!["mallory".to_string()]
        );
        assert!(f
            .countermeasures
            .clear(Countermeasure::PermissionAudit, "mallory"));
    }

    #[test]
    fn action_names_parse() {
        assert_eq!("block_ip".parse::<ResponseAction>().unwrap(), ResponseAction::BlockIp);
        assert_eq!(ResponseAction::RequireCaptcha.to_string(), "require_captcha");
        assert!("launch_missiles".parse::<ResponseAction>().is_err());
    }
}
