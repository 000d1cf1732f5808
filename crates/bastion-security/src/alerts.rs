//! ---
//! bastion_section: "06-anomaly-detection"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Pattern detection, alerting, and automated response."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::{EventId, Severity};
use crate::response::ResponseAction;

/// Closed set of alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Repeated authentication failures.
    BruteForce,
    /// Unusual but not conclusively hostile behaviour.
    SuspiciousPattern,
    /// Repeated attempts to exceed granted permissions.
    PrivilegeEscalation,
    /// Data leaving where it should not.
    DataBreach,
    /// Evidence that a host or account is controlled by an attacker.
    SystemCompromise,
}

impl AlertType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::BruteForce => "brute_force",
            AlertType::SuspiciousPattern => "suspicious_pattern",
            AlertType::PrivilegeEscalation => "privilege_escalation",
            AlertType::DataBreach => "data_breach",
            AlertType::SystemCompromise => "system_compromise",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding raised by the pattern detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Alert identifier.
    pub id: Uuid,
    /// Pattern that produced the alert.
    pub pattern_id: String,
    /// Category.
    pub alert_type: AlertType,
    /// Severity copied from the pattern.
    pub severity: Severity,
    /// Short summary.
    pub title: String,
    /// Longer explanation including the observed count.
    pub description: String,
    /// Subject the alert concerns, if any.
    pub subject_id: Option<String>,
    /// Source address the alert concerns, if any.
    pub source_ip: Option<String>,
    /// Value the pattern correlated on; `None` for single-event patterns.
    #[serde(default)]
    pub correlation_key: Option<String>,
    /// Timestamp of the triggering event.
    pub timestamp: DateTime<Utc>,
    /// Event that completed the pattern.
    pub trigger_event: EventId,
    /// Number of correlated events in the window, trigger included.
    pub matched_events: usize,
    /// Response actions attached to the alert, in execution order.
    pub actions: Vec<ResponseAction>,
    /// Cleared once resolved.
    pub active: bool,
    /// When the alert was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Free-form resolution notes.
    pub resolution_notes: Option<String>,
}

impl SecurityAlert {
    fn covers(&self, pattern_id: &str, key: &str) -> bool {
        self.active && self.pattern_id == pattern_id && self.correlation_key.as_deref() == Some(key)
    }
}

/// Errors raised by alert administration.
#[derive(Debug, Error)]
pub enum AlertError {
    /// No alert with that id.
    #[error("alert not found: {0}")]
    NotFound(Uuid),
    /// The alert was already resolved.
    #[error("alert already resolved: {0}")]
    AlreadyResolved(Uuid),
}

/// Receives every alert synchronously before response actions run.
pub trait AlertCallback: Send + Sync {
    /// Handle an alert. Errors are logged and do not affect other callbacks.
    fn on_alert(&self, alert: &SecurityAlert) -> anyhow::Result<()>;
}

impl<F> AlertCallback for F
where
    F: Fn(&SecurityAlert) -> anyhow::Result<()> + Send + Sync,
{
    fn on_alert(&self, alert: &SecurityAlert) -> anyhow::Result<()> {
        self(alert)
    }
}

/// Callbacks registered at runtime. Registration swaps a new list in, so a
/// notification already iterating keeps the list it started with.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<Arc<Vec<Arc<dyn AlertCallback>>>>,
}

impl CallbackRegistry {
    /// Append a callback.
    pub fn register(&self, callback: Arc<dyn AlertCallback>) {
        let mut guard = self.callbacks.write();
        let mut next = Vec::clone(&guard);
        next.push(callback);
        *guard = Arc::new(next);
    }

    /// Current callbacks.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn AlertCallback>>> {
        self.callbacks.read().clone()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Whether none are registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }
}

/// Retained alerts, oldest first.
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: RwLock<Vec<SecurityAlert>>,
}

impl AlertBook {
    /// Whether an unresolved alert from `pattern_id` already covers `key`.
    pub fn has_active(&self, pattern_id: &str, key: &str) -> bool {
        self.alerts
            .read()
            .iter()
            .any(|alert| alert.covers(pattern_id, key))
    }

    /// Store `alert` unless an unresolved alert for the same pattern and correlation
    /// key exists. Alerts without a key are always stored.
    pub fn open(&self, alert: SecurityAlert) -> bool {
        let mut alerts = self.alerts.write();
        if let Some(key) = alert.correlation_key.as_deref() {
            if alerts
                .iter()
                .any(|existing| existing.covers(&alert.pattern_id, key))
            {
                return false;
            }
        }
        alerts.push(alert);
        true
    }

    /// All alerts, or only unresolved ones.
    pub fn list(&self, active_only: bool) -> Vec<SecurityAlert> {
        self.alerts
            .read()
            .iter()
            .filter(|alert| !active_only || alert.active)
            .cloned()
            .collect()
    }

    /// Look up an alert.
    pub fn get(&self, id: Uuid) -> Option<SecurityAlert> {
        self.alerts.read().iter().find(|alert| alert.id == id).cloned()
    }

    /// Mark an alert resolved.
    pub fn resolve(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<SecurityAlert, AlertError> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .iter_mut()
            .find(|alert| alert.id == id)
            .ok_or(AlertError::NotFound(id))?;
        if !alert.active {
            return Err(AlertError::AlreadyResolved(id));
        }
        alert.active = false;
        alert.resolved_at = Some(at);
        alert.resolved_by = Some(resolved_by.to_owned());
        alert.resolution_notes = notes;
        Ok(alert.clone())
    }
}
