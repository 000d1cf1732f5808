//! ---
//! bastion_section: "03-event-logging"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Security event model and event log collaborators."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier assigned by the event log when an event is recorded.
pub type EventId = u64;

/// Event types emitted by the security subsystem itself or expected from callers.
pub mod event_types {
    /// A password or second-factor check failed.
    pub const LOGIN_FAILED: &str = "login_failed";
    /// A login completed.
    pub const SUCCESSFUL_LOGIN: &str = "successful_login";
    /// An authorization check denied an action.
    pub const ACCESS_DENIED: &str = "access_denied";
    /// The admission gate rejected a request over its ceiling.
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    /// The admission gate rejected a blocked identity.
    pub const BLOCKED_IP_ACCESS_ATTEMPT: &str = "blocked_ip_access_attempt";
    /// A response action ran on behalf of an alert.
    pub const SECURITY_ACTION_EXECUTED: &str = "security_action_executed";
}

/// Severity ladder shared by events and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Likely hostile.
    High,
    /// Requires immediate response.
    Critical,
}

impl Severity {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Immutable record of a security-relevant occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Sequence assigned by the log; strictly increasing in record order.
    pub id: EventId,
    /// Authoritative ordering field.
    pub timestamp: DateTime<Utc>,
    /// Open vocabulary, see [`event_types`].
    pub event_type: String,
    /// Severity reported by the producer.
    pub severity: Severity,
    /// Subject (user) the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Source address of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    /// User agent presented by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Resource that was touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Action that was attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Free-form details.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SecurityEvent {
    /// Ordering key: timestamp first, record sequence second.
    pub fn ordering_key(&self) -> (DateTime<Utc>, EventId) {
        (self.timestamp, self.id)
    }
}

/// Event fields supplied by a producer before the log assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// See [`SecurityEvent::event_type`].
    pub event_type: String,
    /// See [`SecurityEvent::severity`].
    pub severity: Severity,
    /// See [`SecurityEvent::subject_id`].
    #[serde(default)]
    pub subject_id: Option<String>,
    /// See [`SecurityEvent::source_ip`].
    #[serde(default)]
    pub source_ip: Option<String>,
    /// See [`SecurityEvent::user_agent`].
    #[serde(default)]
    pub user_agent: Option<String>,
    /// See [`SecurityEvent::resource`].
    #[serde(default)]
    pub resource: Option<String>,
    /// See [`SecurityEvent::action`].
    #[serde(default)]
    pub action: Option<String>,
    /// See [`SecurityEvent::details`].
    #[serde(default)]
    pub details: serde_json::Value,
}

impl EventDraft {
    /// Start a draft with the mandatory fields.
    pub fn new(event_type: impl Into<String>, severity: Severity) -> Self {
        Self {
            event_type: event_type.into(),
            severity,
            subject_id: None,
            source_ip: None,
            user_agent: None,
            resource: None,
            action: None,
            details: serde_json::Value::Null,
        }
    }

    /// Attach the subject identifier.
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Attach the source address.
    pub fn with_source_ip(mut self, source_ip: impl Into<String>) -> Self {
        self.source_ip = Some(source_ip.into());
        self
    }

    /// Attach the client user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Attach the resource descriptor.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Attach the attempted action.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attach free-form details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Seal the draft into an event.
    pub fn into_event(self, id: EventId, timestamp: DateTime<Utc>) -> SecurityEvent {
        SecurityEvent {
            id,
            timestamp,
            event_type: self.event_type,
            severity: self.severity,
            subject_id: self.subject_id,
            source_ip: self.source_ip,
            user_agent: self.user_agent,
            resource: self.resource,
            action: self.action,
            details: self.details,
        }
    }
}

/// Conjunctive filter applied by [`EventLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Exact severity.
    pub severity: Option<Severity>,
    /// Exact source address.
    pub source_ip: Option<String>,
    /// Exact subject identifier.
    pub subject_id: Option<String>,
    /// Inclusive lower bound on the timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the timestamp.
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Whether `event` satisfies every populated field.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        fn field_matches(expected: &Option<String>, actual: &Option<String>) -> bool {
            expected
                .as_ref()
                .map_or(true, |expected| actual.as_deref() == Some(expected.as_str()))
        }

        self.event_type
            .as_ref()
            .map_or(true, |t| &event.event_type == t)
            && self.severity.map_or(true, |s| event.severity == s)
            && field_matches(&self.source_ip, &event.source_ip)
            && field_matches(&self.subject_id, &event.subject_id)
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp <= until)
    }
}

/// Errors surfaced by event log collaborators.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// Wrapper for IO errors encountered while reading/writing log files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The backing store cannot currently serve requests.
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

/// Durable, append-only store of security events.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event stamped with `timestamp`, returning it with its assigned id.
    async fn record(
        &self,
        draft: EventDraft,
        timestamp: DateTime<Utc>,
    ) -> Result<SecurityEvent, EventLogError>;

    /// Return at most `limit` matching events, the most recent ones, oldest first.
    async fn query(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, EventLogError>;
}

/// Select the newest `limit` events matching `filter`, ordered by timestamp then id.
pub(crate) fn select(
    events: &[SecurityEvent],
    filter: &EventFilter,
    limit: usize,
) -> Vec<SecurityEvent> {
    let mut matched: Vec<SecurityEvent> = events
        .iter()
        .filter(|event| filter.matches(event))
        .cloned()
        .collect();
    matched.sort_by_key(SecurityEvent::ordering_key);
    let skip = matched.len().saturating_sub(limit);
    matched.split_off(skip)
}

/// Event log held entirely in memory; the default for single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<SecurityEvent>>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Copy of every event in record order.
    pub fn snapshot(&self) -> Vec<SecurityEvent> {
        self.events.read().clone()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn record(
        &self,
        draft: EventDraft,
        timestamp: DateTime<Utc>,
    ) -> Result<SecurityEvent, EventLogError> {
        let mut events = self.events.write();
        let event = draft.into_event(events.len() as EventId + 1, timestamp);
        events.push(event.clone());
        Ok(event)
    }

    async fn query(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<SecurityEvent>, EventLogError> {
        Ok(select(&self.events.read(), filter, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[tokio::test]
    async fn record_assigns_increasing_ids() {
        let log = InMemoryEventLog::new();
        let first = log
            .record(EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium), at(0))
            .await
            .unwrap();
        let second = log
            .record(EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium), at(0))
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn query_filters_and_limits_to_newest() {
        let log = InMemoryEventLog::new();
        for minute in 0..5 {
            log.record(
                EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium)
                    .with_source_ip("10.0.0.5"),
                at(minute),
            )
            .await
            .unwrap();
        }
        log.record(
            EventDraft::new(event_types::LOGIN_FAILED, Severity::Medium).with_source_ip("10.0.0.6"),
            at(2),
        )
        .await
        .unwrap();

        let filter = EventFilter {
            source_ip: Some("10.0.0.5".into()),
            since: Some(at(1)),
            ..EventFilter::default()
        };
        let all = log.query(&filter, 100).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].ordering_key() <= w[1].ordering_key()));

        let newest = log.query(&filter, 2).await.unwrap();
        assert_eq!(
            newest.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            vec![at(3), at(4)]
        );
    }

    #[test]
    fn filter_matches_on_every_populated_field() {
        let event = EventDraft::new(event_types::ACCESS_DENIED, Severity::High)
            .with_subject("u-1")
            .into_event(7, at(0));
        let mut filter = EventFilter {
            event_type: Some(event_types::ACCESS_DENIED.into()),
            severity: Some(Severity::High),
            subject_id: Some("u-1".into()),
            until: Some(at(0)),
            ..EventFilter::default()
        };
        assert!(filter.matches(&event));
        filter.source_ip = Some("10.0.0.1".into());
        assert!(!filter.matches(&event));
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!(Severity::Critical > Severity::Low);
        assert!("urgent".parse::<Severity>().is_err());
    }
}
