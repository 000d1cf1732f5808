//! ---
//! bastion_section: "06-anomaly-detection"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Pattern detection, alerting, and automated response."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use bastion_common::time::LocalZone;
use serde::{Deserialize, Serialize};

use crate::alerts::AlertType;
use crate::events::{event_types, SecurityEvent, Severity};
use crate::response::ResponseAction;

/// Hour (local) at which working hours start for off-hours detection.
pub const OFF_HOURS_END: u32 = 8;
/// Hour (local) from which a login counts as off-hours.
pub const OFF_HOURS_START: u32 = 18;

/// Predicate over a single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternTrigger {
    /// Event type equals `event_type`.
    EventType {
        /// Expected event type.
        event_type: String,
    },
    /// User agent contains any of `agents`, case-insensitively.
    UserAgentContains {
        /// Lowercase substrings.
        agents: Vec<String>,
    },
    /// Any event carrying a source address.
    AnySourceIp,
    /// Event of `event_type` whose local hour is before `end_hour` or at/after `start_hour`.
    OffHours {
        /// Expected event type.
        event_type: String,
        /// Hour at which off-hours begin.
        start_hour: u32,
        /// Hour at which off-hours end.
        end_hour: u32,
    },
}

impl PatternTrigger {
    /// Whether `event` satisfies the predicate.
    pub fn matches(&self, event: &SecurityEvent, zone: LocalZone) -> bool {
        match self {
            PatternTrigger::EventType { event_type } => &event.event_type == event_type,
            PatternTrigger::UserAgentContains { agents } => {
                event.user_agent.as_deref().is_some_and(|agent| {
                    let agent = agent.to_lowercase();
                    agents
                        .iter()
                        .any(|needle| agent.contains(needle.to_lowercase().as_str()))
                })
            }
            PatternTrigger::AnySourceIp => event.source_ip.is_some(),
            PatternTrigger::OffHours {
                event_type,
                start_hour,
                end_hour,
            } => {
                let hour = zone.hour(event.timestamp);
                &event.event_type == event_type && (hour < *end_hour || hour >= *start_hour)
            }
        }
    }

    /// Event type the log can pre-filter on, when the predicate pins one.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            PatternTrigger::EventType { event_type }
            | PatternTrigger::OffHours { event_type, .. } => Some(event_type.as_str()),
            PatternTrigger::UserAgentContains { .. } | PatternTrigger::AnySourceIp => None,
        }
    }
}

/// Key that groups events for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// Count events sharing the trigger's source address.
    SourceIp,
    /// Count events sharing the trigger's subject.
    Subject,
    /// Alert on the trigger alone; threshold and window are not consulted.
    Point,
}

impl Correlation {
    /// Correlation value of `event`, `None` when the event lacks it.
    pub fn key<'a>(&self, event: &'a SecurityEvent) -> Option<&'a str> {
        match self {
            Correlation::SourceIp => event.source_ip.as_deref(),
            Correlation::Subject => event.subject_id.as_deref(),
            Correlation::Point => None,
        }
    }
}

/// Detection rule: count events matching `trigger` that share the correlation key
/// within the trailing window, and raise an alert once the count reaches `threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPattern {
    /// Stable identifier.
    pub id: String,
    /// Alert title.
    pub title: String,
    /// Per-event predicate.
    pub trigger: PatternTrigger,
    /// Grouping key.
    pub correlation: Correlation,
    /// Minimum count that raises an alert.
    pub threshold: usize,
    /// Trailing window length.
    pub window_minutes: i64,
    /// Severity of raised alerts.
    pub severity: Severity,
    /// Category of raised alerts.
    pub alert_type: AlertType,
    /// Actions run for every raised alert, in order.
    pub actions: Vec<ResponseAction>,
}

/// The five built-in patterns. `suspicious_agents` feeds `suspicious_user_agent`.
pub fn canonical(suspicious_agents: &[String]) -> Vec<SecurityPattern> {
    use ResponseAction::*;

    vec![
        SecurityPattern {
            id: "failed_login_burst".into(),
            title: "Repeated failed logins".into(),
            trigger: PatternTrigger::EventType {
                event_type: event_types::LOGIN_FAILED.into(),
            },
            correlation: Correlation::SourceIp,
            threshold: 5,
            window_minutes: 10,
            severity: Severity::High,
            alert_type: AlertType::BruteForce,
            actions: vec![BlockIp, NotifyAdmin, IncreaseMonitoring],
        },
        SecurityPattern {
            id: "privilege_escalation".into(),
            title: "Repeated access denials".into(),
            trigger: PatternTrigger::EventType {
                event_type: event_types::ACCESS_DENIED.into(),
            },
            correlation: Correlation::Subject,
            threshold: 3,
            window_minutes: 5,
            severity: Severity::Critical,
            alert_type: AlertType::PrivilegeEscalation,
            actions: vec![BlockUser, NotifyAdmin, AuditPermissions],
        },
        SecurityPattern {
            id: "suspicious_user_agent".into(),
            title: "Scanner user agent".into(),
            trigger: PatternTrigger::UserAgentContains {
                agents: suspicious_agents
                    .iter()
                    .map(|agent| agent.to_lowercase())
                    .collect(),
            },
            correlation: Correlation::SourceIp,
            threshold: 10,
            window_minutes: 30,
            severity: Severity::Medium,
            alert_type: AlertType::SuspiciousPattern,
            actions: vec![IncreaseMonitoring, RequireCaptcha],
        },
        SecurityPattern {
            id: "rapid_requests".into(),
            title: "Request flood".into(),
            trigger: PatternTrigger::AnySourceIp,
            correlation: Correlation::SourceIp,
            threshold: 100,
            window_minutes: 5,
            severity: Severity::High,
            alert_type: AlertType::SuspiciousPattern,
            actions: vec![RateLimit, BlockIp, NotifyAdmin],
        },
        SecurityPattern {
            id: "off_hours_access".into(),
            title: "Login outside working hours".into(),
            trigger: PatternTrigger::OffHours {
                event_type: event_types::SUCCESSFUL_LOGIN.into(),
                start_hour: OFF_HOURS_START,
                end_hour: OFF_HOURS_END,
            },
            correlation: Correlation::Point,
            threshold: 1,
            window_minutes: 60,
            severity: Severity::Medium,
            alert_type: AlertType::SuspiciousPattern,
            actions: vec![RequireMfa, NotifyAdmin],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDraft;
    use chrono::{TimeZone, Utc};

    fn event_at(hour: u32, event_type: &str) -> SecurityEvent {
        EventDraft::new(event_type, Severity::Low)
            .with_subject("alice")
            .into_event(1, Utc.with_ymd_and_hms(2024, 3, 4, hour, 0, 0).unwrap())
    }

    #[test]
    fn canonical_table_is_exact() {
        use ResponseAction::*;

        let table: Vec<_> = canonical(&[])
            .into_iter()
            .map(|p| (p.id, p.threshold, p.window_minutes, p.severity, p.actions))
            .collect();
        assert_eq!(
            table,
            vec![
                (
                    "failed_login_burst".to_string(),
                    5,
                    10,
                    Severity::High,
                    vec![BlockIp, NotifyAdmin, IncreaseMonitoring]
                ),
                (
                    "privilege_escalation".to_string(),
                    3,
                    5,
                    Severity::Critical,
                    vec![BlockUser, NotifyAdmin, AuditPermissions]
                ),
                (
                    "suspicious_user_agent".to_string(),
                    10,
                    30,
                    Severity::Medium,
                    vec![IncreaseMonitoring, RequireCaptcha]
                ),
                (
                    "rapid_requests".to_string(),
                    100,
                    5,
                    Severity::High,
                    vec![RateLimit, BlockIp, NotifyAdmin]
                ),
                (
                    "off_hours_access".to_string(),
                    1,
                    60,
                    Severity::Medium,
                    vec![RequireMfa, NotifyAdmin]
                ),
            ]
        );
    }

    #[test]
    fn off_hours_boundaries() {
        let pattern = canonical(&[]).remove(4);
        let zone = LocalZone::utc();
        assert!(pattern
            .trigger
            .matches(&event_at(7, event_types::SUCCESSFUL_LOGIN), zone));
        assert!(!pattern
            .trigger
            .matches(&event_at(8, event_types::SUCCESSFUL_LOGIN), zone));
        assert!(!pattern
            .trigger
            .matches(&event_at(17, event_types::SUCCESSFUL_LOGIN), zone));
        assert!(pattern
            .trigger
            .matches(&event_at(18, event_types::SUCCESSFUL_LOGIN), zone));
        assert!(!pattern
            .trigger
            .matches(&event_at(22, event_types::LOGIN_FAILED), zone));
    }

    #[test]
    fn user_agent_match_ignores_case() {
        let pattern = canonical(&["SQLMap".to_string()]).remove(2);
        let mut event = event_at(12, "request");
        event.user_agent = Some("sqlmap/1.7.2#stable (https://sqlmap.org)".into());
        assert!(pattern.trigger.matches(&event, LocalZone::utc()));
        event.user_agent = Some("Mozilla/5.0".into());
        assert!(!pattern.trigger.matches(&event, LocalZone::utc()));
        event.user_agent = None;
        assert!(!pattern.trigger.matches(&event, LocalZone::utc()));
    }

    #[test]
    fn patterns_serialize_as_data() {
        let value = serde_json::to_value(&canonical(&[])[0]).unwrap();
        assert_eq!(value["trigger"]["kind"], "event_type");
        assert_eq!(value["actions"][0], "block_ip");
        assert_eq!(value["alert_type"], "brute_force");
    }
}
