//! ---
//! bastion_section: "02-security-decisions"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Access control, anomaly detection, admission control, and TOTP."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Security decision core: attribute-based access control, pattern detection with
//! automated response, per-identity admission control, and TOTP second factors.

pub mod alerts;
pub mod attributes;
pub mod audit;
pub mod blocklist;
pub mod detector;
pub mod evaluator;
pub mod events;
pub mod metrics;
pub mod mfa;
pub mod notify;
pub mod patterns;
pub mod policy;
pub mod rate_limit;
pub mod response;
pub mod service;
pub mod totp;

pub use alerts::{AlertBook, AlertCallback, AlertError, AlertType, SecurityAlert};
pub use attributes::{
    AttributeValue, DecisionContext, EnvironmentAttributes, ResourceAttributes, SubjectAttributes,
};
pub use audit::FileEventLog;
pub use blocklist::{BlockEntry, Blocklist, BlocklistError, InMemoryBlocklist};
pub use detector::{DetectorHandle, PatternDetector};
pub use evaluator::{Decision, PolicyEvaluationResult, PolicyEvaluator};
pub use events::{
    event_types, EventDraft, EventFilter, EventLog, EventLogError, InMemoryEventLog,
    SecurityEvent, Severity,
};
pub use metrics::SecurityMetrics;
pub use mfa::{MfaEnrollment, MfaError, MfaRegistry};
pub use notify::{LogNotifier, NotificationSink};
pub use patterns::{Correlation, PatternTrigger, SecurityPattern};
pub use policy::{AttributeMatcher, Effect, Policy, PolicyError};
pub use rate_limit::{AdmissionGate, AdmissionOutcome, RateLimiter};
pub use response::{Countermeasure, ResponseAction, ResponseExecutor};
pub use service::{SecurityCore, SecurityCoreBuilder};
