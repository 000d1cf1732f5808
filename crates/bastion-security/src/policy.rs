//! ---
//! bastion_section: "02-access-control"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Attribute-based access control model and evaluation."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! Policy definitions and attribute matchers.
//!
//! Policies are written as JSON documents where a matcher value may be the wildcard
//! `"*"`, an alternative list `"read|write"`, an array `["public", "internal"]`, or a
//! plain scalar. Each shape deserializes into an [`AttributeMatcher`] variant so that
//! matching never inspects raw JSON at evaluation time.
//!
//! ```json
//! {
//!   "id": "analysts-read-internal",
//!   "name": "Analysts read internal reports",
//!   "subject": {"role": "analyst|admin"},
//!   "resource": {"type": "report", "classification": ["public", "internal"]},
//!   "action": "read",
//!   "environment": {"time": {"businessHours": true}, "ip": "10.0.*"},
//!   "effect": "allow",
//!   "priority": 50
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bastion_common::time::LocalZone;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::attributes::{AttributeValue, DecisionContext, EnvironmentAttributes};

/// Wildcard accepted in any matcher position.
pub const WILDCARD: &str = "*";
const ALTERNATIVE_SEPARATOR: char = '|';

/// Errors raised when a policy is written or loaded.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A mandatory field is empty.
    #[error("policy {policy:?} has an empty {field}")]
    MissingField {
        /// Policy identifier.
        policy: String,
        /// Offending field.
        field: &'static str,
    },
    /// A matcher cannot be interpreted.
    #[error("policy {policy:?} has a malformed {field} matcher: {reason}")]
    MalformedMatcher {
        /// Policy identifier.
        policy: String,
        /// Matcher location, e.g. `subject.role`.
        field: String,
        /// What is wrong.
        reason: &'static str,
    },
    /// A JSON value has a shape no matcher accepts.
    #[error("unsupported matcher value: {0}")]
    UnsupportedValue(String),
    /// Attempted to add a policy whose id is taken.
    #[error("policy already exists: {0}")]
    Duplicate(String),
    /// Policy id not present in the set.
    #[error("policy not found: {0}")]
    NotFound(String),
    /// The document is not valid policy JSON.
    #[error("invalid policy document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome a policy contributes when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Permit the action.
    Allow,
    /// Refuse the action; wins over any allow.
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => f.pad("allow"),
            Effect::Deny => f.pad("deny"),
        }
    }
}

/// Matcher for a single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum AttributeMatcher {
    /// `"*"`: matches anything, including an absent attribute.
    Any,
    /// Exact equality.
    Literal(String),
    /// `"a|b"`: the value equals one of the alternatives.
    OneOf(Vec<String>),
    /// `["a", "b"]`: the value is an element of the list.
    Contains(Vec<String>),
}

impl AttributeMatcher {
    /// Interpret a matcher string. Never fails; anything unusual is treated literally.
    pub fn parse(raw: &str) -> Self {
        if raw == WILDCARD {
            AttributeMatcher::Any
        } else if raw.contains(ALTERNATIVE_SEPARATOR) {
            AttributeMatcher::OneOf(raw.split(ALTERNATIVE_SEPARATOR).map(str::to_owned).collect())
        } else {
            AttributeMatcher::Literal(raw.to_owned())
        }
    }

    /// Test an attribute that may be absent. A list-valued attribute matches when any
    /// element does.
    pub fn matches(&self, value: Option<&AttributeValue>) -> bool {
        if matches!(self, AttributeMatcher::Any) {
            return true;
        }
        value.is_some_and(|value| {
            value
                .candidates()
                .iter()
                .any(|candidate| self.matches_str(candidate))
        })
    }

    /// Test a plain string such as an action name.
    pub fn matches_str(&self, candidate: &str) -> bool {
        match self {
            AttributeMatcher::Any => true,
            AttributeMatcher::Literal(expected) => expected == candidate,
            AttributeMatcher::OneOf(options) | AttributeMatcher::Contains(options) => {
                options.iter().any(|option| option == candidate)
            }
        }
    }

    fn validate(&self, policy: &str, field: &str) -> Result<(), PolicyError> {
        let malformed = |reason| PolicyError::MalformedMatcher {
            policy: policy.to_owned(),
            field: field.to_owned(),
            reason,
        };
        match self {
            AttributeMatcher::Any => Ok(()),
            AttributeMatcher::Literal(value) if value.is_empty() => Err(malformed("empty value")),
            AttributeMatcher::Literal(_) => Ok(()),
            AttributeMatcher::OneOf(options) if options.iter().any(String::is_empty) => {
                Err(malformed("empty alternative"))
            }
            AttributeMatcher::OneOf(_) => Ok(()),
            AttributeMatcher::Contains(items) if items.is_empty() => Err(malformed("empty list")),
            AttributeMatcher::Contains(items) if items.iter().any(String::is_empty) => {
                Err(malformed("empty list element"))
            }
            AttributeMatcher::Contains(_) => Ok(()),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TryFrom<Value> for AttributeMatcher {
    type Error = PolicyError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::String(raw) => Ok(AttributeMatcher::parse(raw)),
            Value::Bool(_) | Value::Number(_) => Ok(AttributeMatcher::Literal(
                scalar_to_string(&value).unwrap_or_default(),
            )),
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| {
                        scalar_to_string(item)
                            .ok_or_else(|| PolicyError::UnsupportedValue(item.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if items.iter().any(|item| item == WILDCARD) {
                    Ok(AttributeMatcher::Any)
                } else {
                    Ok(AttributeMatcher::Contains(items))
                }
            }
            _ => Err(PolicyError::UnsupportedValue(value.to_string())),
        }
    }
}

impl From<AttributeMatcher> for Value {
    fn from(matcher: AttributeMatcher) -> Self {
        match matcher {
            AttributeMatcher::Any => Value::String(WILDCARD.to_owned()),
            AttributeMatcher::Literal(value) => Value::String(value),
            AttributeMatcher::OneOf(options) => {
                Value::String(options.join(&ALTERNATIVE_SEPARATOR.to_string()))
            }
            AttributeMatcher::Contains(items) => {
                Value::Array(items.into_iter().map(Value::String).collect())
            }
        }
    }
}

/// Address pattern where `*` stands for any run of characters. Anchored at both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpGlob {
    pattern: String,
    segments: Vec<String>,
}

impl IpGlob {
    /// Split the pattern on `*` once so matching is a linear scan.
    pub fn compile(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_owned(),
            segments: pattern.split('*').map(str::to_owned).collect(),
        }
    }

    /// Original pattern text.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether `value` matches the pattern.
    pub fn matches(&self, value: &str) -> bool {
        let (first, rest) = match self.segments.split_first() {
            Some(split) => split,
            None => return value.is_empty(),
        };
        let Some((last, middle)) = rest.split_last() else {
            return value == first;
        };
        let Some(mut remaining) = value.strip_prefix(first.as_str()) else {
            return false;
        };
        for segment in middle {
            match remaining.find(segment.as_str()) {
                Some(index) => remaining = &remaining[index + segment.len()..],
                None => return false,
            }
        }
        remaining.ends_with(last.as_str())
    }
}

/// Matcher for the environment `ip` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpMatcher {
    /// `"*"`.
    Any,
    /// Match when any pattern matches; patterns without `*` compare exactly.
    Patterns(Vec<IpGlob>),
}

impl IpMatcher {
    /// Test a possibly absent source address.
    pub fn matches(&self, ip: Option<&str>) -> bool {
        match self {
            IpMatcher::Any => true,
            IpMatcher::Patterns(patterns) => {
                ip.is_some_and(|ip| patterns.iter().any(|pattern| pattern.matches(ip)))
            }
        }
    }
}

impl From<AttributeMatcher> for IpMatcher {
    fn from(matcher: AttributeMatcher) -> Self {
        match matcher {
            AttributeMatcher::Any => IpMatcher::Any,
            AttributeMatcher::Literal(value) => IpMatcher::Patterns(vec![IpGlob::compile(&value)]),
            AttributeMatcher::OneOf(values) | AttributeMatcher::Contains(values) => {
                IpMatcher::Patterns(values.iter().map(|v| IpGlob::compile(v)).collect())
            }
        }
    }
}

impl From<IpMatcher> for Value {
    fn from(matcher: IpMatcher) -> Self {
        match matcher {
            IpMatcher::Any => Value::String(WILDCARD.to_owned()),
            IpMatcher::Patterns(mut patterns) if patterns.len() == 1 => {
                Value::String(patterns.remove(0).pattern)
            }
            IpMatcher::Patterns(patterns) => Value::Array(
                patterns
                    .into_iter()
                    .map(|pattern| Value::String(pattern.pattern))
                    .collect(),
            ),
        }
    }
}

/// Time-of-day restriction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeConstraint {
    /// When true, only Monday to Friday between 09:00 and 17:00 local time match.
    #[serde(default)]
    pub business_hours: bool,
}

/// Environment section of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, Value>",
    into = "BTreeMap<String, Value>"
)]
pub struct EnvironmentMatcher {
    /// `time` key.
    pub time: Option<TimeConstraint>,
    /// `ip` key.
    pub ip: Option<IpMatcher>,
    /// Every other key, matched like subject attributes.
    pub attributes: BTreeMap<String, AttributeMatcher>,
}

impl EnvironmentMatcher {
    /// Whether the environment satisfies every declared key.
    pub fn matches(&self, environment: &EnvironmentAttributes, zone: LocalZone) -> bool {
        if let Some(time) = &self.time {
            if time.business_hours && !zone.is_business_hours(environment.time) {
                return false;
            }
        }
        if let Some(ip) = &self.ip {
            if !ip.matches(environment.ip.as_deref()) {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|(key, matcher)| matcher.matches(environment.lookup(key).as_ref()))
    }
}

impl TryFrom<BTreeMap<String, Value>> for EnvironmentMatcher {
    type Error = PolicyError;

    fn try_from(raw: BTreeMap<String, Value>) -> Result<Self, Self::Error> {
        let mut matcher = EnvironmentMatcher::default();
        for (key, value) in raw {
            match key.as_str() {
                "time" if value.as_str() == Some("*") => matcher.time = None,
                "time" => matcher.time = Some(serde_json::from_value(value)?),
                "ip" | "sourceIp" => {
                    matcher.ip = Some(IpMatcher::from(AttributeMatcher::try_from(value)?))
                }
                _ => {
                    matcher
                        .attributes
                        .insert(key, AttributeMatcher::try_from(value)?);
                }
            }
        }
        Ok(matcher)
    }
}

impl From<EnvironmentMatcher> for BTreeMap<String, Value> {
    fn from(matcher: EnvironmentMatcher) -> Self {
        let mut raw: BTreeMap<String, Value> = matcher
            .attributes
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect();
        if let Some(time) = matcher.time {
            raw.insert(
                "time".to_owned(),
                serde_json::json!({ "businessHours": time.business_hours }),
            );
        }
        if let Some(ip) = matcher.ip {
            raw.insert("ip".to_owned(), Value::from(ip));
        }
        raw
    }
}

/// An access rule. Never mutated in place; updates replace the whole policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Stable identifier.
    pub id: String,
    /// Display name used in decision reasons.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Subject attribute matchers; all must hold.
    #[serde(default)]
    pub subject: BTreeMap<String, AttributeMatcher>,
    /// Resource attribute matchers; all must hold.
    #[serde(default)]
    pub resource: BTreeMap<String, AttributeMatcher>,
    /// Action matcher.
    pub action: AttributeMatcher,
    /// Environment matchers; all must hold.
    #[serde(default)]
    pub environment: EnvironmentMatcher,
    /// Effect contributed on match.
    pub effect: Effect,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

impl Policy {
    /// Reject policies that cannot be evaluated meaningfully.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.id.trim().is_empty() {
            return Err(PolicyError::MissingField {
                policy: self.id.clone(),
                field: "id",
            });
        }
        if self.name.trim().is_empty() {
            return Err(PolicyError::MissingField {
                policy: self.id.clone(),
                field: "name",
            });
        }
        self.action.validate(&self.id, "action")?;
        for (section, matchers) in [("subject", &self.subject), ("resource", &self.resource)] {
            for (key, matcher) in matchers {
                validate_key(&self.id, section, key)?;
                matcher.validate(&self.id, &format!("{section}.{key}"))?;
            }
        }
        for (key, matcher) in &self.environment.attributes {
            validate_key(&self.id, "environment", key)?;
            matcher.validate(&self.id, &format!("environment.{key}"))?;
        }
        if let Some(IpMatcher::Patterns(patterns)) = &self.environment.ip {
            if patterns.is_empty() || patterns.iter().any(|p| p.as_str().is_empty()) {
                return Err(PolicyError::MalformedMatcher {
                    policy: self.id.clone(),
                    field: "environment.ip".to_owned(),
                    reason: "empty address pattern",
                });
            }
        }
        Ok(())
    }

    /// Conjunction of the subject, resource, action, and environment matchers.
    pub fn matches(&self, context: &DecisionContext, zone: LocalZone) -> bool {
        self.subject
            .iter()
            .all(|(key, matcher)| matcher.matches(context.subject.lookup(key).as_ref()))
            && self
                .resource
                .iter()
                .all(|(key, matcher)| matcher.matches(context.resource.lookup(key).as_ref()))
            && self.action.matches_str(&context.action)
            && self.environment.matches(&context.environment, zone)
    }
}

fn validate_key(policy: &str, section: &str, key: &str) -> Result<(), PolicyError> {
    if key.trim().is_empty() {
        return Err(PolicyError::MalformedMatcher {
            policy: policy.to_owned(),
            field: section.to_owned(),
            reason: "empty attribute key",
        });
    }
    Ok(())
}

/// Parse a JSON array of policies (or a single policy object) and validate each.
pub fn parse_policies(document: &str) -> Result<Vec<Policy>, PolicyError> {
    let value: Value = serde_json::from_str(document)?;
    let policies: Vec<Policy> = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    for policy in &policies {
        policy.validate()?;
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{ResourceAttributes, SubjectAttributes};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn context(action: &str) -> DecisionContext {
        DecisionContext::new(
            SubjectAttributes::new("u-1").with_role("analyst"),
            ResourceAttributes::new("report").with_classification("internal"),
            action,
            // Monday 10:00 UTC.
            EnvironmentAttributes::at(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap())
                .with_ip("10.0.3.7"),
        )
    }

    fn policy(value: Value) -> Policy {
        let policy: Policy = serde_json::from_value(value).unwrap();
        policy.validate().unwrap();
        policy
    }

    #[test]
    fn matcher_shapes_deserialize_into_variants() {
        let parse = |v: Value| AttributeMatcher::try_from(v).unwrap();
        assert_eq!(parse(json!("*")), AttributeMatcher::Any);
        assert_eq!(
            parse(json!("read|write")),
            AttributeMatcher::OneOf(vec!["read".into(), "write".into()])
        );
        assert_eq!(
            parse(json!(["a", "b"])),
            AttributeMatcher::Contains(vec!["a".into(), "b".into()])
        );
        assert_eq!(parse(json!(true)), AttributeMatcher::Literal("true".into()));
        assert_eq!(parse(json!(3)), AttributeMatcher::Literal("3".into()));
        assert!(AttributeMatcher::try_from(json!({"nested": 1})).is_err());
        assert!(AttributeMatcher::try_from(json!(null)).is_err());
    }

    #[test]
    fn or_matching_accepts_alternatives_only() {
        let matcher = AttributeMatcher::parse("read|write");
        assert!(matcher.matches_str("read"));
        assert!(matcher.matches_str("write"));
        assert!(!matcher.matches_str("delete"));
        assert!(!matcher.matches_str("read|write"));
    }

    #[test]
    fn wildcard_matches_absent_values() {
        assert!(AttributeMatcher::Any.matches(None));
        assert!(!AttributeMatcher::Literal("x".into()).matches(None));
        assert!(!AttributeMatcher::Contains(vec!["x".into()]).matches(None));
    }

    #[test]
    fn ip_globs_are_anchored() {
        let glob = IpGlob::compile("10.0.*");
        assert!(glob.matches("10.0.3.7"));
        assert!(!glob.matches("110.0.3.7"));
        assert!(IpGlob::compile("*.7").matches("10.0.3.7"));
        assert!(IpGlob::compile("10.*.3.*").matches("10.0.3.7"));
        assert!(!IpGlob::compile("10.*.4.*").matches("10.0.3.7"));
        assert!(IpGlob::compile("10.0.3.7").matches("10.0.3.7"));
        assert!(!IpGlob::compile("10.0.3.7").matches("10.0.3.70"));
    }

    #[test]
    fn policy_matches_all_sections() {
        let p = policy(json!({
            "id": "p1",
            "name": "analysts read internal",
            "subject": {"role": "analyst|admin"},
            "resource": {"type": "report", "classification": ["public", "internal"]},
            "action": "read",
            "environment": {"time": {"businessHours": true}, "ip": "10.0.*"},
            "effect": "allow",
            "priority": 10
        }));
        let zone = LocalZone::utc();
        assert!(p.matches(&context("read"), zone));
        assert!(!p.matches(&context("write"), zone));

        let mut outside = context("read");
        outside.environment.time = Utc.with_ymd_and_hms(2024, 3, 4, 18, 0, 0).unwrap();
        assert!(!p.matches(&outside, zone));

        let mut foreign = context("read");
        foreign.environment.ip = Some("192.168.1.1".into());
        assert!(!p.matches(&foreign, zone));
    }

    #[test]
    fn undeclared_keys_are_not_checked() {
        let p = policy(json!({
            "id": "p2",
            "name": "anyone reads",
            "action": "read",
            "effect": "allow"
        }));
        assert!(p.matches(&context("read"), LocalZone::utc()));
    }

    #[test]
    fn environment_flags_match_mfa_state() {
        let p = policy(json!({
            "id": "p3",
            "name": "mfa for writes",
            "action": "write",
            "environment": {"mfaVerified": true},
            "effect": "allow"
        }));
        let mut ctx = context("write");
        assert!(!p.matches(&ctx, LocalZone::utc()));
        ctx.environment.mfa_verified = true;
        assert!(p.matches(&ctx, LocalZone::utc()));
    }

    #[test]
    fn wildcard_time_places_no_constraint() {
        let p = policy(json!({
            "id": "p4",
            "name": "any time",
            "action": "read",
            "environment": {"time": "*", "ip": "10.0.*"},
            "effect": "allow"
        }));
        assert!(p.environment.time.is_none());
        let mut late = context("read");
        late.environment.time = Utc.with_ymd_and_hms(2024, 3, 9, 23, 30, 0).unwrap();
        assert!(p.matches(&late, LocalZone::utc()));
        assert!(p.matches(&context("read"), LocalZone::utc()));
        assert!(serde_json::from_value::<Policy>(json!({
            "id": "p5",
            "name": "bad time",
            "action": "read",
            "environment": {"time": "nights"},
            "effect": "allow"
        }))
        .is_err());
    }

    #[test]
    fn malformed_policies_are_rejected() {
        let parse = |v: Value| serde_json::from_value::<Policy>(v).unwrap().validate();
        assert!(matches!(
            parse(json!({"id": "", "name": "n", "action": "read", "effect": "allow"})),
            Err(PolicyError::MissingField { field: "id", .. })
        ));
        assert!(matches!(
            parse(json!({"id": "x", "name": "n", "action": "read||write", "effect": "allow"})),
            Err(PolicyError::MalformedMatcher { .. })
        ));
        assert!(matches!(
            parse(json!({"id": "x", "name": "n", "action": [], "effect": "allow"})),
            Err(PolicyError::MalformedMatcher { .. })
        ));
        assert!(serde_json::from_value::<Policy>(
            json!({"id": "x", "name": "n", "action": "read", "effect": "maybe"})
        )
        .is_err());
    }

    #[test]
    fn serialization_preserves_matcher_shapes() {
        let p = policy(json!({
            "id": "p4",
            "name": "round trip",
            "subject": {"role": "a|b", "department": ["x", "y"]},
            "action": "*",
            "environment": {"ip": "10.*", "time": {"businessHours": true}},
            "effect": "deny",
            "priority": -5
        }));
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["subject"]["role"], json!("a|b"));
        assert_eq!(value["subject"]["department"], json!(["x", "y"]));
        assert_eq!(value["action"], json!("*"));
        assert_eq!(value["environment"]["ip"], json!("10.*"));
        assert_eq!(serde_json::from_value::<Policy>(value).unwrap(), p);
    }

    #[test]
    fn parse_policies_accepts_array_or_object() {
        let single = parse_policies(r#"{"id":"a","name":"a","action":"read","effect":"allow"}"#)
            .unwrap();
        assert_eq!(single.len(), 1);
        let err = parse_policies(r#"[{"id":"a","name":"","action":"read","effect":"allow"}]"#)
            .unwrap_err();
        assert!(err.to_string().contains("name"));
    }
}
