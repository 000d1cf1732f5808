//! ---
//! bastion_section: "02-access-control"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Attribute-based access control model and evaluation."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! Attributes describing one access request.
//!
//! A [`DecisionContext`] is built per evaluation and never stored. Policies address
//! attributes by their camelCase key (`role`, `mfaEnabled`, `classification`, ...);
//! keys not covered by the typed fields are looked up in each section's `extra` map.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value of a single context attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean attribute such as `mfaVerified`.
    Flag(bool),
    /// Integral attribute such as a numeric clearance.
    Number(i64),
    /// Plain string attribute.
    Text(String),
    /// Multi-valued attribute (groups, tags).
    List(Vec<String>),
}

impl AttributeValue {
    /// String forms a matcher compares against; a list yields each element.
    pub fn candidates(&self) -> Vec<Cow<'_, str>> {
        match self {
            AttributeValue::Flag(true) => vec![Cow::Borrowed("true")],
            AttributeValue::Flag(false) => vec![Cow::Borrowed("false")],
            AttributeValue::Number(number) => vec![Cow::Owned(number.to_string())],
            AttributeValue::Text(text) => vec![Cow::Borrowed(text.as_str())],
            AttributeValue::List(items) => {
                items.iter().map(|s| Cow::Borrowed(s.as_str())).collect()
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Flag(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::List(value)
    }
}

fn text(value: &Option<String>) -> Option<AttributeValue> {
    value.as_ref().map(|v| AttributeValue::Text(v.clone()))
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttributes {
    /// Stable user identifier.
    pub id: String,
    /// Role name supplied by the identity provider.
    #[serde(default)]
    pub role: Option<String>,
    /// Department supplied by the identity provider.
    #[serde(default)]
    pub department: Option<String>,
    /// Clearance label supplied by the identity provider.
    #[serde(default)]
    pub clearance: Option<String>,
    /// Derived from the MFA registry, never stored on the user record.
    #[serde(default)]
    pub mfa_enabled: bool,
    /// Additional attributes addressed by key.
    #[serde(default)]
    pub extra: BTreeMap<String, AttributeValue>,
}

impl SubjectAttributes {
    /// Subject with only an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            department: None,
            clearance: None,
            mfa_enabled: false,
            extra: BTreeMap::new(),
        }
    }

    /// Set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the department.
    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// Set the clearance.
    pub fn with_clearance(mut self, clearance: impl Into<String>) -> Self {
        self.clearance = Some(clearance.into());
        self
    }

    /// Set the derived MFA enrollment flag.
    pub fn with_mfa_enabled(mut self, enabled: bool) -> Self {
        self.mfa_enabled = enabled;
        self
    }

    /// Set an arbitrary attribute.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Resolve an attribute by policy key.
    pub fn lookup(&self, key: &str) -> Option<AttributeValue> {
        match key {
            "id" => Some(AttributeValue::Text(self.id.clone())),
            "role" => text(&self.role),
            "department" => text(&self.department),
            "clearance" => text(&self.clearance),
            "mfaEnabled" => Some(AttributeValue::Flag(self.mfa_enabled)),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// What is being accessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAttributes {
    /// Resource kind, addressed as `type`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Owning subject id.
    #[serde(default)]
    pub owner: Option<String>,
    /// Data classification label.
    #[serde(default)]
    pub classification: Option<String>,
    /// Additional attributes addressed by key.
    #[serde(default)]
    pub extra: BTreeMap<String, AttributeValue>,
}

impl ResourceAttributes {
    /// Resource with only a type.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            owner: None,
            classification: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the classification.
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    /// Set an arbitrary attribute.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Resolve an attribute by policy key.
    pub fn lookup(&self, key: &str) -> Option<AttributeValue> {
        match key {
            "type" => Some(AttributeValue::Text(self.resource_type.clone())),
            "owner" => text(&self.owner),
            "classification" => text(&self.classification),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// Circumstances of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentAttributes {
    /// Evaluation instant.
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    /// Source address, addressed as `ip`.
    #[serde(default, alias = "sourceIp")]
    pub ip: Option<String>,
    /// Client user agent.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Whether a second factor was verified for this session.
    #[serde(default)]
    pub mfa_verified: bool,
    /// Additional attributes addressed by key.
    #[serde(default)]
    pub extra: BTreeMap<String, AttributeValue>,
}

impl EnvironmentAttributes {
    /// Environment at `time` with nothing else known.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            time,
            ip: None,
            user_agent: None,
            mfa_verified: false,
            extra: BTreeMap::new(),
        }
    }

    /// Set the source address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the second-factor flag.
    pub fn with_mfa_verified(mut self, verified: bool) -> Self {
        self.mfa_verified = verified;
        self
    }

    /// Set an arbitrary attribute.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Resolve an attribute by policy key. `time` is handled by the time constraint.
    pub fn lookup(&self, key: &str) -> Option<AttributeValue> {
        match key {
            "ip" | "sourceIp" => text(&self.ip),
            "userAgent" => text(&self.user_agent),
            "mfaVerified" => Some(AttributeValue::Flag(self.mfa_verified)),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// Everything an evaluation looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionContext {
    /// Requesting subject.
    pub subject: SubjectAttributes,
    /// Target resource.
    pub resource: ResourceAttributes,
    /// Attempted action, e.g. `read`.
    pub action: String,
    /// Request circumstances.
    pub environment: EnvironmentAttributes,
}

impl DecisionContext {
    /// Assemble a context.
    pub fn new(
        subject: SubjectAttributes,
        resource: ResourceAttributes,
        action: impl Into<String>,
        environment: EnvironmentAttributes,
    ) -> Self {
        Self {
            subject,
            resource,
            action: action.into(),
            environment,
        }
    }
}
