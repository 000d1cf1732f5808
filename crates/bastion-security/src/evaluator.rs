//! ---
//! bastion_section: "02-access-control"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Attribute-based access control model and evaluation."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use bastion_common::time::LocalZone;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attributes::DecisionContext;
use crate::policy::{parse_policies, Effect, Policy, PolicyError};

/// Final outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The action may proceed.
    Allow,
    /// The action must be refused.
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}

/// Summary of a policy that matched during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPolicy {
    /// Policy identifier.
    pub id: String,
    /// Policy name.
    pub name: String,
    /// Effect the policy carries.
    pub effect: Effect,
    /// Policy priority.
    pub priority: i32,
}

impl From<&Policy> for MatchedPolicy {
    fn from(policy: &Policy) -> Self {
        Self {
            id: policy.id.clone(),
            name: policy.name.clone(),
            effect: policy.effect,
            priority: policy.priority,
        }
    }
}

/// Decision, the policies that matched in evaluation order, and a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvaluationResult {
    /// Allow or deny.
    pub decision: Decision,
    /// Policies that matched, in priority order, up to the deciding one.
    pub matched_policies: Vec<MatchedPolicy>,
    /// Human-readable explanation.
    pub reason: String,
}

impl PolicyEvaluationResult {
    /// Whether the decision is [`Decision::Allow`].
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

#[derive(Debug, Clone, Default)]
struct PolicySet {
    // (insertion sequence, policy), kept sorted by priority desc then sequence asc.
    entries: Vec<(u64, Arc<Policy>)>,
    next_seq: u64,
}

impl PolicySet {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|(_, policy)| policy.id == id)
    }

    fn push(&mut self, policy: Policy) {
        self.entries.push((self.next_seq, Arc::new(policy)));
        self.next_seq += 1;
    }

    fn sort(&mut self) {
        self.entries.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority.cmp(&a.priority).then(seq_a.cmp(seq_b))
        });
    }
}

/// Holds the policy set and evaluates decision contexts against it.
///
/// Readers take an `Arc` snapshot of the sorted set; writers build a new set and
/// publish it in one swap, so an evaluation never observes a half-applied edit.
#[derive(Debug, Default)]
pub struct PolicyEvaluator {
    policies: RwLock<Arc<PolicySet>>,
    zone: LocalZone,
}

impl PolicyEvaluator {
    /// Empty evaluator using `zone` for business-hours checks.
    pub fn new(zone: LocalZone) -> Self {
        Self {
            policies: RwLock::new(Arc::new(PolicySet::default())),
            zone,
        }
    }

    fn snapshot(&self) -> Arc<PolicySet> {
        self.policies.read().clone()
    }

    fn modify<T>(
        &self,
        edit: impl FnOnce(&mut PolicySet) -> Result<T, PolicyError>,
    ) -> Result<T, PolicyError> {
        let mut guard = self.policies.write();
        let mut next = PolicySet::clone(&guard);
        let out = edit(&mut next)?;
        next.sort();
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Add a new policy. Ids must be unique.
    pub fn add(&self, policy: Policy) -> Result<(), PolicyError> {
        policy.validate()?;
        let id = policy.id.clone();
        self.modify(|set| {
            if set.position(&policy.id).is_some() {
                return Err(PolicyError::Duplicate(policy.id));
            }
            set.push(policy);
            Ok(())
        })?;
        info!(policy = %id, "policy added");
        Ok(())
    }

    /// Replace an existing policy, keeping its original insertion position for ties.
    pub fn update(&self, policy: Policy) -> Result<(), PolicyError> {
        policy.validate()?;
        let id = policy.id.clone();
        self.modify(|set| {
            let index = set
                .position(&policy.id)
                .ok_or_else(|| PolicyError::NotFound(policy.id.clone()))?;
            set.entries[index].1 = Arc::new(policy);
            Ok(())
        })?;
        info!(policy = %id, "policy updated");
        Ok(())
    }

    /// Remove a policy, returning it.
    pub fn remove(&self, id: &str) -> Result<Policy, PolicyError> {
        let removed = self.modify(|set| {
            let index = set
                .position(id)
                .ok_or_else(|| PolicyError::NotFound(id.to_owned()))?;
            Ok(set.entries.remove(index).1)
        })?;
        info!(policy = %id, "policy removed");
        Ok(Policy::clone(&removed))
    }

    /// Look up a policy by id.
    pub fn get(&self, id: &str) -> Option<Policy> {
        let set = self.snapshot();
        set.position(id).map(|index| Policy::clone(&set.entries[index].1))
    }

    /// Every policy in evaluation order.
    pub fn list(&self) -> Vec<Policy> {
        self.snapshot()
            .entries
            .iter()
            .map(|(_, policy)| Policy::clone(policy))
            .collect()
    }

    /// Number of policies held.
    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    /// Whether no policies are held.
    pub fn is_empty(&self) -> bool {
        self.snapshot().entries.is_empty()
    }

    /// Swap the whole set. Nothing changes unless every policy validates and ids are unique.
    pub fn replace_all(&self, policies: Vec<Policy>) -> Result<(), PolicyError> {
        let mut next = PolicySet::default();
        for policy in policies {
            policy.validate()?;
            if next.position(&policy.id).is_some() {
                return Err(PolicyError::Duplicate(policy.id));
            }
            next.push(policy);
        }
        next.sort();
        let count = next.entries.len();
        *self.policies.write() = Arc::new(next);
        info!(policies = count, "policy set replaced");
        Ok(())
    }

    /// Parse a JSON document (array or single object) and replace the set with it.
    pub fn load_json(&self, document: &str) -> Result<usize, PolicyError> {
        let policies = parse_policies(document)?;
        let count = policies.len();
        self.replace_all(policies)?;
        Ok(count)
    }

    /// Deny-overrides evaluation with default deny.
    pub fn evaluate(&self, context: &DecisionContext) -> PolicyEvaluationResult {
        let set = self.snapshot();
        let mut matched = Vec::new();
        let mut first_allow: Option<String> = None;

        for (_, policy) in &set.entries {
            if !policy.matches(context, self.zone) {
                continue;
            }
            matched.push(MatchedPolicy::from(policy.as_ref()));
            match policy.effect {
                Effect::Deny => {
                    debug!(policy = %policy.id, action = %context.action, "denied by policy");
                    return PolicyEvaluationResult {
                        decision: Decision::Deny,
                        matched_policies: matched,
                        reason: format!("denied by policy '{}'", policy.name),
                    };
                }
                Effect::Allow => {
                    if first_allow.is_none() {
                        first_allow = Some(policy.name.clone());
                    }
                }
            }
        }

        match first_allow {
            Some(name) => PolicyEvaluationResult {
                decision: Decision::Allow,
                matched_policies: matched,
                reason: format!("allowed by policy '{name}'"),
            },
            None => PolicyEvaluationResult {
                decision: Decision::Deny,
                matched_policies: matched,
                reason: "no matching policies".to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{EnvironmentAttributes, ResourceAttributes, SubjectAttributes};
    use crate::policy::AttributeMatcher;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn policy(id: &str, effect: Effect, priority: i32, action: &str) -> Policy {
        Policy {
            id: id.to_owned(),
            name: format!("{id} name"),
            description: String::new(),
            subject: BTreeMap::new(),
            resource: BTreeMap::new(),
            action: AttributeMatcher::parse(action),
            environment: Default::default(),
            effect,
            priority,
        }
    }

    fn context(action: &str) -> DecisionContext {
        DecisionContext::new(
            SubjectAttributes::new("u-1").with_role("analyst"),
            ResourceAttributes::new("report"),
            action,
            EnvironmentAttributes::at(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()),
        )
    }

    #[test]
    fn empty_set_denies_by_default() {
        let evaluator = PolicyEvaluator::new(LocalZone::utc());
        let result = evaluator.evaluate(&context("read"));
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.reason, "no matching policies");
        assert!(result.matched_policies.is_empty());
    }

    #[test]
    fn deny_overrides_higher_priority_allow() {
        let evaluator = PolicyEvaluator::new(LocalZone::utc());
        evaluator.add(policy("p1", Effect::Allow, 90, "read")).unwrap();
        evaluator.add(policy("p2", Effect::Deny, 50, "*")).unwrap();
        let result = evaluator.evaluate(&context("read"));
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.reason, "denied by policy 'p2 name'");
        let ids: Vec<_> = result.matched_policies.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[test]
    fn allow_requires_a_match_and_no_deny() {
        let evaluator = PolicyEvaluator::new(LocalZone::utc());
        evaluator.add(policy("p1", Effect::Allow, 10, "read|write")).unwrap();
        evaluator.add(policy("p2", Effect::Deny, 5, "delete")).unwrap();
        let result = evaluator.evaluate(&context("write"));
        assert!(result.is_allowed());
        assert_eq!(result.reason, "allowed by policy 'p1 name'");
        assert!(!evaluator.evaluate(&context("delete")).is_allowed());
        assert_eq!(
            evaluator.evaluate(&context("archive")).reason,
            "no matching policies"
        );
    }

    #[test]
    fn administration_keeps_order_and_rejects_conflicts() {
        let evaluator = PolicyEvaluator::new(LocalZone::utc());
        evaluator.add(policy("a", Effect::Allow, 10, "read")).unwrap();
        evaluator.add(policy("b", Effect::Allow, 10, "read")).unwrap();
        evaluator.add(policy("c", Effect::Allow, 20, "read")).unwrap();
        assert!(matches!(
            evaluator.add(policy("a", Effect::Deny, 1, "read")),
            Err(PolicyError::Duplicate(_))
        ));

        let ids = |e: &PolicyEvaluator| e.list().into_iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(&evaluator), vec!["c", "a", "b"]);

        // Update keeps the original tie-breaking position.
        evaluator.update(policy("a", Effect::Deny, 10, "read")).unwrap();
        assert_eq!(ids(&evaluator), vec!["c", "a", "b"]);
        assert_eq!(evaluator.get("a").unwrap().effect, Effect::Deny);

        evaluator.update(policy("b", Effect::Allow, 30, "read")).unwrap();
        assert_eq!(ids(&evaluator), vec!["b", "c", "a"]);

        evaluator.remove("c").unwrap();
        assert!(matches!(evaluator.remove("c"), Err(PolicyError::NotFound(_))));
        assert!(matches!(
            evaluator.update(policy("zz", Effect::Allow, 1, "read")),
            Err(PolicyError::NotFound(_))
        ));
        assert_eq!(evaluator.len(), 2);
    }

    #[test]
    fn invalid_batch_leaves_set_untouched() {
        let evaluator = PolicyEvaluator::new(LocalZone::utc());
        evaluator.add(policy("keep", Effect::Allow, 1, "read")).unwrap();
        let err = evaluator
            .load_json(
                r#"[
                    {"id": "ok", "name": "ok", "action": "read", "effect": "allow"},
                    {"id": "bad", "name": "bad", "action": "read|", "effect": "allow"}
                ]"#,
            )
            .unwrap_err();
        assert!(matches!(err, PolicyError::MalformedMatcher { .. }));
        assert_eq!(evaluator.list()[0].id, "keep");

        let loaded = evaluator
            .load_json(r#"[{"id": "ok", "name": "ok", "action": "read", "effect": "allow"}]"#)
            .unwrap();
        assert_eq!(loaded, 1);
        assert!(evaluator.get("keep").is_none());
    }

    proptest! {
        #[test]
        fn evaluation_order_is_priority_desc_then_insertion(
            priorities in proptest::collection::vec(-5i32..5, 0..24)
        ) {
            let evaluator = PolicyEvaluator::new(LocalZone::utc());
            for (index, priority) in priorities.iter().enumerate() {
                evaluator
                    .add(policy(&format!("p{index}"), Effect::Allow, *priority, "read"))
                    .unwrap();
            }
            let listed = evaluator.list();
            for pair in listed.windows(2) {
                prop_assert!(pair[0].priority >= pair[1].priority);
                if pair[0].priority == pair[1].priority {
                    let a: usize = pair[0].id[1..].parse().unwrap();
                    let b: usize = pair[1].id[1..].parse().unwrap();
                    prop_assert!(a < b);
                }
            }
            let result = evaluator.evaluate(&context("read"));
            let matched: Vec<String> = result.matched_policies.into_iter().map(|m| m.id).collect();
            let expected: Vec<String> = listed.into_iter().map(|p| p.id).collect();
            prop_assert_eq!(matched, expected);
        }
    }
}
