//! ---
//! bastion_section: "04-admission-control"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Blocklist and bucketed rate limiting for request admission."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors surfaced by blocklist stores.
#[derive(Debug, Error)]
pub enum BlocklistError {
    /// The store could not be reached; callers must treat the identity as blocked.
    #[error("blocklist unavailable: {0}")]
    Unavailable(String),
    /// Statically configured entries cannot be removed at runtime.
    #[error("identity {0} is blocked by static configuration")]
    Static(String),
}

/// A blocked identity with the reason it was blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Blocked IP address or user id.
    pub identity: String,
    /// Why it was blocked.
    pub reason: String,
    /// When it was blocked; `None` for static entries.
    pub blocked_at: Option<DateTime<Utc>>,
    /// Whether the entry comes from configuration.
    pub is_static: bool,
}

/// Set of identities refused by the admission gate. Entries never expire.
#[async_trait]
pub trait Blocklist: Send + Sync {
    /// Whether `identity` is blocked.
    async fn is_blocked(&self, identity: &str) -> Result<bool, BlocklistError>;

    /// Block `identity`. Returns `false` if it was already blocked.
    async fn block(
        &self,
        identity: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, BlocklistError>;

    /// Lift a dynamic block. Returns `false` if the identity was not blocked.
    async fn unblock(&self, identity: &str) -> Result<bool, BlocklistError>;

    /// Every blocked identity.
    async fn entries(&self) -> Result<Vec<BlockEntry>, BlocklistError>;
}

/// Process-local blocklist combining static configuration with runtime blocks.
#[derive(Debug, Default)]
pub struct InMemoryBlocklist {
    static_entries: HashSet<String>,
    dynamic: RwLock<HashMap<String, BlockEntry>>,
}

impl InMemoryBlocklist {
    /// Blocklist seeded with configured identities.
    pub fn new(static_entries: impl IntoIterator<Item = String>) -> Self {
        Self {
            static_entries: static_entries.into_iter().collect(),
            dynamic: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Blocklist for InMemoryBlocklist {
    async fn is_blocked(&self, identity: &str) -> Result<bool, BlocklistError> {
        Ok(self.static_entries.contains(identity) || self.dynamic.read().contains_key(identity))
    }

    async fn block(
        &self,
        identity: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, BlocklistError> {
        if self.static_entries.contains(identity) {
            return Ok(false);
        }
        let mut dynamic = self.dynamic.write();
        if dynamic.contains_key(identity) {
            return Ok(false);
        }
        dynamic.insert(
            identity.to_owned(),
            BlockEntry {
                identity: identity.to_owned(),
                reason: reason.to_owned(),
                blocked_at: Some(at),
                is_static: false,
            },
        );
        info!(identity, reason, "identity blocked");
        Ok(true)
    }

    async fn unblock(&self, identity: &str) -> Result<bool, BlocklistError> {
        if self.static_entries.contains(identity) {
            return Err(BlocklistError::Static(identity.to_owned()));
        }
        let removed = self.dynamic.write().remove(identity).is_some();
        if removed {
            info!(identity, "identity unblocked");
        }
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<BlockEntry>, BlocklistError> {
        let mut entries: Vec<BlockEntry> = self
            .static_entries
            .iter()
            .map(|identity| BlockEntry {
                identity: identity.clone(),
                reason: "static configuration".to_owned(),
                blocked_at: None,
                is_static: true,
            })
            .collect();
        entries.extend(self.dynamic.read().values().cloned());
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_is_idempotent_and_reversible() {
        let blocklist = InMemoryBlocklist::default();
        let now = Utc::now();
        assert!(!blocklist.is_blocked("10.0.0.5").await.unwrap());
        assert!(blocklist.block("10.0.0.5", "brute force", now).await.unwrap());
        assert!(!blocklist.block("10.0.0.5", "again", now).await.unwrap());
        assert!(blocklist.is_blocked("10.0.0.5").await.unwrap());

        let entries = blocklist.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "brute force");

        assert!(blocklist.unblock("10.0.0.5").await.unwrap());
        assert!(!blocklist.unblock("10.0.0.5").await.unwrap());
        assert!(!blocklist.is_blocked("10.0.0.5").await.unwrap());
    }

    #[tokio::test]
    async fn static_entries_cannot_be_lifted() {
        let blocklist = InMemoryBlocklist::new(vec!["203.0.113.9".to_string()]);
        assert!(blocklist.is_blocked("203.0.113.9").await.unwrap());
        assert!(!blocklist
            .block("203.0.113.9", "dup", Utc::now())
            .await
            .unwrap());
        assert!(matches!(
            blocklist.unblock("203.0.113.9").await,
            Err(BlocklistError::Static(_))
        ));
        assert!(blocklist.entries().await.unwrap()[0].is_static);
    }
}
