//! Audit trail helpers.
//!
//! Status transitions stage their entry inside the same transaction as the
//! change. Vote entries go through [`AuditLog::record_best_effort`] after the
//! vote has committed, and a failure there is only logged.

use std::sync::Arc;

use chrono::Utc;
use domains::{AuditLogEntry, DocumentStore, TargetType, Write};

use crate::new_id;

pub fn entry(
    actor_id: &str,
    community_id: &str,
    target_type: TargetType,
    target_id: &str,
    action: &str,
) -> AuditLogEntry {
    AuditLogEntry {
        id: new_id(),
        actor_id: actor_id.to_string(),
        community_id: community_id.to_string(),
        target_type,
        target_id: target_id.to_string(),
        action: action.to_string(),
        old_status: None,
        new_status: None,
        detail: None,
        at: Utc::now(),
    }
}

/// Entry for a status change. `new_status` is `None` when the target was removed.
pub fn transition(
    actor_id: &str,
    community_id: &str,
    target_type: TargetType,
    target_id: &str,
    action: &str,
    old_status: &str,
    new_status: Option<&str>,
) -> AuditLogEntry {
    AuditLogEntry {
        old_status: Some(old_status.to_string()),
        new_status: Some(new_status.unwrap_or("removed").to_string()),
        ..entry(actor_id, community_id, target_type, target_id, action)
    }
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn DocumentStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Appends an entry outside any transaction. Never fails the caller.
    pub async fn record_best_effort(&self, entry: AuditLogEntry) {
        let write = match Write::set(&entry) {
            Ok(write) => write,
            Err(err) => {
                tracing::warn!(action = %entry.action, %err, "audit entry not encodable");
                return;
            }
        };
        if let Err(err) = self.store.commit_batch(vec![write]).await {
            tracing::warn!(
                action = %entry.action,
                target = %entry.target_id,
                %err,
                "audit entry dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{AuditLogEntry, MockDocumentStore, StoreError};

    #[tokio::test]
    async fn test_best_effort_swallows_store_failure() {
        let mut store = MockDocumentStore::new();
        store
            .expect_commit_batch()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("down".into())));
        let log = AuditLog::new(Arc::new(store));
        log.record_best_effort(entry("u1", "c1", TargetType::Post, "p1", "vote.upvote")).await;
    }

    #[test]
    fn test_transition_marks_removal() {
        let e: AuditLogEntry =
            transition("mod", "c1", TargetType::Post, "p1", "purge", "archived", None);
        assert_eq!(e.old_status.as_deref(), Some("archived"));
        assert_eq!(e.new_status.as_deref(), Some("removed"));
    }
}
