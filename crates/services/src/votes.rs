//! # Vote ledger
//!
//! Keeps at most one vote per (user, target) and the target's counters in
//! step with the votes, inside one optimistic transaction per vote.
//!
//! | existing vote | incoming | result                         |
//! |---------------|----------|--------------------------------|
//! | none          | X        | create X, X + 1                |
//! | X             | X        | remove (toggle off), X - 1     |
//! | Y             | X        | switch to X, Y - 1, X + 1      |

use std::sync::Arc;

use chrono::Utc;
use domains::{
    lookup, AppError, ContentStats, DocumentStore, Record, Result, TargetType, Transaction, Vote,
    VoteType,
};
use serde_json::json;

use crate::audit::{self, AuditLog};
use crate::{require, RetryBudget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteChange {
    Created,
    Removed,
    Switched { from: VoteType },
}

impl VoteChange {
    fn action(self, vote_type: VoteType) -> String {
        match self {
            VoteChange::Created => format!("vote.{}", vote_type.as_str()),
            VoteChange::Removed => format!("vote.{}.removed", vote_type.as_str()),
            VoteChange::Switched { from } => {
                format!("vote.{}_to_{}", from.as_str(), vote_type.as_str())
            }
        }
    }
}

#[derive(Clone)]
pub struct VoteLedger {
    store: Arc<dyn DocumentStore>,
    audit: AuditLog,
    max_attempts: u32,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: u32) -> Self {
        Self { audit: AuditLog::new(store.clone()), store, max_attempts }
    }

    /// Applies one voting action and returns the target's updated counters.
    ///
    /// Conflicting concurrent votes rerun the transaction body. Only an
    /// exhausted retry budget surfaces, as `AppError::Conflict`.
    #[tracing::instrument(skip(self))]
    pub async fn apply_vote(
        &self,
        target_id: &str,
        target_type: TargetType,
        user_id: &str,
        community_id: &str,
        vote_type: VoteType,
    ) -> Result<ContentStats> {
        require("targetId", target_id)?;
        require("userId", user_id)?;
        require("communityId", community_id)?;

        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let (stats, change) = self
                .stage_vote(&mut tx, target_id, target_type, user_id, community_id, vote_type)
                .await?;

            match tx.commit().await {
                Ok(()) => {
                    let entry = audit::entry(
                        user_id,
                        community_id,
                        target_type,
                        target_id,
                        &change.action(vote_type),
                    );
                    self.audit.record_best_effort(entry).await;
                    tracing::debug!(?stats, "vote applied");
                    return Ok(stats);
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "vote transaction conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("vote on {target_type} {target_id}")))
    }

    /// The user's active vote on a target, if any.
    pub async fn current_vote(
        &self,
        user_id: &str,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<Vote>> {
        let id = Vote::doc_id(user_id, target_type, target_id);
        match self.store.get(Vote::COLLECTION, &id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    async fn stage_vote(
        &self,
        tx: &mut Transaction<'_>,
        target_id: &str,
        target_type: TargetType,
        user_id: &str,
        community_id: &str,
        vote_type: VoteType,
    ) -> Result<(ContentStats, VoteChange)> {
        let collection = target_type.collection();
        let target = tx
            .get(collection, target_id)
            .await?
            .ok_or_else(|| AppError::not_found(target_type.as_str(), target_id))?;

        let closed_status = match target_type {
            TargetType::Post => "archived",
            TargetType::Comment => "deleted",
        };
        if lookup(&target.data, "status").and_then(|s| s.as_str()) == Some(closed_status) {
            return Err(AppError::validation(format!(
                "cannot vote on {closed_status} {target_type} {target_id}"
            )));
        }

        if let Some(owner) = lookup(&target.data, "communityId").and_then(|c| c.as_str()) {
            if owner != community_id {
                return Err(AppError::validation(format!(
                    "{target_type} {target_id} does not belong to community {community_id}"
                )));
            }
        }

        let mut stats: ContentStats = match lookup(&target.data, "stats") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => ContentStats::default(),
        };

        let vote_id = Vote::doc_id(user_id, target_type, target_id);
        let change = match tx.get_record::<Vote>(&vote_id).await? {
            None => {
                stats.increment(vote_type);
                tx.set(&Vote {
                    id: vote_id,
                    user: user_id.to_string(),
                    community_id: community_id.to_string(),
                    target_type,
                    target_id: target_id.to_string(),
                    vote_type,
                    created_at: Utc::now(),
                })?;
                VoteChange::Created
            }
            Some(existing) if existing.vote_type == vote_type => {
                stats.decrement(vote_type);
                tx.delete(Vote::COLLECTION, &vote_id);
                VoteChange::Removed
            }
            Some(mut existing) => {
                let from = existing.vote_type;
                stats.decrement(from);
                stats.increment(vote_type);
                existing.vote_type = vote_type;
                tx.set(&existing)?;
                VoteChange::Switched { from }
            }
        };

        tx.merge(collection, target_id, json!({ "stats": stats }))?;
        Ok((stats, change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{AuditLogEntry, Document, MockDocumentStore, StoreError};
    use storage_adapters::InMemoryDocumentStore;

    async fn store_with_post() -> Arc<InMemoryDocumentStore> {
        let store = Arc::new(InMemoryDocumentStore::new());
        store
            .commit_batch(vec![domains::Write::Set {
                collection: "posts".into(),
                id: "p1".into(),
                data: json!({
                    "communityId": "c1",
                    "status": "active",
                    "stats": { "upvotes": 0, "downvotes": 0, "commentCount": 4 }
                }),
            }])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_toggle_and_switch_sequence() {
        let store = store_with_post().await;
        let ledger = VoteLedger::new(store.clone(), 5);
        let vote = |user: &'static str, vt| {
            let ledger = ledger.clone();
            async move { ledger.apply_vote("p1", TargetType::Post, user, "c1", vt).await.unwrap() }
        };

        assert_eq!(vote("u1", VoteType::Upvote).await, ContentStats { upvotes: 1, downvotes: 0, comment_count: 4 });
        assert_eq!(vote("u1", VoteType::Downvote).await, ContentStats { upvotes: 0, downvotes: 1, comment_count: 4 });
        assert_eq!(vote("u1", VoteType::Downvote).await, ContentStats { upvotes: 0, downvotes: 0, comment_count: 4 });
        assert!(ledger.current_vote("u1", TargetType::Post, "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_switch_keeps_original_created_at() {
        let store = store_with_post().await;
        let ledger = VoteLedger::new(store.clone(), 5);
        ledger.apply_vote("p1", TargetType::Post, "u1", "c1", VoteType::Upvote).await.unwrap();
        let first = ledger.current_vote("u1", TargetType::Post, "p1").await.unwrap().unwrap();
        ledger.apply_vote("p1", TargetType::Post, "u1", "c1", VoteType::Downvote).await.unwrap();
        let second = ledger.current_vote("u1", TargetType::Post, "p1").await.unwrap().unwrap();
        assert_eq!(second.vote_type, VoteType::Downvote);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_missing_target_is_not_found() {
        let ledger = VoteLedger::new(Arc::new(InMemoryDocumentStore::new()), 5);
        let err = ledger
            .apply_vote("nope", TargetType::Comment, "u1", "c1", VoteType::Upvote)
            .await
            .unwrap_err();
        assert_eq!(err, AppError::not_found("comment", "nope"));
    }

    #[tokio::test]
    async fn test_vote_under_foreign_community_is_rejected() {
        let store = store_with_post().await;
        let ledger = VoteLedger::new(store.clone(), 5);
        let err = ledger
            .apply_vote("p1", TargetType::Post, "u1", "c2", VoteType::Upvote)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert!(store.is_empty(Vote::COLLECTION));
        assert!(store.is_empty(AuditLogEntry::COLLECTION));
    }

    #[tokio::test]
    async fn test_archived_post_rejects_votes() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store
            .commit_batch(vec![domains::Write::Set {
                collection: "posts".into(),
                id: "p1".into(),
                data: json!({ "status": "archived" }),
            }])
            .await
            .unwrap();
        let ledger = VoteLedger::new(store, 5);
        let err = ledger
            .apply_vote("p1", TargetType::Post, "u1", "c1", VoteType::Upvote)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_transparently() {
        let store = store_with_post().await;
        store.inject_conflicts(3);
        let ledger = VoteLedger::new(store.clone(), 5);
        let stats = ledger
            .apply_vote("p1", TargetType::Post, "u1", "c1", VoteType::Upvote)
            .await
            .unwrap();
        assert_eq!(stats.upvotes, 1);
        assert_eq!(store.len(Vote::COLLECTION), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_conflict() {
        let store = store_with_post().await;
        store.inject_conflicts(2);
        let ledger = VoteLedger::new(store.clone(), 2);
        let err = ledger
            .apply_vote("p1", TargetType::Post, "u1", "c1", VoteType::Upvote)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(store.is_empty(Vote::COLLECTION));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_vote() {
        let mut store = MockDocumentStore::new();
        store.expect_get().returning(|collection, id| {
            Ok((collection == "posts").then(|| Document {
                id: id.to_string(),
                version: 1,
                data: json!({ "status": "active", "stats": {} }),
            }))
        });
        store.expect_commit().times(1).returning(|_, _| Ok(()));
        store
            .expect_commit_batch()
            .withf(|writes| writes.iter().all(|w| w.collection() == AuditLogEntry::COLLECTION))
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("audit sink down".into())));

        let ledger = VoteLedger::new(Arc::new(store), 5);
        let stats = ledger
            .apply_vote("p1", TargetType::Post, "u1", "c1", VoteType::Downvote)
            .await
            .unwrap();
        assert_eq!(stats, ContentStats::new(0, 1));
    }
}
