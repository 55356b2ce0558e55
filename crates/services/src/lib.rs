//! # services
//!
//! Business logic for the community platform. Every service receives its
//! `DocumentStore` explicitly, so callers decide which backend runs
//! underneath and tests can substitute the in-memory adapter or a mock.

use std::sync::Arc;

use domains::{AppError, DocumentStore};
use uuid::Uuid;

pub mod audit;
pub mod comments;
pub mod lifecycle;
pub mod notifications;
pub mod preferences;
pub mod roles;
pub mod votes;

pub use comments::{build_comment_tree, CommentNode, CommentService, NewComment};
pub use lifecycle::{LifecycleAction, NewPost, PostService, Transition};
pub use notifications::{FanOutReport, FanOutRequest, NotificationFanOut, NotificationInbox};
pub use preferences::{should_deliver, PreferenceResolver};
pub use roles::RoleResolver;
pub use votes::VoteLedger;

/// Tunables shared by the services. The binary fills these from `configs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Attempts per optimistic transaction before surfacing `Conflict`.
    pub max_transaction_attempts: u32,
    /// Notification writes per batch. Clamped to the store's own ceiling.
    pub notification_batch_size: usize,
    /// Page size when listing community members for a fan-out.
    pub member_page_size: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self { max_transaction_attempts: 5, notification_batch_size: 450, member_page_size: 200 }
    }
}

/// All services wired against one store.
#[derive(Clone)]
pub struct CommunityServices {
    pub roles: RoleResolver,
    pub preferences: PreferenceResolver,
    pub votes: VoteLedger,
    pub comments: CommentService,
    pub notifications: NotificationFanOut,
    pub inbox: NotificationInbox,
    pub posts: PostService,
}

impl CommunityServices {
    pub fn new(store: Arc<dyn DocumentStore>, options: ServiceOptions) -> Self {
        let roles = RoleResolver::new(store.clone());
        let preferences = PreferenceResolver::new(store.clone(), options.max_transaction_attempts);
        let notifications = NotificationFanOut::new(
            store.clone(),
            preferences.clone(),
            roles.clone(),
            options.notification_batch_size,
            options.member_page_size,
        );
        Self {
            votes: VoteLedger::new(store.clone(), options.max_transaction_attempts),
            comments: CommentService::new(store.clone(), roles.clone(), options.max_transaction_attempts),
            inbox: NotificationInbox::new(store.clone(), options.max_transaction_attempts),
            posts: PostService::new(
                store,
                roles.clone(),
                notifications.clone(),
                options.max_transaction_attempts,
            ),
            roles,
            preferences,
            notifications,
        }
    }
}

/// Time-ordered document id.
pub(crate) fn new_id() -> String {
    Uuid::now_v7().to_string()
}

pub(crate) fn require(field: &str, value: &str) -> domains::Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} is required")));
    }
    Ok(())
}

/// Counts optimistic-transaction attempts for one operation.
pub(crate) struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    pub(crate) fn new(max: u32) -> Self {
        Self { max: max.max(1), used: 0 }
    }

    /// Starts another attempt, or returns false once the budget is spent.
    pub(crate) fn next_attempt(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.used
    }

    pub(crate) fn exhausted(&self, what: &str) -> AppError {
        AppError::Conflict(format!("{what} still contended after {} attempts", self.used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_counts_attempts() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.next_attempt());
        assert!(budget.next_attempt());
        assert!(!budget.next_attempt());
        assert_eq!(budget.attempt(), 2);
        assert!(matches!(budget.exhausted("vote"), AppError::Conflict(_)));
    }

    #[test]
    fn test_zero_budget_still_runs_once() {
        let mut budget = RetryBudget::new(0);
        assert!(budget.next_attempt());
        assert!(!budget.next_attempt());
    }

    #[test]
    fn test_require_rejects_blank() {
        assert!(require("title", "  ").is_err());
        assert!(require("title", "ok").is_ok());
    }
}
