//! # Post lifecycle
//!
//! ```text
//!   active ──Archive──▶ archived
//!   active ──Pin{until}──▶ pinned ──Unpin──▶ active
//!   active | archived ──Purge──▶ (removed)
//! ```
//!
//! Archive is the soft removal and Purge the hard one; they are separate
//! actions on purpose. Each transition commits together with its audit entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domains::{
    AppError, Category, Comment, DocumentStore, Permission, Post, PostStatus, Query, Record, Result,
    TargetType, Transaction, Vote, Write,
};
use serde_json::json;

use crate::notifications::{FanOutRequest, NotificationFanOut};
use crate::roles::RoleResolver;
use crate::{audit, new_id, require, RetryBudget};

pub const MAX_TITLE_LENGTH: usize = 300;
pub const MAX_POST_LENGTH: usize = 40_000;
const PREVIEW_LENGTH: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Archive,
    Pin { until: DateTime<Utc> },
    Unpin,
    Purge,
}

impl LifecycleAction {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleAction::Archive => "post.archive",
            LifecycleAction::Pin { .. } => "post.pin",
            LifecycleAction::Unpin => "post.unpin",
            LifecycleAction::Purge => "post.purge",
        }
    }

    fn permission(&self) -> Permission {
        match self {
            LifecycleAction::Archive => Permission::Archive,
            LifecycleAction::Pin { .. } | LifecycleAction::Unpin => Permission::Pin,
            LifecycleAction::Purge => Permission::Moderate,
        }
    }

    /// Authors may archive or purge their own posts. Pinning is always a role action.
    fn author_may_act(&self) -> bool {
        matches!(self, LifecycleAction::Archive | LifecycleAction::Purge)
    }

    /// Next status from `current`, `None` meaning the post is removed.
    pub fn next_status(&self, current: PostStatus, now: DateTime<Utc>) -> Result<Option<PostStatus>> {
        match (self, current) {
            (LifecycleAction::Archive, PostStatus::Active) => Ok(Some(PostStatus::Archived)),
            (LifecycleAction::Pin { until }, PostStatus::Active) => {
                if *until <= now {
                    return Err(AppError::validation("pin expiry must be in the future"));
                }
                Ok(Some(PostStatus::Pinned))
            }
            (LifecycleAction::Unpin, PostStatus::Pinned) => Ok(Some(PostStatus::Active)),
            (LifecycleAction::Purge, PostStatus::Active | PostStatus::Archived) => Ok(None),
            (action, status) => Err(AppError::validation(format!(
                "{} is not allowed from {}",
                action.name(),
                status.as_str()
            ))),
        }
    }
}

/// Result of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub post_id: String,
    pub from: PostStatus,
    /// `None` once the post has been purged.
    pub to: Option<PostStatus>,
}

/// Input for [`PostService::create_post`].
#[derive(Debug, Clone)]
pub struct NewPost {
    pub community_id: String,
    pub author_id: String,
    pub title: String,
    pub content: String,
    pub category: Category,
}

#[derive(Clone)]
pub struct PostService {
    store: Arc<dyn DocumentStore>,
    roles: RoleResolver,
    notifications: NotificationFanOut,
    max_attempts: u32,
}

impl PostService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        roles: RoleResolver,
        notifications: NotificationFanOut,
        max_attempts: u32,
    ) -> Self {
        Self { store, roles, notifications, max_attempts }
    }

    /// Publishes a post, then announces it to the community.
    ///
    /// The announcement is best-effort: a failed fan-out is logged and the
    /// post stays published.
    #[tracing::instrument(skip(self, new), fields(community = %new.community_id, author = %new.author_id))]
    pub async fn create_post(&self, new: NewPost) -> Result<Post> {
        require("communityId", &new.community_id)?;
        require("authorId", &new.author_id)?;
        require("title", &new.title)?;
        require("content", &new.content)?;
        if new.title.chars().count() > MAX_TITLE_LENGTH {
            return Err(AppError::validation(format!("title exceeds {MAX_TITLE_LENGTH} characters")));
        }
        if new.content.chars().count() > MAX_POST_LENGTH {
            return Err(AppError::validation(format!("content exceeds {MAX_POST_LENGTH} characters")));
        }
        if new.category.is_emergency_alert() {
            self.roles
                .authorize(&new.author_id, &new.community_id, None, Permission::PostEmergency)
                .await?;
        }

        let now = Utc::now();
        let post = Post {
            id: new_id(),
            community_id: new.community_id,
            author_id: new.author_id,
            title: new.title,
            content: new.content,
            category: new.category,
            stats: Default::default(),
            status: PostStatus::Active,
            pinned_until: None,
            created_at: now,
            updated_at: now,
        };
        self.store.commit_batch(vec![Write::set(&post)?]).await?;
        tracing::info!(post = %post.id, "post created");

        let preview: String = post.content.chars().take(PREVIEW_LENGTH).collect();
        let announcement = FanOutRequest::new(
            post.community_id.as_str(),
            post.id.as_str(),
            post.title.as_str(),
            preview,
            post.category,
        )
        .from_sender(post.author_id.as_str())
        .excluding(post.author_id.as_str());
        if let Err(err) = self.notifications.fan_out(announcement).await {
            tracing::warn!(post = %post.id, %err, "post announcement failed");
        }
        Ok(post)
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Post> {
        match self.store.get(Post::COLLECTION, post_id).await? {
            Some(doc) => Ok(doc.decode()?),
            None => Err(AppError::not_found("post", post_id)),
        }
    }

    pub async fn archive_post(&self, post_id: &str, actor_id: &str) -> Result<Transition> {
        self.transition(post_id, actor_id, LifecycleAction::Archive).await
    }

    pub async fn pin_post(&self, post_id: &str, actor_id: &str, until: DateTime<Utc>) -> Result<Transition> {
        self.transition(post_id, actor_id, LifecycleAction::Pin { until }).await
    }

    pub async fn unpin_post(&self, post_id: &str, actor_id: &str) -> Result<Transition> {
        self.transition(post_id, actor_id, LifecycleAction::Unpin).await
    }

    /// Hard delete. Comments and votes under the post are cleaned up afterwards.
    pub async fn purge_post(&self, post_id: &str, actor_id: &str) -> Result<Transition> {
        let transition = self.transition(post_id, actor_id, LifecycleAction::Purge).await?;
        self.purge_dependents(post_id).await;
        Ok(transition)
    }

    #[tracing::instrument(skip(self, action), fields(action = action.name()))]
    pub async fn transition(&self, post_id: &str, actor_id: &str, action: LifecycleAction) -> Result<Transition> {
        require("actorId", actor_id)?;

        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let post: Post = tx
                .get_record(post_id)
                .await?
                .ok_or_else(|| AppError::not_found("post", post_id))?;

            let owner = action.author_may_act().then_some(post.author_id.as_str());
            self.roles
                .authorize(actor_id, &post.community_id, owner, action.permission())
                .await?;

            let now = Utc::now();
            // Unpin clears a stored pin even after it has expired.
            let from = match action {
                LifecycleAction::Unpin => post.status,
                _ => post.effective_status(now),
            };
            let to = action.next_status(from, now)?;

            match (to, action) {
                (None, _) => tx.delete(Post::COLLECTION, post_id),
                (Some(status), LifecycleAction::Pin { until }) => tx.merge(
                    Post::COLLECTION,
                    post_id,
                    json!({ "status": status, "pinnedUntil": until, "updatedAt": now }),
                )?,
                (Some(status), _) => tx.merge(
                    Post::COLLECTION,
                    post_id,
                    json!({ "status": status, "pinnedUntil": null, "updatedAt": now }),
                )?,
            }
            tx.set(&audit::transition(
                actor_id,
                &post.community_id,
                TargetType::Post,
                post_id,
                action.name(),
                from.as_str(),
                to.map(PostStatus::as_str),
            ))?;

            match tx.commit().await {
                Ok(()) => {
                    tracing::info!(from = from.as_str(), to = to.map(PostStatus::as_str).unwrap_or("removed"), "post transitioned");
                    return Ok(Transition { post_id: post_id.to_string(), from, to });
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "post transition conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("{} on post {post_id}", action.name())))
    }

    /// Deletes comments and votes left behind by a purged post.
    async fn purge_dependents(&self, post_id: &str) {
        if let Err(err) = self.try_purge_dependents(post_id).await {
            tracing::warn!(post = post_id, %err, "cleanup after purge incomplete");
        }
    }

    async fn try_purge_dependents(&self, post_id: &str) -> Result<()> {
        let comments = self
            .store
            .query(&Query::collection(Comment::COLLECTION).where_eq("postId", post_id))
            .await?;

        let mut deletes: Vec<Write> = Vec::new();
        let vote_targets = std::iter::once((TargetType::Post, post_id.to_string()))
            .chain(comments.iter().map(|c| (TargetType::Comment, c.id.clone())));
        for (target_type, target_id) in vote_targets {
            let votes = self
                .store
                .query(
                    &Query::collection(Vote::COLLECTION)
                        .where_eq("targetType", target_type.as_str())
                        .where_eq("targetId", target_id),
                )
                .await?;
            deletes.extend(votes.iter().map(|v| Write::delete(Vote::COLLECTION, &v.id)));
        }
        deletes.extend(comments.iter().map(|c| Write::delete(Comment::COLLECTION, &c.id)));

        let removed = deletes.len();
        let chunk = self.store.max_batch_writes().max(1);
        while !deletes.is_empty() {
            let rest = deletes.split_off(chunk.min(deletes.len()));
            let batch = std::mem::replace(&mut deletes, rest);
            self.store.commit_batch(batch).await?;
        }
        tracing::debug!(post = post_id, removed, "purged dependents");
        Ok(())
    }
}
