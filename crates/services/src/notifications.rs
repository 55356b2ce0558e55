//! # Notification fan-out and inbox
//!
//! A content event becomes one `Notification` document per eligible
//! recipient. Recipients are resolved first, then filtered by preference, and
//! the surviving records are committed in sequential batches that stay under
//! the store's per-commit ceiling. Batches are independent: an earlier batch
//! stays committed when a later one fails.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use domains::{
    AppError, Category, CommunityMember, DocumentStore, Direction, MemberStatus, Notification,
    NotificationContent, NotificationStatus, Permission, Priority, Query, Record, Result,
    Transaction, Write,
};
use serde::Serialize;
use serde_json::json;

use crate::preferences::{should_deliver, PreferenceResolver};
use crate::roles::RoleResolver;
use crate::{new_id, require, RetryBudget};

/// A content event to announce.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutRequest {
    pub community_id: String,
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub category: Category,
    /// Explicit recipients. `None` means every active community member.
    pub recipients: Option<Vec<String>>,
    /// Who raised the event. Required for official emergency alerts.
    pub sender: Option<String>,
    /// A user who never receives this event, typically the author.
    pub exclude: Option<String>,
}

impl FanOutRequest {
    pub fn new(
        community_id: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        category: Category,
    ) -> Self {
        Self {
            community_id: community_id.into(),
            source_id: source_id.into(),
            title: title.into(),
            body: body.into(),
            category,
            recipients: None,
            sender: None,
            exclude: None,
        }
    }

    pub fn to_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = Some(recipients);
        self
    }

    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn excluding(mut self, user_id: impl Into<String>) -> Self {
        self.exclude = Some(user_id.into());
        self
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    /// Distinct recipients after resolution and exclusion.
    pub considered: usize,
    /// Notifications durably written.
    pub created: usize,
    pub skipped_by_preference: usize,
    /// Recipients lost to a preference lookup error or a failed batch.
    pub failed: usize,
}

#[derive(Clone)]
pub struct NotificationFanOut {
    store: Arc<dyn DocumentStore>,
    preferences: PreferenceResolver,
    roles: RoleResolver,
    batch_size: usize,
    member_page_size: usize,
}

impl NotificationFanOut {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        preferences: PreferenceResolver,
        roles: RoleResolver,
        batch_size: usize,
        member_page_size: usize,
    ) -> Self {
        Self { store, preferences, roles, batch_size, member_page_size: member_page_size.max(1) }
    }

    #[tracing::instrument(
        skip(self, request),
        fields(community = %request.community_id, source = %request.source_id, category = request.category.as_str())
    )]
    pub async fn fan_out(&self, request: FanOutRequest) -> Result<FanOutReport> {
        require("communityId", &request.community_id)?;
        require("sourceId", &request.source_id)?;
        require("title", &request.title)?;

        let emergency = request.category.is_emergency_alert();
        if emergency {
            let sender = request
                .sender
                .as_deref()
                .ok_or_else(|| AppError::permission("official emergency alerts need a sender"))?;
            self.roles
                .authorize(sender, &request.community_id, None, Permission::PostEmergency)
                .await?;
        }

        let candidates = match &request.recipients {
            Some(ids) => ids.clone(),
            None => self.active_members(&request.community_id).await?,
        };
        let mut seen = HashSet::new();
        let recipients: Vec<String> = candidates
            .into_iter()
            .filter(|id| !id.trim().is_empty() && request.exclude.as_deref() != Some(id.as_str()))
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let mut report = FanOutReport { considered: recipients.len(), ..Default::default() };
        let mut pending = Vec::with_capacity(recipients.len());
        let now = Utc::now();

        for user_id in recipients {
            // Emergency alerts never consult preferences, so a broken
            // preference record cannot suppress them.
            if !emergency {
                match self.preferences.resolve(&user_id, &request.community_id).await {
                    Ok(prefs) if should_deliver(&prefs, request.category) => {}
                    Ok(_) => {
                        report.skipped_by_preference += 1;
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(user = %user_id, %err, "preference lookup failed, skipping recipient");
                        report.failed += 1;
                        continue;
                    }
                }
            }

            let notification = Notification {
                id: new_id(),
                user_id,
                community_id: request.community_id.clone(),
                content: NotificationContent {
                    title: request.title.clone(),
                    body: request.body.clone(),
                    source_id: request.source_id.clone(),
                    source_category_tag: request.category,
                },
                priority: Priority::for_category(request.category),
                status: NotificationStatus::default(),
                created_at: now,
            };
            pending.push(Write::set(&notification)?);
        }

        let batch_size = self.batch_size.clamp(1, self.store.max_batch_writes().max(1));
        let mut batch_no = 0;
        while !pending.is_empty() {
            let rest = pending.split_off(batch_size.min(pending.len()));
            let batch = std::mem::replace(&mut pending, rest);
            let size = batch.len();
            batch_no += 1;
            match self.store.commit_batch(batch).await {
                Ok(()) => report.created += size,
                Err(err) => {
                    tracing::warn!(batch = batch_no, size, %err, "notification batch failed");
                    report.failed += size;
                }
            }
        }

        tracing::info!(
            considered = report.considered,
            created = report.created,
            skipped = report.skipped_by_preference,
            failed = report.failed,
            batches = batch_no,
            "fan-out complete"
        );
        Ok(report)
    }

    /// User ids of every active member, paged with the id cursor.
    async fn active_members(&self, community_id: &str) -> Result<Vec<String>> {
        let mut members = Vec::new();
        let mut cursor = None;
        loop {
            let query = Query::collection(CommunityMember::COLLECTION)
                .where_eq("communityId", community_id)
                .where_eq("status", MemberStatus::Active.as_str())
                .limit(self.member_page_size)
                .start_after(cursor.take());
            let page = self.store.query(&query).await?;
            let full_page = page.len() == self.member_page_size;
            cursor = page.last().map(|doc| doc.id.clone());
            for doc in &page {
                members.push(doc.decode::<CommunityMember>()?.user_id);
            }
            if !full_page {
                break;
            }
        }
        tracing::debug!(count = members.len(), "resolved active members");
        Ok(members)
    }
}

/// Read-side and status updates for a user's notifications.
#[derive(Clone)]
pub struct NotificationInbox {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl NotificationInbox {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: u32) -> Self {
        Self { store, max_attempts }
    }

    /// Newest first. Pass the last returned id as `cursor` for the next page.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        community_id: Option<&str>,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<Vec<Notification>> {
        let mut query = Query::collection(Notification::COLLECTION).where_eq("userId", user_id);
        if let Some(community_id) = community_id {
            query = query.where_eq("communityId", community_id);
        }
        let query = query
            .order_by("createdAt", Direction::Descending)
            .limit(limit)
            .start_after(cursor);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(|doc| doc.decode::<Notification>().map_err(AppError::from))
            .collect()
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<usize> {
        let query = Query::collection(Notification::COLLECTION)
            .where_eq("userId", user_id)
            .where_eq("status.read", false);
        Ok(self.store.query(&query).await?.len())
    }

    pub async fn mark_read(&self, notification_id: &str, user_id: &str) -> Result<Notification> {
        self.update_status(notification_id, user_id, |status| status.read = true).await
    }

    pub async fn mark_delivered(&self, notification_id: &str, user_id: &str) -> Result<Notification> {
        self.update_status(notification_id, user_id, |status| {
            if !status.delivered {
                status.delivered = true;
                status.delivered_at = Some(Utc::now());
            }
        })
        .await
    }

    /// Removes a notification at its owner's request.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, notification_id: &str, user_id: &str) -> Result<()> {
        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let notification = self.owned(&mut tx, notification_id, user_id).await?;
            tx.delete(Notification::COLLECTION, &notification.id);
            match tx.commit().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "notification delete conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("delete of notification {notification_id}")))
    }

    async fn update_status(
        &self,
        notification_id: &str,
        user_id: &str,
        change: impl Fn(&mut NotificationStatus),
    ) -> Result<Notification> {
        let mut budget = RetryBudget::new(self.max_attempts);
        while budget.next_attempt() {
            let mut tx = Transaction::new(self.store.as_ref());
            let mut notification = self.owned(&mut tx, notification_id, user_id).await?;
            let before = notification.status.clone();
            change(&mut notification.status);
            if notification.status == before {
                return Ok(notification);
            }
            tx.merge(
                Notification::COLLECTION,
                &notification.id,
                json!({ "status": notification.status }),
            )?;
            match tx.commit().await {
                Ok(()) => return Ok(notification),
                Err(err) if err.is_conflict() => {
                    tracing::debug!(attempt = budget.attempt(), %err, "notification update conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(budget.exhausted(&format!("update of notification {notification_id}")))
    }

    async fn owned(
        &self,
        tx: &mut Transaction<'_>,
        notification_id: &str,
        user_id: &str,
    ) -> Result<Notification> {
        let notification: Notification = tx
            .get_record(notification_id)
            .await?
            .ok_or_else(|| AppError::not_found("notification", notification_id))?;
        if notification.user_id != user_id {
            return Err(AppError::permission(format!(
                "notification {notification_id} belongs to another user"
            )));
        }
        Ok(notification)
    }
}
