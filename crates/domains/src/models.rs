//! # Domain Models
//!
//! These structs are the documents persisted in the community store.
//! Field names serialize in camelCase to match the stored document shape.
//! Generated ids use UUID v7 so they sort by creation time.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::Record;

/// Maximum rendered depth of a comment thread. Top-level comments sit at depth 1.
pub const MAX_COMMENT_DEPTH: usize = 3;

/// What a vote points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Post,
    Comment,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Post => "post",
            TargetType::Comment => "comment",
        }
    }

    /// The collection that holds documents of this kind.
    pub fn collection(self) -> &'static str {
        match self {
            TargetType::Post => Post::COLLECTION,
            TargetType::Comment => Comment::COLLECTION,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Upvote,
    Downvote,
}

impl VoteType {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteType::Upvote => "upvote",
            VoteType::Downvote => "downvote",
        }
    }
}

/// A single user's active vote on a target.
///
/// There is at most one per (user, target). The document id is derived from
/// that triple, so a second vote can only ever overwrite the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub id: String,
    pub user: String,
    pub community_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub vote_type: VoteType,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    pub fn doc_id(user: &str, target_type: TargetType, target_id: &str) -> String {
        format!("{user}_{}_{target_id}", target_type.as_str())
    }
}

impl Record for Vote {
    const COLLECTION: &'static str = "votes";

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

/// Aggregate counters carried by posts and comments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentStats {
    pub upvotes: u64,
    pub downvotes: u64,
    pub comment_count: u64,
}

impl ContentStats {
    pub fn new(upvotes: u64, downvotes: u64) -> Self {
        Self { upvotes, downvotes, comment_count: 0 }
    }

    pub fn count(&self, vote_type: VoteType) -> u64 {
        match vote_type {
            VoteType::Upvote => self.upvotes,
            VoteType::Downvote => self.downvotes,
        }
    }

    pub fn increment(&mut self, vote_type: VoteType) {
        let counter = self.counter_mut(vote_type);
        *counter = counter.saturating_add(1);
    }

    /// Decrements the counter, flooring at zero.
    pub fn decrement(&mut self, vote_type: VoteType) {
        let counter = self.counter_mut(vote_type);
        *counter = counter.saturating_sub(1);
    }

    fn counter_mut(&mut self, vote_type: VoteType) -> &mut u64 {
        match vote_type {
            VoteType::Upvote => &mut self.upvotes,
            VoteType::Downvote => &mut self.downvotes,
        }
    }
}

/// Fixed set of content categories. Used both as a filter value and as a
/// notification preference key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    GeneralDiscussion,
    SafetyCrime,
    Governance,
    DisasterFire,
    Businesses,
    ResourcesRecovery,
    CommunityEvents,
    EmergencyDiscussion,
    OfficialEmergencyAlerts,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::GeneralDiscussion,
        Category::SafetyCrime,
        Category::Governance,
        Category::DisasterFire,
        Category::Businesses,
        Category::ResourcesRecovery,
        Category::CommunityEvents,
        Category::EmergencyDiscussion,
        Category::OfficialEmergencyAlerts,
    ];

    /// Official alerts bypass notification preferences.
    pub fn is_emergency_alert(self) -> bool {
        self == Category::OfficialEmergencyAlerts
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::GeneralDiscussion => "general_discussion",
            Category::SafetyCrime => "safety_crime",
            Category::Governance => "governance",
            Category::DisasterFire => "disaster_fire",
            Category::Businesses => "businesses",
            Category::ResourcesRecovery => "resources_recovery",
            Category::CommunityEvents => "community_events",
            Category::EmergencyDiscussion => "emergency_discussion",
            Category::OfficialEmergencyAlerts => "official_emergency_alerts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Active,
    Archived,
    Pinned,
}

impl PostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Active => "active",
            PostStatus::Archived => "archived",
            PostStatus::Pinned => "pinned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub community_id: String,
    pub author_id: String,
    pub title: String,
    pub content: String,
    pub category: Category,
    #[serde(default)]
    pub stats: ContentStats,
    pub status: PostStatus,
    /// Set only while `status` is `Pinned`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// A pin whose expiry has passed reads as `Active`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> PostStatus {
        match (self.status, self.pinned_until) {
            (PostStatus::Pinned, Some(until)) if until <= now => PostStatus::Active,
            (status, _) => status,
        }
    }
}

impl Record for Post {
    const COLLECTION: &'static str = "posts";

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    Active,
    Deleted,
}

impl CommentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommentStatus::Active => "active",
            CommentStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub community_id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub stats: ContentStats,
    pub status: CommentStatus,
    pub created_at: DateTime<Utc>,
}

impl Record for Comment {
    const COLLECTION: &'static str = "comments";

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

/// Per (user, community) notification switches. Absent keys read as enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    pub user_id: String,
    pub community_id: String,
    #[serde(default)]
    pub categories: BTreeMap<Category, bool>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreferences {
    pub fn doc_id(user_id: &str, community_id: &str) -> String {
        format!("{user_id}_{community_id}")
    }

    /// System-wide defaults: every category enabled.
    pub fn defaults(user_id: &str, community_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            community_id: community_id.to_string(),
            categories: Category::ALL.iter().map(|c| (*c, true)).collect(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        self.categories.get(&category).copied().unwrap_or(true)
    }
}

impl Record for NotificationPreferences {
    const COLLECTION: &'static str = "notification_preferences";

    fn doc_id(&self) -> String {
        Self::doc_id(&self.user_id, &self.community_id)
    }
}

/// Notification urgency. Stored as its numeric level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low = 1,
    High = 3,
}

impl Priority {
    pub fn for_category(category: Category) -> Self {
        if category.is_emergency_alert() {
            Priority::High
        } else {
            Priority::Low
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Priority::Low),
            3 => Ok(Priority::High),
            other => Err(format!("unknown priority level {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub source_id: String,
    pub source_category_tag: Category,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStatus {
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub read: bool,
}

/// One recipient's copy of a content event. Only `status` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub community_id: String,
    pub content: NotificationContent,
    pub priority: Priority,
    #[serde(default)]
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl Record for Notification {
    const COLLECTION: &'static str = "notifications";

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

/// Role-gated capabilities inside one community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Pin,
    Archive,
    PostEmergency,
    Moderate,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Pin => "canPin",
            Permission::Archive => "canArchive",
            Permission::PostEmergency => "canPostEmergency",
            Permission::Moderate => "canModerate",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolePermissions {
    pub can_pin: bool,
    pub can_archive: bool,
    pub can_post_emergency: bool,
    pub can_moderate: bool,
}

impl RolePermissions {
    pub fn all() -> Self {
        Self { can_pin: true, can_archive: true, can_post_emergency: true, can_moderate: true }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::Pin => self.can_pin,
            Permission::Archive => self.can_archive,
            Permission::PostEmergency => self.can_post_emergency,
            Permission::Moderate => self.can_moderate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityUserRole {
    pub user_id: String,
    pub community_id: String,
    pub title: String,
    #[serde(default)]
    pub permissions: RolePermissions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
}

impl CommunityUserRole {
    pub fn doc_id(user_id: &str, community_id: &str) -> String {
        format!("{user_id}_{community_id}")
    }
}

impl Record for CommunityUserRole {
    const COLLECTION: &'static str = "community_user_roles";

    fn doc_id(&self) -> String {
        Self::doc_id(&self.user_id, &self.community_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Left,
    Banned,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Active => "active",
            MemberStatus::Left => "left",
            MemberStatus::Banned => "banned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityMember {
    pub user_id: String,
    pub community_id: String,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

impl CommunityMember {
    pub fn doc_id(user_id: &str, community_id: &str) -> String {
        format!("{community_id}_{user_id}")
    }
}

impl Record for CommunityMember {
    const COLLECTION: &'static str = "community_members";

    fn doc_id(&self) -> String {
        Self::doc_id(&self.user_id, &self.community_id)
    }
}

/// Append-only trail of votes and status transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub actor_id: String,
    pub community_id: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl Record for AuditLogEntry {
    const COLLECTION: &'static str = "audit_log";

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}
