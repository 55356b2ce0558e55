//! Shared fixtures for the integration test targets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domains::{
    Category, CommunityMember, CommunityUserRole, ContentStats, MemberStatus, Post, PostStatus,
    RolePermissions,
};
use services::{CommunityServices, ServiceOptions};
use storage_adapters::InMemoryDocumentStore;

pub const COMMUNITY: &str = "c1";

pub struct Harness {
    pub store: Arc<InMemoryDocumentStore>,
    pub services: CommunityServices,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(ServiceOptions::default())
    }

    pub fn with_options(options: ServiceOptions) -> Self {
        let store = Arc::new(InMemoryDocumentStore::new());
        let services = CommunityServices::new(store.clone(), options);
        Self { store, services }
    }

    /// Seeds an active post authored by `author`.
    pub async fn post(&self, id: &str, author: &str) -> Post {
        self.post_with(id, author, PostStatus::Active, ContentStats::default()).await
    }

    pub async fn post_with(&self, id: &str, author: &str, status: PostStatus, stats: ContentStats) -> Post {
        let now = Utc::now();
        let post = Post {
            id: id.to_string(),
            community_id: COMMUNITY.to_string(),
            author_id: author.to_string(),
            title: format!("post {id}"),
            content: "body".to_string(),
            category: Category::GeneralDiscussion,
            stats,
            status,
            pinned_until: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put(&post).await.expect("seed post");
        post
    }

    pub async fn member(&self, user: &str, status: MemberStatus) {
        self.store
            .put(&CommunityMember {
                user_id: user.to_string(),
                community_id: COMMUNITY.to_string(),
                status,
                joined_at: Utc::now(),
            })
            .await
            .expect("seed member");
    }

    pub async fn members(&self, users: &[&str]) {
        for user in users {
            self.member(user, MemberStatus::Active).await;
        }
    }

    pub async fn role(&self, user: &str, permissions: RolePermissions) {
        self.services
            .roles
            .assign_role(CommunityUserRole {
                user_id: user.to_string(),
                community_id: COMMUNITY.to_string(),
                title: "Staff".to_string(),
                permissions,
                badge: None,
            })
            .await
            .expect("seed role");
    }

    pub async fn stats(&self, post_id: &str) -> ContentStats {
        self.services.posts.get_post(post_id).await.expect("post exists").stats
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed timestamp `seconds` after a reference instant.
pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_714_000_000 + seconds, 0).expect("valid timestamp")
}
