//! # community-board
//!
//! Assembles the services over the in-memory document store, seeds a small
//! community and runs one round of posting, voting, commenting and alerting.

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use configs::Settings;
use domains::{
    Category, CommunityMember, CommunityUserRole, MemberStatus, RolePermissions, TargetType, VoteType,
};
use secrecy::ExposeSecret;
use services::{CommunityServices, FanOutRequest, NewComment, NewPost, ServiceOptions};
use storage_adapters::InMemoryDocumentStore;
use tracing_subscriber::EnvFilter;

const COMMUNITY: &str = "riverside";
const RESIDENTS: [&str; 5] = ["ana", "ben", "chloe", "dev", "emi"];
const COORDINATOR: &str = "coordinator";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings.log.filter, settings.log.json);

    if settings.store.api_key.expose_secret().is_empty() {
        tracing::info!(project = %settings.store.project_id, "no store credential set, using the in-memory store");
    }

    let store = Arc::new(InMemoryDocumentStore::with_batch_limit(settings.store.max_batch_writes));
    let services = CommunityServices::new(
        store.clone(),
        ServiceOptions {
            max_transaction_attempts: settings.store.max_transaction_attempts,
            notification_batch_size: settings.notifications.batch_size,
            member_page_size: settings.notifications.member_page_size,
        },
    );

    seed(&store, &services).await.context("seeding community")?;
    run_scenario(&services).await.context("running scenario")?;
    Ok(())
}

fn init_tracing(filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn seed(store: &InMemoryDocumentStore, services: &CommunityServices) -> anyhow::Result<()> {
    for user in RESIDENTS.iter().chain(std::iter::once(&COORDINATOR)) {
        store
            .put(&CommunityMember {
                user_id: user.to_string(),
                community_id: COMMUNITY.to_string(),
                status: MemberStatus::Active,
                joined_at: Utc::now(),
            })
            .await?;
    }

    services
        .roles
        .assign_role(CommunityUserRole {
            user_id: COORDINATOR.to_string(),
            community_id: COMMUNITY.to_string(),
            title: "Emergency Coordinator".to_string(),
            permissions: RolePermissions::all(),
            badge: Some("coordinator".to_string()),
        })
        .await?;

    // Two residents opt out of business announcements.
    for user in ["chloe", "emi"] {
        services.preferences.update(user, COMMUNITY, &[(Category::Businesses, false)]).await?;
    }
    tracing::info!(members = RESIDENTS.len() + 1, "community seeded");
    Ok(())
}

async fn run_scenario(services: &CommunityServices) -> anyhow::Result<()> {
    let post = services
        .posts
        .create_post(NewPost {
            community_id: COMMUNITY.to_string(),
            author_id: "ana".to_string(),
            title: "Farmers market reopens Saturday".to_string(),
            content: "Stalls along the river path from 8am.".to_string(),
            category: Category::Businesses,
        })
        .await?;

    let votes = [
        ("ben", VoteType::Upvote),
        ("ben", VoteType::Upvote),
        ("chloe", VoteType::Downvote),
        ("ben", VoteType::Downvote),
        ("dev", VoteType::Upvote),
    ];
    for (user, vote_type) in votes {
        let stats = services
            .votes
            .apply_vote(&post.id, TargetType::Post, user, COMMUNITY, vote_type)
            .await?;
        tracing::info!(user, vote = vote_type.as_str(), up = stats.upvotes, down = stats.downvotes, "vote applied");
    }

    let first = services
        .comments
        .add_comment(NewComment {
            post_id: post.id.clone(),
            author_id: "dev".to_string(),
            parent_comment_id: None,
            content: "Is the bakery stall back?".to_string(),
        })
        .await?;
    services
        .comments
        .add_comment(NewComment {
            post_id: post.id.clone(),
            author_id: "ana".to_string(),
            parent_comment_id: Some(first.id.clone()),
            content: "Yes, first stall by the bridge.".to_string(),
        })
        .await?;
    let thread = services.comments.load_thread(&post.id).await?;
    tracing::info!(top_level = thread.len(), replies = thread.iter().map(|n| n.replies.len()).sum::<usize>(), "thread loaded");

    services
        .posts
        .pin_post(&post.id, COORDINATOR, Utc::now() + Duration::days(2))
        .await?;

    let alert = FanOutRequest::new(
        COMMUNITY,
        "alert-flood-1",
        "Flood warning",
        "River expected to crest tonight. Move vehicles off River Rd.",
        Category::OfficialEmergencyAlerts,
    )
    .from_sender(COORDINATOR);
    let report = services.notifications.fan_out(alert).await?;
    tracing::info!(created = report.created, "emergency alert sent");

    for user in RESIDENTS {
        let unread = services.inbox.unread_count(user).await?;
        tracing::info!(user, unread, "inbox");
    }
    Ok(())
}
