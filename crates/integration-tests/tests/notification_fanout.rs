use std::collections::BTreeSet;

use domains::{
    AppError, Category, MemberStatus, Notification, NotificationPreferences, Priority, Record, RolePermissions,
};
use integration_tests::{Harness, COMMUNITY};
use services::{FanOutRequest, ServiceOptions};
use tokio_test::assert_err;

const RESIDENTS: [&str; 5] = ["u1", "u2", "u3", "u4", "u5"];

fn request(category: Category) -> FanOutRequest {
    FanOutRequest::new(COMMUNITY, "event-1", "Heads up", "Details inside", category)
}

fn recipients(h: &Harness) -> BTreeSet<String> {
    h.store.all::<Notification>().unwrap().into_iter().map(|n| n.user_id).collect()
}

/// Resolves every resident's preferences so later batch counts only see notification writes.
async fn warm_preferences(h: &Harness) {
    for user in RESIDENTS {
        h.services.preferences.resolve(user, COMMUNITY).await.unwrap();
    }
}

#[tokio::test]
async fn test_disabled_category_is_skipped() {
    let h = Harness::new();
    h.members(&RESIDENTS).await;
    for user in ["u2", "u4"] {
        h.services.preferences.update(user, COMMUNITY, &[(Category::Governance, false)]).await.unwrap();
    }

    let report = h.services.notifications.fan_out(request(Category::Governance)).await.unwrap();
    assert_eq!(report.considered, 5);
    assert_eq!(report.created, 3);
    assert_eq!(report.skipped_by_preference, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(recipients(&h), ["u1", "u3", "u5"].map(String::from).into_iter().collect());

    let stored = h.store.all::<Notification>().unwrap();
    assert!(stored.iter().all(|n| n.priority == Priority::Low && !n.status.read && !n.status.delivered));
}

#[tokio::test]
async fn test_emergency_alert_ignores_preferences() {
    let h = Harness::new();
    h.members(&RESIDENTS).await;
    h.role("coordinator", RolePermissions { can_post_emergency: true, ..Default::default() }).await;
    for user in ["u2", "u4"] {
        h.services
            .preferences
            .update(user, COMMUNITY, &[(Category::OfficialEmergencyAlerts, false)])
            .await
            .unwrap();
    }

    let report = h
        .services
        .notifications
        .fan_out(request(Category::OfficialEmergencyAlerts).from_sender("coordinator"))
        .await
        .unwrap();
    assert_eq!(report.created, 5);
    assert_eq!(report.skipped_by_preference, 0);
    let stored = h.store.all::<Notification>().unwrap();
    assert!(stored.iter().all(|n| n.priority == Priority::High));
}

#[tokio::test]
async fn test_emergency_alert_requires_permission() {
    let h = Harness::new();
    h.members(&RESIDENTS).await;

    let err = assert_err!(
        h.services
            .notifications
            .fan_out(request(Category::OfficialEmergencyAlerts).from_sender("u1"))
            .await
    );
    assert!(matches!(err, AppError::Permission(_)));

    let err = assert_err!(h.services.notifications.fan_out(request(Category::OfficialEmergencyAlerts)).await);
    assert!(matches!(err, AppError::Permission(_)));
    assert!(h.store.is_empty(Notification::COLLECTION));
}

#[tokio::test]
async fn test_only_active_members_are_notified() {
    let h = Harness::new();
    h.members(&["u1", "u2"]).await;
    h.member("u3", MemberStatus::Left).await;
    h.member("u4", MemberStatus::Banned).await;

    let report = h.services.notifications.fan_out(request(Category::CommunityEvents)).await.unwrap();
    assert_eq!(report.considered, 2);
    assert_eq!(recipients(&h), ["u1", "u2"].map(String::from).into_iter().collect());
}

#[tokio::test]
async fn test_explicit_recipients_are_deduplicated_and_exclusion_applies() {
    let h = Harness::new();
    let report = h
        .services
        .notifications
        .fan_out(
            request(Category::SafetyCrime)
                .to_recipients(vec!["u1".into(), "u2".into(), "u1".into(), "author".into(), "".into()])
                .excluding("author"),
        )
        .await
        .unwrap();

    assert_eq!(report.considered, 2);
    assert_eq!(report.created, 2);
    assert_eq!(recipients(&h), ["u1", "u2"].map(String::from).into_iter().collect());
}

#[tokio::test]
async fn test_writes_are_chunked_into_batches() {
    let h = Harness::with_options(ServiceOptions { notification_batch_size: 2, ..Default::default() });
    h.members(&RESIDENTS).await;
    warm_preferences(&h).await;

    let before = h.store.batch_commit_count();
    let report = h.services.notifications.fan_out(request(Category::CommunityEvents)).await.unwrap();
    assert_eq!(report.created, 5);
    assert_eq!(h.store.batch_commit_count() - before, 3);
}

#[tokio::test]
async fn test_failed_batch_does_not_abort_fan_out() {
    let h = Harness::with_options(ServiceOptions { notification_batch_size: 2, ..Default::default() });
    h.members(&RESIDENTS).await;
    warm_preferences(&h).await;
    h.store.fail_batch_commit(2);

    let report = h.services.notifications.fan_out(request(Category::CommunityEvents)).await.unwrap();
    assert_eq!(report.created, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(h.store.len(Notification::COLLECTION), 3);
}

#[tokio::test]
async fn test_preference_failure_is_isolated_to_one_recipient() {
    let h = Harness::new();
    h.members(&RESIDENTS).await;
    h.store.fail_reads_of(
        NotificationPreferences::COLLECTION,
        &NotificationPreferences::doc_id("u2", COMMUNITY),
    );

    let report = h.services.notifications.fan_out(request(Category::GeneralDiscussion)).await.unwrap();
    assert_eq!(report.created, 4);
    assert_eq!(report.failed, 1);
    assert!(!recipients(&h).contains("u2"));
}

#[tokio::test]
async fn test_member_listing_pages_through_every_member() {
    let h = Harness::with_options(ServiceOptions { member_page_size: 2, ..Default::default() });
    h.members(&RESIDENTS).await;

    let report = h.services.notifications.fan_out(request(Category::CommunityEvents)).await.unwrap();
    assert_eq!(report.considered, 5);
    assert_eq!(recipients(&h).len(), 5);
}

#[tokio::test]
async fn test_missing_preferences_default_to_enabled_and_persist() {
    let h = Harness::new();
    h.members(&["u1"]).await;
    assert!(h.store.is_empty(NotificationPreferences::COLLECTION));

    let report = h.services.notifications.fan_out(request(Category::Businesses)).await.unwrap();
    assert_eq!(report.created, 1);
    let prefs = h.store.all::<NotificationPreferences>().unwrap();
    assert_eq!(prefs.len(), 1);
    assert!(Category::ALL.iter().all(|c| prefs[0].is_enabled(*c)));
}

#[tokio::test]
async fn test_missing_title_is_rejected() {
    let h = Harness::new();
    let err = assert_err!(
        h.services
            .notifications
            .fan_out(FanOutRequest::new(COMMUNITY, "event-1", "  ", "body", Category::GeneralDiscussion))
            .await
    );
    assert!(matches!(err, AppError::ValidationError(_)));
}

#[tokio::test]
async fn test_default_batching_splits_large_communities() {
    let h = Harness::new();
    for i in 0..460 {
        h.member(&format!("m{i:03}"), MemberStatus::Active).await;
    }

    let before = h.store.batch_commit_count();
    let report = h.services.notifications.fan_out(request(Category::CommunityEvents)).await.unwrap();
    assert_eq!(report.considered, 460);
    assert_eq!(report.created, 460);
    assert_eq!(report.failed, 0);
    assert_eq!(h.store.batch_commit_count() - before, 2);

    // Failing the second batch shows the split: 450 written, the 10 left over lost.
    h.store.fail_batch_commit(2);
    let report = h
        .services
        .notifications
        .fan_out(FanOutRequest::new(COMMUNITY, "event-2", "Again", "More", Category::CommunityEvents))
        .await
        .unwrap();
    assert_eq!(report.created, 450);
    assert_eq!(report.failed, 10);
    assert_eq!(h.store.len(Notification::COLLECTION), 910);
}
