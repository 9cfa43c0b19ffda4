//! Integration tests for the live event feed

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::StreamExt;
use party_core::document::{Collection, FieldPath, Query};
use party_core::error::LifecycleError;
use party_runtime::{EventFeed, EventLifecycle, FeedSnapshot, FeedSubscription};
use party_testing::fixtures::{guest, open_draft, organizer};
use party_testing::InMemoryDocumentStore;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (EventLifecycle, EventFeed, InMemoryDocumentStore) {
    party_testing::init_test_tracing();
    let store = InMemoryDocumentStore::new();
    let lifecycle = EventLifecycle::new(Arc::new(store.clone()));
    let feed = EventFeed::new(Arc::new(store.clone()));
    (lifecycle, feed, store)
}

/// Wait until a snapshot satisfies `predicate`
async fn wait_for(
    subscription: &mut FeedSubscription,
    predicate: impl Fn(&FeedSnapshot) -> bool,
) -> FeedSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = subscription.next().await.expect("feed ended");
            if predicate(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("feed did not reach the expected state")
}

fn organized_by_ana() -> Query {
    Query::collection(Collection::Events)
        .where_eq(FieldPath::new("organizer").child("email"), "ana@example.com")
}

#[tokio::test]
async fn test_empty_feed_publishes_then_follows_writes() {
    let (lifecycle, feed, _) = setup();
    let mut subscription = feed.all_events().await.unwrap();

    let initial = wait_for(&mut subscription, |s| s.revision > 0).await;
    assert!(initial.events.is_empty());

    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    let snapshot = wait_for(&mut subscription, |s| s.events.len() == 1).await;
    assert_eq!(snapshot.events[0].id, id);

    lifecycle.join(&id, &guest(1)).await.unwrap();
    let snapshot = wait_for(&mut subscription, |s| {
        s.get(&id).is_some_and(|event| event.is_participant(&guest(1)))
    })
    .await;
    assert_eq!(snapshot.get(&id).unwrap().remaining_capacity(), 2);

    lifecycle.delete(&id, &organizer().email).await.unwrap();
    wait_for(&mut subscription, |s| s.events.is_empty()).await;
}

#[tokio::test]
async fn test_existing_events_are_loaded_first() {
    let (lifecycle, feed, _) = setup();
    for _ in 0..3 {
        lifecycle.create(organizer(), open_draft(2)).await.unwrap();
    }

    let mut subscription = feed.all_events().await.unwrap();
    let snapshot = wait_for(&mut subscription, |s| s.revision > 0).await;
    assert_eq!(snapshot.events.len(), 3);
}

#[tokio::test]
async fn test_equal_queries_share_one_upstream() {
    let (_, feed, _) = setup();

    let first = feed.all_events().await.unwrap();
    let second = feed.all_events().await.unwrap();
    let filtered = feed.subscribe(organized_by_ana()).await.unwrap();

    assert_eq!(feed.active_queries(), 2);
    assert_eq!(feed.subscriber_count(), 3);

    drop(first);
    assert_eq!(feed.active_queries(), 2);
    drop(second);
    assert_eq!(feed.active_queries(), 1);
    drop(filtered);
    assert_eq!(feed.active_queries(), 0);
    assert_eq!(feed.subscriber_count(), 0);
}

#[tokio::test]
async fn test_late_subscriber_sees_current_state() {
    let (lifecycle, feed, _) = setup();
    let mut early = feed.all_events().await.unwrap();
    lifecycle.create(organizer(), open_draft(2)).await.unwrap();
    wait_for(&mut early, |s| s.events.len() == 1).await;

    let mut late = feed.all_events().await.unwrap();
    let snapshot = wait_for(&mut late, |s| s.revision > 0).await;
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(feed.active_queries(), 1);
}

#[tokio::test]
async fn test_filtered_feed_only_sees_matches() {
    let (lifecycle, feed, _) = setup();
    let mut subscription = feed.subscribe(organized_by_ana()).await.unwrap();

    let other = party_core::model::Organizer::new("Bob Ionescu", guest(9));
    lifecycle.create(other, open_draft(2)).await.unwrap();
    let mine = lifecycle.create(organizer(), open_draft(2)).await.unwrap();

    let snapshot = wait_for(&mut subscription, |s| !s.events.is_empty()).await;
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(snapshot.events[0].id, mine);
}

#[tokio::test]
async fn test_feed_rejects_other_collections() {
    let (_, feed, _) = setup();
    let result = feed.subscribe(Query::collection(Collection::Users)).await;
    assert!(matches!(result, Err(LifecycleError::Validation(_))));
    assert_eq!(feed.active_queries(), 0);
}

#[tokio::test]
async fn test_unavailable_store_fails_subscribe() {
    let (_, feed, store) = setup();
    store.set_unavailable(true);

    let result = feed.all_events().await;
    assert!(matches!(result, Err(LifecycleError::StoreUnavailable(_))));
    assert_eq!(feed.active_queries(), 0);
}

#[tokio::test]
async fn test_subscription_as_stream() {
    let (lifecycle, feed, _) = setup();
    lifecycle.create(organizer(), open_draft(2)).await.unwrap();

    let subscription = feed.all_events().await.unwrap();
    let first = subscription.into_stream().take(1).collect();
    let snapshots: Vec<FeedSnapshot> =
        tokio::time::timeout(Duration::from_secs(5), first).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].events.len(), 1);
    assert_eq!(feed.active_queries(), 0);
}

#[tokio::test]
async fn test_feed_resubscribes_after_losing_the_store() {
    let (lifecycle, feed, store) = setup();
    let feed = feed.with_retry_policy(
        party_runtime::retry::RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    let mut subscription = feed.all_events().await.unwrap();
    let first = lifecycle.create(organizer(), open_draft(2)).await.unwrap();
    wait_for(&mut subscription, |s| s.events.len() == 1).await;

    store.drop_subscriptions();
    let second = lifecycle.create(organizer(), open_draft(2)).await.unwrap();

    let snapshot = wait_for(&mut subscription, |s| s.events.len() == 2).await;
    assert!(snapshot.get(&first).is_some());
    assert!(snapshot.get(&second).is_some());
    assert_eq!(feed.active_queries(), 1);
}
