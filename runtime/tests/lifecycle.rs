//! Integration tests for event lifecycle operations
//!
//! Every operation runs against the in-memory document store, so the
//! precondition checks exercised here are the same atomic checks a real
//! backend performs.

#![allow(clippy::unwrap_used, clippy::panic, clippy::float_cmp)] // Test code can use unwrap/panic

use party_core::document::Collection;
use party_core::error::LifecycleError;
use party_core::model::{EventPatch, RoleShare};
use party_runtime::{EventLifecycle, JoinOutcome};
use party_testing::fixtures::{
    approval_draft, assert_event_invariants, budgeted_draft, guest, open_draft, organizer,
};
use party_testing::InMemoryDocumentStore;
use std::sync::Arc;

fn service() -> (EventLifecycle, InMemoryDocumentStore) {
    party_testing::init_test_tracing();
    let store = InMemoryDocumentStore::new();
    (EventLifecycle::new(Arc::new(store.clone())), store)
}

// ============================================================================
// Join flows
// ============================================================================

#[tokio::test]
async fn test_direct_join_reports_contribution() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();

    let outcome = lifecycle.join(&id, &guest(1)).await.unwrap();
    assert_eq!(outcome, JoinOutcome::Joined { contribution: 20.0 });

    let event = lifecycle.get(&id).await.unwrap();
    assert!(event.is_participant(&guest(1)));
    assert_eq!(event.remaining_capacity(), 2);
    assert_event_invariants(&event);
}

#[tokio::test]
async fn test_joining_twice_is_idempotent() {
    let (lifecycle, store) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    let writes = store.write_count();

    let again = lifecycle.join(&id, &guest(1)).await.unwrap();
    assert_eq!(again, JoinOutcome::Joined { contribution: 20.0 });
    assert_eq!(store.write_count(), writes);
    assert_eq!(lifecycle.get(&id).await.unwrap().participants.len(), 1);
}

#[tokio::test]
async fn test_join_past_limit_is_rejected() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(1)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();

    let result = lifecycle.join(&id, &guest(2)).await;
    assert_eq!(result, Err(LifecycleError::CapacityExceeded { limit: 1 }));
}

#[tokio::test]
async fn test_approval_flow_moves_candidate_on_accept() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), approval_draft(2)).await.unwrap();

    let outcome = lifecycle.join(&id, &guest(1)).await.unwrap();
    assert_eq!(outcome, JoinOutcome::AwaitingApproval);
    let event = lifecycle.get(&id).await.unwrap();
    assert!(event.is_pending(&guest(1)));
    assert!(!event.is_participant(&guest(1)));

    let event = lifecycle.accept(&id, &organizer().email, &guest(1)).await.unwrap();
    assert!(event.is_participant(&guest(1)));
    assert!(!event.is_pending(&guest(1)));
    assert_event_invariants(&event);
}

#[tokio::test]
async fn test_only_organizer_accepts() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), approval_draft(2)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();

    let result = lifecycle.accept(&id, &guest(2), &guest(1)).await;
    assert!(matches!(result, Err(LifecycleError::PermissionDenied { .. })));
    assert!(lifecycle.get(&id).await.unwrap().is_pending(&guest(1)));
}

#[tokio::test]
async fn test_accept_without_request_is_not_pending() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), approval_draft(2)).await.unwrap();

    let result = lifecycle.accept(&id, &organizer().email, &guest(5)).await;
    assert_eq!(result, Err(LifecycleError::NotPending { candidate: guest(5) }));
}

#[tokio::test]
async fn test_accept_respects_capacity() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), approval_draft(1)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    lifecycle.join(&id, &guest(2)).await.unwrap();

    lifecycle.accept(&id, &organizer().email, &guest(1)).await.unwrap();
    let result = lifecycle.accept(&id, &organizer().email, &guest(2)).await;
    assert_eq!(result, Err(LifecycleError::CapacityExceeded { limit: 1 }));

    let event = lifecycle.get(&id).await.unwrap();
    assert!(event.is_pending(&guest(2)));
    assert_event_invariants(&event);
}

#[tokio::test]
async fn test_reject_drops_request() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), approval_draft(2)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();

    let event = lifecycle.reject(&id, &organizer().email, &guest(1)).await.unwrap();
    assert!(event.pending_participants.is_empty());
    assert!(event.participants.is_empty());
}

#[tokio::test]
async fn test_closed_registration_rejects_joins() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    let patch = EventPatch {
        accepting: Some(false),
        ..EventPatch::default()
    };
    lifecycle.update(&id, &organizer().email, patch).await.unwrap();

    let result = lifecycle.join(&id, &guest(1)).await;
    assert_eq!(result, Err(LifecycleError::RegistrationClosed));
}

#[tokio::test]
async fn test_organizer_cannot_join_own_event() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();

    let result = lifecycle.join(&id, &organizer().email).await;
    assert!(matches!(result, Err(LifecycleError::PermissionDenied { .. })));

    // Leaving is a no-op for the organizer.
    let event = lifecycle.leave(&id, &organizer().email).await.unwrap();
    assert!(event.participants.is_empty());
}

// ============================================================================
// Leave, kick and roles
// ============================================================================

#[tokio::test]
async fn test_leave_clears_membership_and_role() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    lifecycle
        .assign_role(&id, &organizer().email, &guest(1), Some("DJ".to_string()))
        .await
        .unwrap();

    let event = lifecycle.leave(&id, &guest(1)).await.unwrap();
    assert!(!event.is_participant(&guest(1)));
    assert!(!event.roles.contains_key(&guest(1)));
    assert_event_invariants(&event);
}

#[tokio::test]
async fn test_leave_withdraws_pending_request() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), approval_draft(2)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();

    let event = lifecycle.leave(&id, &guest(1)).await.unwrap();
    assert!(!event.is_pending(&guest(1)));
}

#[tokio::test]
async fn test_kick_removes_role_in_same_write() {
    let (lifecycle, store) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    lifecycle
        .assign_role(&id, &organizer().email, &guest(1), Some("Cook".to_string()))
        .await
        .unwrap();
    let writes = store.write_count();

    let event = lifecycle.kick(&id, &organizer().email, &guest(1)).await.unwrap();
    assert_eq!(store.write_count(), writes + 1);
    assert!(!event.is_participant(&guest(1)));
    assert!(event.roles.is_empty());
}

#[tokio::test]
async fn test_kick_is_organizer_only() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();

    let result = lifecycle.kick(&id, &guest(2), &guest(1)).await;
    assert!(matches!(result, Err(LifecycleError::PermissionDenied { .. })));

    let result = lifecycle.kick(&id, &organizer().email, &organizer().email).await;
    assert!(matches!(result, Err(LifecycleError::PermissionDenied { .. })));
}

#[tokio::test]
async fn test_role_needs_participant() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();

    let result = lifecycle
        .assign_role(&id, &organizer().email, &guest(1), Some("DJ".to_string()))
        .await;
    assert_eq!(result, Err(LifecycleError::NotAParticipant { participant: guest(1) }));
}

#[tokio::test]
async fn test_blank_role_clears_assignment() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    lifecycle
        .assign_role(&id, &organizer().email, &guest(1), Some("DJ".to_string()))
        .await
        .unwrap();

    let event = lifecycle
        .assign_role(&id, &organizer().email, &guest(1), Some("  ".to_string()))
        .await
        .unwrap();
    assert_eq!(event.view_for(&guest(1)).role, None);
}

// ============================================================================
// Create, update, delete
// ============================================================================

#[tokio::test]
async fn test_split_over_hundred_is_not_persisted() {
    let (lifecycle, store) = service();
    let draft = budgeted_draft(10, &[("Food", 40.0), ("Drinks", 70.0)]);
    let writes = store.write_count();

    let result = lifecycle.create(organizer(), draft).await;
    match result {
        Err(LifecycleError::InvalidPercentageSum { sum }) => assert!((sum - 110.0).abs() < 1e-9),
        other => panic!("expected InvalidPercentageSum, got {other:?}"),
    }
    assert_eq!(store.write_count(), writes);
    assert_eq!(store.len(Collection::Events), 0);
}

#[tokio::test]
async fn test_create_computes_allocations() {
    let (lifecycle, _) = service();
    let draft = budgeted_draft(10, &[("Food", 50.0), ("Drinks", 25.0)]);
    let id = lifecycle.create(organizer(), draft).await.unwrap();

    let event = lifecycle.get(&id).await.unwrap();
    assert_eq!(event.total_budget(), 200.0);
    let allocated: Vec<f64> = event.budget_allocations.iter().map(|a| a.allocated_budget).collect();
    assert_eq!(allocated, vec![100.0, 50.0]);
}

#[tokio::test]
async fn test_renaming_leaves_other_fields_unchanged() {
    let (lifecycle, _) = service();
    let id = lifecycle
        .create(organizer(), budgeted_draft(4, &[("Food", 60.0)]))
        .await
        .unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    let before = lifecycle.get(&id).await.unwrap();

    let patch = EventPatch {
        event_name: Some("Birthday".to_string()),
        ..EventPatch::default()
    };
    let mut after = lifecycle.update(&id, &organizer().email, patch).await.unwrap();

    assert_eq!(after.event_name, "Birthday");
    after.event_name = before.event_name.clone();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_budget_update_recomputes_allocations() {
    let (lifecycle, _) = service();
    let id = lifecycle
        .create(organizer(), budgeted_draft(10, &[("Food", 50.0)]))
        .await
        .unwrap();

    let patch = EventPatch {
        budget: Some(30.0),
        ..EventPatch::default()
    };
    let event = lifecycle.update(&id, &organizer().email, patch).await.unwrap();
    assert_eq!(event.budget_allocations[0].allocated_budget, 150.0);

    let patch = EventPatch {
        role_percentages: Some(vec![RoleShare::new("Food", 20.0), RoleShare::new("Music", 30.0)]),
        ..EventPatch::default()
    };
    let event = lifecycle.update(&id, &organizer().email, patch).await.unwrap();
    let allocated: Vec<f64> = event.budget_allocations.iter().map(|a| a.allocated_budget).collect();
    assert_eq!(allocated, vec![60.0, 90.0]);
}

#[tokio::test]
async fn test_update_rejects_bad_split_and_outsiders() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(4)).await.unwrap();
    let before = lifecycle.get(&id).await.unwrap();

    let patch = EventPatch {
        role_percentages: Some(vec![RoleShare::new("A", 80.0), RoleShare::new("B", 30.0)]),
        ..EventPatch::default()
    };
    let result = lifecycle.update(&id, &organizer().email, patch).await;
    assert!(matches!(result, Err(LifecycleError::InvalidPercentageSum { .. })));

    let patch = EventPatch {
        event_name: Some("Hijacked".to_string()),
        ..EventPatch::default()
    };
    let result = lifecycle.update(&id, &guest(1), patch).await;
    assert!(matches!(result, Err(LifecycleError::PermissionDenied { .. })));

    assert_eq!(lifecycle.get(&id).await.unwrap(), before);
}

#[tokio::test]
async fn test_lowering_limit_below_roster_is_accepted() {
    let (lifecycle, _) = service();
    let id = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    lifecycle.join(&id, &guest(1)).await.unwrap();
    lifecycle.join(&id, &guest(2)).await.unwrap();

    let patch = EventPatch {
        participant_limit: Some(1),
        ..EventPatch::default()
    };
    let event = lifecycle.update(&id, &organizer().email, patch).await.unwrap();
    assert_eq!(event.participants.len(), 2);
    assert_eq!(event.remaining_capacity(), 0);

    let result = lifecycle.join(&id, &guest(3)).await;
    assert_eq!(result, Err(LifecycleError::CapacityExceeded { limit: 1 }));
}

#[tokio::test]
async fn test_joined_by_lists_only_confirmed_memberships() {
    let (lifecycle, _) = service();
    let open = lifecycle.create(organizer(), open_draft(3)).await.unwrap();
    let gated = lifecycle.create(organizer(), approval_draft(3)).await.unwrap();
    lifecycle.join(&open, &guest(1)).await.unwrap();
    lifecycle.join(&gated, &guest(1)).await.unwrap();

    let joined = lifecycle.joined_by(&guest(1)).await.unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].id, open);
    assert!(lifecycle.joined_by(&guest(2)).await.unwrap().is_empty());
}
