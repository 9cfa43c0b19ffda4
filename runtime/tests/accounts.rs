//! Integration tests for registration, sign-in and session restore

#![allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic

use chrono::NaiveDate;
use party_core::environment::Clock;
use party_core::identity::{IdentityError, IdentityProvider};
use party_core::document::Collection;
use party_core::model::{Email, Gender};
use party_runtime::{
    AccountError, AccountService, EventLifecycle, FileSessionCache, RegistrationForm,
};
use party_testing::fixtures::open_draft;
use party_testing::{test_clock, InMemoryDocumentStore, InMemoryIdentityProvider};
use std::path::Path;
use std::sync::Arc;

struct Harness {
    identity: InMemoryIdentityProvider,
    store: InMemoryDocumentStore,
    clock: Arc<dyn Clock>,
}

impl Harness {
    fn new() -> Self {
        party_testing::init_test_tracing();
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        Self {
            identity: InMemoryIdentityProvider::new(Arc::clone(&clock)),
            store: InMemoryDocumentStore::new(),
            clock,
        }
    }

    fn with_identity(identity: InMemoryIdentityProvider) -> Self {
        let mut harness = Self::new();
        harness.identity = identity;
        harness
    }

    /// A service as a fresh process would build it, caching to `path`
    fn service(&self, path: &Path) -> AccountService {
        AccountService::new(
            Arc::new(self.identity.clone()),
            Arc::new(self.store.clone()),
            Arc::new(FileSessionCache::new(path)),
            Arc::clone(&self.clock),
        )
    }
}

fn form(email: &str, birth_date: NaiveDate) -> RegistrationForm {
    RegistrationForm {
        first_name: "Ana".to_string(),
        last_name: "Pop".to_string(),
        birth_date,
        gender: Gender::Female,
        email: Email::new(email),
        password: "hunter22".to_string(),
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn test_sign_in_requires_verified_email() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    let email = Email::new("ana@example.com");

    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    assert_eq!(harness.identity.session_count(), 0);

    let result = service.sign_in(&email, "hunter22").await;
    assert!(matches!(
        result,
        Err(AccountError::Identity(IdentityError::EmailNotVerified(_)))
    ));

    let token = harness.identity.latest_verification(&email).unwrap();
    let account = service.verify_email(token).await.unwrap();
    assert!(account.email_verified);

    let session = service.sign_in(&email, "hunter22").await.unwrap();
    assert_eq!(session.email, email);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    let email = Email::new("ana@example.com");
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    let token = harness.identity.latest_verification(&email).unwrap();
    service.verify_email(token).await.unwrap();

    let result = service.sign_in(&email, "wrong-password").await;
    assert!(matches!(
        result,
        Err(AccountError::Identity(IdentityError::InvalidCredentials))
    ));
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();

    let result = service.register(form("ANA@example.com", date(1990, 5, 2))).await;
    assert!(matches!(
        result,
        Err(AccountError::Identity(IdentityError::EmailAlreadyRegistered(_)))
    ));
}

#[tokio::test]
async fn test_session_survives_restart_until_sign_out() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let email = Email::new("ana@example.com");

    let first_run = harness.service(&path);
    first_run.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    let token = harness.identity.latest_verification(&email).unwrap();
    first_run.verify_email(token).await.unwrap();
    let session = first_run.sign_in(&email, "hunter22").await.unwrap();

    let second_run = harness.service(&path);
    let restored = second_run.restore_session().await.unwrap();
    assert_eq!(restored, Some(session));

    second_run.sign_out().await.unwrap();
    assert_eq!(harness.identity.session_count(), 0);
    assert!(!path.exists());

    let third_run = harness.service(&path);
    assert_eq!(third_run.restore_session().await.unwrap(), None);
}

#[tokio::test]
async fn test_expired_session_is_not_restored() {
    let clock: Arc<dyn Clock> = Arc::new(test_clock());
    let identity = InMemoryIdentityProvider::with_session_ttl(clock, chrono::Duration::zero());
    let harness = Harness::with_identity(identity);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let email = Email::new("ana@example.com");

    let service = harness.service(&path);
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    let token = harness.identity.latest_verification(&email).unwrap();
    service.verify_email(token).await.unwrap();
    service.sign_in(&email, "hunter22").await.unwrap();
    assert!(path.exists());

    assert_eq!(harness.service(&path).restore_session().await.unwrap(), None);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_revoked_session_is_cleared() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let email = Email::new("ana@example.com");

    let service = harness.service(&path);
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    let token = harness.identity.latest_verification(&email).unwrap();
    service.verify_email(token).await.unwrap();
    let session = service.sign_in(&email, "hunter22").await.unwrap();

    // Ended elsewhere, the local cache still holds the token.
    harness.identity.sign_out(session.token).await.unwrap();

    assert_eq!(harness.service(&path).restore_session().await.unwrap(), None);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_adult_flag_ignores_day_of_month() {
    // The clock reads 2025-01-01.
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));

    let adult = service.register(form("late@example.com", date(2007, 1, 31))).await.unwrap();
    let minor = service.register(form("minor@example.com", date(2007, 2, 1))).await.unwrap();

    assert_eq!(service.profile(&adult.uid).await.unwrap().adult, 1);
    assert_eq!(service.profile(&minor.uid).await.unwrap().adult, 0);
}

#[tokio::test]
async fn test_organizer_profile_feeds_event_creation() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();

    let organizer = service.organizer_profile(&Email::new("Ana@Example.com")).await.unwrap();
    assert_eq!(organizer.name, "Ana Pop");
    assert_eq!(organizer.email, Email::new("ana@example.com"));

    let lifecycle = EventLifecycle::new(Arc::new(harness.store.clone()));
    let id = lifecycle.create(organizer, open_draft(4)).await.unwrap();
    let mine = lifecycle.organized_by(&Email::new("ana@example.com")).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, id);
}

// ============================================================================
// Failed registrations
// ============================================================================

#[tokio::test]
async fn test_registration_retries_after_profile_store_outage() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    let email = Email::new("ana@example.com");

    harness.store.set_unavailable(true);
    let first = service.register(form("ana@example.com", date(1990, 5, 2))).await;
    assert!(matches!(first, Err(AccountError::Store(_))));
    assert_eq!(harness.identity.account_count(), 0);
    assert!(harness.identity.outbox().is_empty());

    harness.store.set_unavailable(false);
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    assert_eq!(harness.store.len(Collection::Users), 1);
    assert_eq!(harness.identity.outbox().len(), 1);

    let organizer = service.organizer_profile(&email).await.unwrap();
    assert_eq!(organizer.email, email);
}

#[tokio::test]
async fn test_undelivered_verification_rolls_back_registration() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    let email = Email::new("ana@example.com");

    harness.identity.set_mail_unavailable(true);
    let first = service.register(form("ana@example.com", date(1990, 5, 2))).await;
    assert!(matches!(
        first,
        Err(AccountError::Identity(IdentityError::Unavailable(_)))
    ));
    assert_eq!(harness.identity.account_count(), 0);
    assert_eq!(harness.store.len(Collection::Users), 0);
    assert!(matches!(
        service.organizer_profile(&email).await,
        Err(AccountError::ProfileNotFound(_))
    ));

    harness.identity.set_mail_unavailable(false);
    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    assert!(harness.identity.latest_verification(&email).is_some());
}

#[tokio::test]
async fn test_orphaned_profile_is_replaced_on_registration() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    let email = Email::new("ana@example.com");

    // Profile of an account the provider no longer knows about.
    harness.store.insert_raw(
        Collection::Users,
        party_core::document::DocumentId::new("stale-uid"),
        serde_json::json!({
            "firstName": "Old",
            "lastName": "Name",
            "birthDate": "1990-05-02",
            "gender": "female",
            "email": "ana@example.com",
            "adult": 1
        }),
    );

    let account = service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    assert_eq!(harness.store.len(Collection::Users), 1);
    assert_eq!(service.profile(&account.uid).await.unwrap().first_name, "Ana");
    assert_eq!(service.organizer_profile(&email).await.unwrap().name, "Ana Pop");
}

#[tokio::test]
async fn test_resend_verification_issues_a_new_token() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let service = harness.service(&dir.path().join("session.json"));
    let email = Email::new("ana@example.com");

    service.register(form("ana@example.com", date(1990, 5, 2))).await.unwrap();
    let first = harness.identity.latest_verification(&email).unwrap();
    service.resend_verification(&email).await.unwrap();
    let second = harness.identity.latest_verification(&email).unwrap();
    assert_ne!(first, second);

    service.verify_email(second).await.unwrap();
    service.sign_in(&email, "hunter22").await.unwrap();

    let unknown = service.resend_verification(&Email::new("nobody@example.com")).await;
    assert!(matches!(unknown, Err(AccountError::ProfileNotFound(_))));
}
