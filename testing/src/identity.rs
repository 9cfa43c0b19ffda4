//! In-memory identity provider
//!
//! Hashes passwords with argon2 like a real provider would, and keeps every
//! verification e-mail in an outbox so tests can complete the verification
//! flow without a mail server.

#![allow(clippy::unwrap_used)] // Test infrastructure: lock poisoning is a test failure
#![allow(clippy::missing_panics_doc)]

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Duration;
use party_core::environment::Clock;
use party_core::identity::{
    generate_token, validate_password, Account, IdentityError, IdentityProvider, Session,
    SessionToken, VerificationToken,
};
use party_core::model::{Email, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// A verification e-mail captured by the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentVerification {
    /// Recipient
    pub email: Email,
    /// Token the recipient would click
    pub token: VerificationToken,
}

#[derive(Debug)]
struct StoredAccount {
    account: Account,
    password_hash: String,
}

#[derive(Debug, Default)]
struct IdentityState {
    accounts: HashMap<Email, StoredAccount>,
    verification_tokens: HashMap<VerificationToken, Email>,
    sessions: HashMap<SessionToken, Session>,
    outbox: Vec<SentVerification>,
    mail_unavailable: bool,
}

/// In-memory identity provider for tests.
///
/// # Example
///
/// ```
/// use party_testing::{test_clock, InMemoryIdentityProvider};
/// use party_core::identity::IdentityProvider;
/// use party_core::model::Email;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let identity = InMemoryIdentityProvider::new(Arc::new(test_clock()));
/// let account = identity.register(Email::new("ana@example.com"), "secret-pw".into()).await?;
/// identity.send_verification(account.uid).await?;
///
/// let token = identity.latest_verification(&Email::new("ana@example.com")).unwrap();
/// identity.verify_email(token).await?;
/// identity.sign_in(Email::new("ana@example.com"), "secret-pw".into()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryIdentityProvider {
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
    state: Arc<RwLock<IdentityState>>,
}

impl InMemoryIdentityProvider {
    /// Provider issuing sessions valid for seven days
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_session_ttl(clock, Duration::days(7))
    }

    /// Provider issuing sessions valid for `session_ttl`
    #[must_use]
    pub fn with_session_ttl(clock: Arc<dyn Clock>, session_ttl: Duration) -> Self {
        Self {
            clock,
            session_ttl,
            state: Arc::new(RwLock::new(IdentityState::default())),
        }
    }

    /// Most recent verification token sent to `email`
    #[must_use]
    pub fn latest_verification(&self, email: &Email) -> Option<VerificationToken> {
        self.state
            .read()
            .unwrap()
            .outbox
            .iter()
            .rev()
            .find(|sent| sent.email == *email)
            .map(|sent| sent.token.clone())
    }

    /// Every verification e-mail sent so far
    #[must_use]
    pub fn outbox(&self) -> Vec<SentVerification> {
        self.state.read().unwrap().outbox.clone()
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.read().unwrap().sessions.len()
    }

    /// Number of registered accounts
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.state.read().unwrap().accounts.len()
    }

    /// Make verification e-mails fail with `Unavailable` until switched back
    pub fn set_mail_unavailable(&self, unavailable: bool) {
        self.state.write().unwrap().mail_unavailable = unavailable;
    }
}

impl std::fmt::Debug for InMemoryIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIdentityProvider")
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

fn hash_password(password: &str) -> Result<String, IdentityError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IdentityError::Unavailable(format!("password hashing failed: {e}")))
}

async fn verify_password(password: String, password_hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        PasswordHash::new(&password_hash)
            .is_ok_and(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
    })
    .await
    .unwrap_or(false)
}

impl IdentityProvider for InMemoryIdentityProvider {
    fn register(
        &self,
        email: Email,
        password: String,
    ) -> Pin<Box<dyn Future<Output = Result<Account, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            if !email.is_well_formed() {
                return Err(IdentityError::InvalidEmail(email.to_string()));
            }
            validate_password(&password)?;

            let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
                .await
                .map_err(|e| IdentityError::Unavailable(e.to_string()))??;

            let mut state = self.state.write().unwrap();
            if state.accounts.contains_key(&email) {
                return Err(IdentityError::EmailAlreadyRegistered(email));
            }

            let account = Account {
                uid: UserId::new(Uuid::new_v4().simple().to_string()),
                email: email.clone(),
                email_verified: false,
            };
            state.accounts.insert(
                email,
                StoredAccount {
                    account: account.clone(),
                    password_hash,
                },
            );
            Ok(account)
        })
    }

    fn delete_account(
        &self,
        uid: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            let Some(email) = state
                .accounts
                .values()
                .find(|stored| stored.account.uid == uid)
                .map(|stored| stored.account.email.clone())
            else {
                return Ok(());
            };
            state.accounts.remove(&email);
            state.verification_tokens.retain(|_, owner| *owner != email);
            state.sessions.retain(|_, session| session.uid != uid);
            Ok(())
        })
    }

    fn send_verification(
        &self,
        uid: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            if state.mail_unavailable {
                return Err(IdentityError::Unavailable("mail delivery failed".to_string()));
            }
            let email = state
                .accounts
                .values()
                .find(|stored| stored.account.uid == uid)
                .map(|stored| stored.account.email.clone())
                .ok_or(IdentityError::InvalidCredentials)?;

            let token = VerificationToken::new(generate_token());
            state.verification_tokens.insert(token.clone(), email.clone());
            tracing::debug!(%email, "verification e-mail queued");
            state.outbox.push(SentVerification { email, token });
            Ok(())
        })
    }

    fn verify_email(
        &self,
        token: VerificationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Account, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            let email = state
                .verification_tokens
                .remove(&token)
                .ok_or(IdentityError::InvalidVerificationToken)?;
            let stored = state
                .accounts
                .get_mut(&email)
                .ok_or(IdentityError::InvalidVerificationToken)?;
            stored.account.email_verified = true;
            Ok(stored.account.clone())
        })
    }

    fn sign_in(
        &self,
        email: Email,
        password: String,
    ) -> Pin<Box<dyn Future<Output = Result<Session, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let stored = {
                let state = self.state.read().unwrap();
                state
                    .accounts
                    .get(&email)
                    .map(|stored| (stored.account.clone(), stored.password_hash.clone()))
            };
            let Some((account, password_hash)) = stored else {
                return Err(IdentityError::InvalidCredentials);
            };

            if !verify_password(password, password_hash).await {
                return Err(IdentityError::InvalidCredentials);
            }
            if !account.email_verified {
                return Err(IdentityError::EmailNotVerified(account.email));
            }

            let issued_at = self.clock.now();
            let session = Session {
                token: SessionToken::new(generate_token()),
                uid: account.uid,
                email: account.email,
                issued_at,
                expires_at: issued_at + self.session_ttl,
            };
            self.state
                .write()
                .unwrap()
                .sessions
                .insert(session.token.clone(), session.clone());
            Ok(session)
        })
    }

    fn sign_out(
        &self,
        token: SessionToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>> {
        Box::pin(async move {
            self.state.write().unwrap().sessions.remove(&token);
            Ok(())
        })
    }

    fn resolve_session(
        &self,
        token: SessionToken,
    ) -> Pin<Box<dyn Future<Output = Result<Session, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let session = self
                .state
                .read()
                .unwrap()
                .sessions
                .get(&token)
                .cloned()
                .ok_or(IdentityError::SessionNotFound)?;

            if session.is_expired_at(self.clock.now()) {
                return Err(IdentityError::SessionExpired);
            }
            Ok(session)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::test_clock;

    fn provider() -> InMemoryIdentityProvider {
        InMemoryIdentityProvider::new(Arc::new(test_clock()))
    }

    fn ana() -> Email {
        Email::new("ana@example.com")
    }

    #[tokio::test]
    async fn test_unverified_sign_in_is_rejected() {
        let identity = provider();
        identity.register(ana(), "secret-pw".into()).await.unwrap();
        let result = identity.sign_in(ana(), "secret-pw".into()).await;
        assert_eq!(result, Err(IdentityError::EmailNotVerified(ana())));
    }

    #[tokio::test]
    async fn test_verified_sign_in_succeeds() {
        let identity = provider();
        let account = identity.register(ana(), "secret-pw".into()).await.unwrap();
        identity.send_verification(account.uid.clone()).await.unwrap();
        let token = identity.latest_verification(&ana()).unwrap();

        let verified = identity.verify_email(token.clone()).await.unwrap();
        assert!(verified.email_verified);
        // Tokens are single-use.
        assert_eq!(
            identity.verify_email(token).await,
            Err(IdentityError::InvalidVerificationToken)
        );

        let session = identity.sign_in(ana(), "secret-pw".into()).await.unwrap();
        assert_eq!(session.uid, account.uid);
        assert_eq!(identity.resolve_session(session.token.clone()).await.unwrap(), session);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let identity = provider();
        identity.register(ana(), "secret-pw".into()).await.unwrap();
        let result = identity.sign_in(ana(), "wrong-pw".into()).await;
        assert_eq!(result, Err(IdentityError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let identity = provider();
        identity.register(ana(), "secret-pw".into()).await.unwrap();
        let result = identity.register(Email::new("ANA@example.com"), "other-pw".into()).await;
        assert_eq!(result, Err(IdentityError::EmailAlreadyRegistered(ana())));
    }

    #[tokio::test]
    async fn test_deleted_account_frees_the_address() {
        let identity = provider();
        let account = identity.register(ana(), "secret-pw".into()).await.unwrap();
        identity.send_verification(account.uid.clone()).await.unwrap();
        let stale = identity.latest_verification(&ana()).unwrap();

        identity.delete_account(account.uid.clone()).await.unwrap();
        assert_eq!(identity.account_count(), 0);
        assert_eq!(
            identity.verify_email(stale).await,
            Err(IdentityError::InvalidVerificationToken)
        );
        // Deleting twice is a no-op.
        identity.delete_account(account.uid).await.unwrap();
        assert!(identity.register(ana(), "secret-pw".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sign_out_ends_session() {
        let identity = provider();
        let account = identity.register(ana(), "secret-pw".into()).await.unwrap();
        identity.send_verification(account.uid).await.unwrap();
        identity
            .verify_email(identity.latest_verification(&ana()).unwrap())
            .await
            .unwrap();
        let session = identity.sign_in(ana(), "secret-pw".into()).await.unwrap();

        identity.sign_out(session.token.clone()).await.unwrap();
        assert_eq!(
            identity.resolve_session(session.token).await,
            Err(IdentityError::SessionNotFound)
        );
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let identity =
            InMemoryIdentityProvider::with_session_ttl(Arc::new(test_clock()), Duration::zero());
        let account = identity.register(ana(), "secret-pw".into()).await.unwrap();
        identity.send_verification(account.uid).await.unwrap();
        identity
            .verify_email(identity.latest_verification(&ana()).unwrap())
            .await
            .unwrap();
        let session = identity.sign_in(ana(), "secret-pw".into()).await.unwrap();

        assert_eq!(
            identity.resolve_session(session.token).await,
            Err(IdentityError::SessionExpired)
        );
    }
}
