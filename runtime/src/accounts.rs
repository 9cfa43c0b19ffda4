//! Account registration, sign-in and session restore.
//!
//! [`AccountService`] pairs the [`IdentityProvider`] with the `users`
//! collection: every account owns a profile document keyed by its uid, and
//! the profile is what events record as their organizer.

use crate::metrics::AccountMetrics;
use crate::session_cache::{SessionCache, SessionCacheError};
use chrono::NaiveDate;
use party_core::document::{Collection, Document, DocumentId, FieldPath, Query};
use party_core::eligibility::adult_status;
use party_core::environment::Clock;
use party_core::identity::{Account, IdentityError, IdentityProvider, Session, VerificationToken};
use party_core::model::{Email, Gender, Organizer, UserId, UserProfile};
use party_core::store::{DocumentStore, StoreError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors from account operations.
#[derive(Error, Debug)]
pub enum AccountError {
    /// Rejected by the identity provider
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Profile storage failed
    #[error("Profile store error: {0}")]
    Store(#[from] StoreError),

    /// The local session cache failed
    #[error(transparent)]
    Cache(#[from] SessionCacheError),

    /// No profile document for this user
    #[error("No profile found for {0}")]
    ProfileNotFound(String),

    /// Registration input rejected
    #[error("Invalid registration: {0}")]
    Validation(String),
}

/// Result type for account operations.
pub type Result<T> = std::result::Result<T, AccountError>;

/// What a new user fills in
#[derive(Clone)]
pub struct RegistrationForm {
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Birth date
    pub birth_date: NaiveDate,
    /// Gender
    pub gender: Gender,
    /// Login address
    pub email: Email,
    /// Plain-text password, hashed by the provider
    pub password: String,
}

impl fmt::Debug for RegistrationForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationForm")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("birth_date", &self.birth_date)
            .field("gender", &self.gender)
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// Registration, verification, sign-in and profile lookups.
#[derive(Clone)]
pub struct AccountService {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn SessionCache>,
    clock: Arc<dyn Clock>,
}

impl AccountService {
    /// Wire the service
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn SessionCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            store,
            cache,
            clock,
        }
    }

    /// Create the account and its profile, then send the verification mail.
    ///
    /// The adult flag is computed from today's date and stored once. The new
    /// user stays signed out until the address is verified. If the profile
    /// or the mail fails, the account is deleted again so the address can be
    /// registered on a later attempt.
    ///
    /// # Errors
    ///
    /// - `Validation`: blank name or malformed address
    /// - `Identity`: address taken, password too weak, mail not delivered
    /// - `Store`: the profile could not be written
    #[tracing::instrument(skip_all, fields(email = %form.email))]
    pub async fn register(&self, form: RegistrationForm) -> Result<Account> {
        let result = self.create_account(form).await;
        AccountMetrics::record("register", result.is_ok());
        match &result {
            Ok(account) => {
                tracing::info!(uid = %account.uid, "Account registered, verification sent");
            }
            Err(error) => tracing::warn!(%error, "Registration failed"),
        }
        result
    }

    async fn create_account(&self, form: RegistrationForm) -> Result<Account> {
        if form.first_name.trim().is_empty() || form.last_name.trim().is_empty() {
            return Err(AccountError::Validation("first and last name are required".to_string()));
        }
        if !form.email.is_well_formed() {
            return Err(AccountError::Identity(IdentityError::InvalidEmail(
                form.email.as_str().to_string(),
            )));
        }

        let account = self.identity.register(form.email.clone(), form.password).await?;

        let profile = UserProfile {
            first_name: form.first_name.trim().to_string(),
            last_name: form.last_name.trim().to_string(),
            birth_date: form.birth_date,
            gender: form.gender,
            email: form.email,
            adult: adult_status(form.birth_date, self.clock.now().date_naive()),
        };
        if let Err(error) = self.attach_profile(&account, &profile).await {
            self.discard_account(&account, false).await;
            return Err(error);
        }

        if let Err(error) = self.identity.send_verification(account.uid.clone()).await {
            self.discard_account(&account, true).await;
            return Err(error.into());
        }
        Ok(account)
    }

    async fn attach_profile(&self, account: &Account, profile: &UserProfile) -> Result<()> {
        // The provider just accepted this address, so any other profile
        // carrying it belongs to an account that no longer exists.
        for orphan in self.profiles_for(&profile.email).await? {
            if orphan.id.as_str() != account.uid.as_str() {
                tracing::warn!(profile_id = %orphan.id, "Removing orphaned profile");
                self.store.delete(Collection::Users, orphan.id, Vec::new()).await?;
            }
        }

        let body = serde_json::to_value(profile).map_err(StoreError::from)?;
        self.store
            .create(Collection::Users, Some(DocumentId::new(account.uid.as_str())), body)
            .await?;
        Ok(())
    }

    async fn discard_account(&self, account: &Account, profile_written: bool) {
        if profile_written {
            let id = DocumentId::new(account.uid.as_str());
            if let Err(error) = self.store.delete(Collection::Users, id, Vec::new()).await {
                tracing::warn!(%error, uid = %account.uid, "Profile left behind");
            }
        }
        match self.identity.delete_account(account.uid.clone()).await {
            Ok(()) => tracing::info!(uid = %account.uid, "Incomplete registration rolled back"),
            Err(error) => {
                tracing::error!(%error, uid = %account.uid, "Could not roll back registration");
            }
        }
    }

    /// Send a fresh verification mail to a registered address
    ///
    /// Earlier tokens stay valid until redeemed.
    ///
    /// # Errors
    ///
    /// - `ProfileNotFound`: nobody registered `email`
    /// - `Identity`: the account is gone or the mail was not delivered
    /// - `Store`: the profile lookup failed
    #[tracing::instrument(skip_all, fields(email = %email))]
    pub async fn resend_verification(&self, email: &Email) -> Result<()> {
        let result = self.send_again(email).await;
        AccountMetrics::record("resend_verification", result.is_ok());
        if let Err(error) = &result {
            tracing::warn!(%error, "Verification not resent");
        }
        result
    }

    async fn send_again(&self, email: &Email) -> Result<()> {
        let document = self.profile_document(email).await?;
        self.identity
            .send_verification(UserId::new(document.id.into_inner()))
            .await?;
        Ok(())
    }

    /// Redeem the token from the verification mail
    ///
    /// # Errors
    ///
    /// - `Identity`: unknown or used token
    #[tracing::instrument(skip_all)]
    pub async fn verify_email(&self, token: VerificationToken) -> Result<Account> {
        let result = self.identity.verify_email(token).await.map_err(AccountError::from);
        AccountMetrics::record("verify_email", result.is_ok());
        if let Ok(account) = &result {
            tracing::info!(uid = %account.uid, "E-mail verified");
        }
        result
    }

    /// Sign in and cache the session locally
    ///
    /// # Errors
    ///
    /// - `Identity`: wrong credentials, or the address is not verified yet
    /// - `Cache`: the session could not be persisted
    #[tracing::instrument(skip_all, fields(email = %email))]
    pub async fn sign_in(&self, email: &Email, password: &str) -> Result<Session> {
        let result = self.start_session(email, password).await;
        AccountMetrics::record("sign_in", result.is_ok());
        match &result {
            Ok(session) => tracing::info!(uid = %session.uid, "Signed in"),
            Err(error) => tracing::info!(%error, "Sign-in rejected"),
        }
        result
    }

    async fn start_session(&self, email: &Email, password: &str) -> Result<Session> {
        let session = self.identity.sign_in(email.clone(), password.to_string()).await?;
        self.cache.save(&session).await?;
        Ok(session)
    }

    /// End the cached session, if any
    ///
    /// # Errors
    ///
    /// - `Identity`: the provider could not end the session
    /// - `Cache`: the cache could not be cleared
    #[tracing::instrument(skip_all)]
    pub async fn sign_out(&self) -> Result<()> {
        let cached = self.cached_session().await;
        if let Some(session) = cached {
            self.identity.sign_out(session.token).await?;
            tracing::info!(uid = %session.uid, "Signed out");
        }
        self.cache.clear().await?;
        AccountMetrics::record("sign_out", true);
        Ok(())
    }

    /// Pick up the session a previous run left behind
    ///
    /// Returns `None` when nothing is cached or the provider no longer honors
    /// the cached token; the stale entry is cleared in that case.
    ///
    /// # Errors
    ///
    /// - `Identity`: the provider is unreachable
    /// - `Cache`: a stale entry could not be cleared
    #[tracing::instrument(skip_all)]
    pub async fn restore_session(&self) -> Result<Option<Session>> {
        let Some(cached) = self.cached_session().await else {
            return Ok(None);
        };

        if cached.is_expired_at(self.clock.now()) {
            tracing::info!(uid = %cached.uid, "Cached session expired");
            self.cache.clear().await?;
            return Ok(None);
        }

        match self.identity.resolve_session(cached.token).await {
            Ok(session) => {
                tracing::info!(uid = %session.uid, "Session restored");
                AccountMetrics::record("restore_session", true);
                Ok(Some(session))
            }
            Err(IdentityError::SessionNotFound | IdentityError::SessionExpired) => {
                tracing::info!("Cached session is no longer valid");
                self.cache.clear().await?;
                AccountMetrics::record("restore_session", false);
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Profile document of `uid`
    ///
    /// # Errors
    ///
    /// - `ProfileNotFound`, `Store`
    pub async fn profile(&self, uid: &UserId) -> Result<UserProfile> {
        let document = self
            .store
            .get(Collection::Users, DocumentId::new(uid.as_str()))
            .await?
            .ok_or_else(|| AccountError::ProfileNotFound(uid.to_string()))?;
        Ok(serde_json::from_value(document.body).map_err(StoreError::from)?)
    }

    /// The name and address an event created by `email` records as its organizer
    ///
    /// # Errors
    ///
    /// - `ProfileNotFound`, `Store`
    #[tracing::instrument(skip_all, fields(email = %email))]
    pub async fn organizer_profile(&self, email: &Email) -> Result<Organizer> {
        let document = self.profile_document(email).await?;
        let profile: UserProfile =
            serde_json::from_value(document.body).map_err(StoreError::from)?;
        Ok(profile.as_organizer())
    }

    async fn profile_document(&self, email: &Email) -> Result<Document> {
        self.profiles_for(email)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AccountError::ProfileNotFound(email.to_string()))
    }

    async fn profiles_for(&self, email: &Email) -> Result<Vec<Document>> {
        let query =
            Query::collection(Collection::Users).where_eq(FieldPath::new("email"), email.as_str());
        Ok(self.store.query(query).await?)
    }

    async fn cached_session(&self) -> Option<Session> {
        match self.cache.load().await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(%error, "Ignoring unreadable session cache");
                None
            }
        }
    }
}

impl fmt::Debug for AccountService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountService").finish_non_exhaustive()
    }
}
