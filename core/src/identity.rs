//! Identity provider contract.
//!
//! Accounts are keyed by e-mail and own an opaque uid that doubles as the id of
//! the user's profile document. Signing in requires a verified address.

use crate::model::{Email, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Minimum accepted password length
pub const MIN_PASSWORD_LEN: usize = 6;

/// A registered account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Provider-assigned id
    pub uid: UserId,
    /// Login e-mail
    pub email: Email,
    /// Whether the address was confirmed
    pub email_verified: bool,
}

/// Opaque bearer token of a signed-in session
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a raw token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens end up in logs through `Debug` on surrounding structs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// One-time token proving control of an e-mail address
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationToken(String);

impl VerificationToken {
    /// Wrap a raw token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A signed-in session, persisted locally between runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token
    pub token: SessionToken,
    /// Signed-in account
    pub uid: UserId,
    /// Signed-in address
    pub email: Email,
    /// When the session started
    pub issued_at: DateTime<Utc>,
    /// When the provider stops honoring the token
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session has run out at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Identity provider failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Registration with an address that already has an account.
    #[error("An account already exists for {0}")]
    EmailAlreadyRegistered(Email),

    /// Unknown address or wrong password.
    #[error("Invalid e-mail or password")]
    InvalidCredentials,

    /// Sign-in before the address was confirmed.
    #[error("E-mail address {0} is not verified")]
    EmailNotVerified(Email),

    /// Verification token unknown or already used.
    #[error("Invalid or expired verification token")]
    InvalidVerificationToken,

    /// No such session.
    #[error("Session not found")]
    SessionNotFound,

    /// Session past its expiry.
    #[error("Session expired")]
    SessionExpired,

    /// Password rejected by policy.
    #[error("Password must be at least {min_len} characters")]
    WeakPassword {
        /// Required length
        min_len: usize,
    },

    /// Malformed e-mail address.
    #[error("Malformed e-mail address: {0}")]
    InvalidEmail(String),

    /// Backend failure.
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Check a password against the provider's policy
///
/// # Errors
///
/// Returns [`IdentityError::WeakPassword`] if the password is too short.
pub fn validate_password(password: &str) -> Result<(), IdentityError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(IdentityError::WeakPassword {
            min_len: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// Generate a 256-bit random token, base64url-encoded (43 characters)
#[must_use]
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Account registration, e-mail verification and sessions.
///
/// Returns boxed futures so implementations can be shared as
/// `Arc<dyn IdentityProvider>`.
pub trait IdentityProvider: Send + Sync {
    /// Create an unverified account.
    ///
    /// # Errors
    ///
    /// - `EmailAlreadyRegistered`, `WeakPassword`, `InvalidEmail`
    fn register(
        &self,
        email: Email,
        password: String,
    ) -> Pin<Box<dyn Future<Output = Result<Account, IdentityError>> + Send + '_>>;

    /// Remove an account with its pending tokens and sessions.
    ///
    /// Unknown uids are ignored.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: backend failure
    fn delete_account(
        &self,
        uid: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>>;

    /// Issue a verification token and deliver it to the account's address.
    ///
    /// # Errors
    ///
    /// - `InvalidCredentials`: unknown uid
    fn send_verification(
        &self,
        uid: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>>;

    /// Redeem a verification token.
    ///
    /// # Errors
    ///
    /// - `InvalidVerificationToken`: unknown or already used
    fn verify_email(
        &self,
        token: VerificationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Account, IdentityError>> + Send + '_>>;

    /// Start a session.
    ///
    /// # Errors
    ///
    /// - `InvalidCredentials`: unknown address or wrong password
    /// - `EmailNotVerified`: correct credentials, unconfirmed address
    fn sign_in(
        &self,
        email: Email,
        password: String,
    ) -> Pin<Box<dyn Future<Output = Result<Session, IdentityError>> + Send + '_>>;

    /// End a session; unknown tokens are ignored.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: backend failure
    fn sign_out(
        &self,
        token: SessionToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>>;

    /// Look up a live session by token.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound`, `SessionExpired`
    fn resolve_session(
        &self,
        token: SessionToken,
    ) -> Pin<Box<dyn Future<Output = Result<Session, IdentityError>> + Send + '_>>;
}
