//! `PostgreSQL` identity provider.
//!
//! Accounts, single-use verification tokens and sessions live in their own
//! tables (see [`crate::migrate`]). Passwords are stored as argon2 PHC
//! strings; hashing and verification run on the blocking pool.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use party_core::environment::Clock;
use party_core::identity::{
    generate_token, validate_password, Account, IdentityError, IdentityProvider, Session,
    SessionToken, VerificationToken,
};
use party_core::model::{Email, UserId};
use sqlx::postgres::PgPool;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// Delivers verification tokens to account holders.
pub trait VerificationMailer: Send + Sync {
    /// Send `token` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unavailable`] if delivery fails.
    fn send_verification<'a>(
        &'a self,
        to: &'a Email,
        token: &'a VerificationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + 'a>>;
}

/// Mailer that logs the token instead of sending it.
///
/// For development: the token shows up in the application log.
#[derive(Clone, Debug, Default)]
pub struct ConsoleMailer;

impl ConsoleMailer {
    /// Create a console mailer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl VerificationMailer for ConsoleMailer {
    fn send_verification<'a>(
        &'a self,
        to: &'a Email,
        token: &'a VerificationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                to = %to,
                token = token.as_str(),
                "Verification e-mail (development mode)"
            );
            Ok(())
        })
    }
}

fn unavailable(error: sqlx::Error) -> IdentityError {
    IdentityError::Unavailable(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
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

/// Account row as read back from the database
type AccountRow = (String, String, bool);

fn account_from_row((uid, email, email_verified): AccountRow) -> Account {
    Account {
        uid: UserId::new(uid),
        email: Email::new(email),
        email_verified,
    }
}

/// `PostgreSQL`-backed [`IdentityProvider`].
#[derive(Clone)]
pub struct PostgresIdentityProvider {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
    mailer: Arc<dyn VerificationMailer>,
}

impl PostgresIdentityProvider {
    /// Create a provider issuing sessions valid for `session_ttl`
    #[must_use]
    pub fn new(
        pool: PgPool,
        clock: Arc<dyn Clock>,
        session_ttl: Duration,
        mailer: Arc<dyn VerificationMailer>,
    ) -> Self {
        Self {
            pool,
            clock,
            session_ttl,
            mailer,
        }
    }

    /// Delete every session that expired before now.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unavailable`] on database failure.
    pub async fn purge_expired_sessions(&self) -> Result<u64, IdentityError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "Expired sessions purged");
        }
        Ok(purged)
    }
}

impl std::fmt::Debug for PostgresIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresIdentityProvider")
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl IdentityProvider for PostgresIdentityProvider {
    #[tracing::instrument(skip_all, fields(email = %email))]
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

            let uid = UserId::new(Uuid::new_v4().simple().to_string());
            let inserted = sqlx::query(
                "INSERT INTO accounts (uid, email, password_hash) VALUES ($1, $2, $3)",
            )
            .bind(uid.as_str())
            .bind(email.as_str())
            .bind(password_hash)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    metrics::counter!("party_identity_registrations_total").increment(1);
                    tracing::info!(uid = uid.as_str(), "Account registered");
                    Ok(Account {
                        uid,
                        email,
                        email_verified: false,
                    })
                }
                Err(error) if is_unique_violation(&error) => {
                    Err(IdentityError::EmailAlreadyRegistered(email))
                }
                Err(error) => Err(unavailable(error)),
            }
        })
    }

    #[tracing::instrument(skip_all, fields(uid = uid.as_str()))]
    fn delete_account(
        &self,
        uid: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>> {
        Box::pin(async move {
            // Tokens and sessions go with the account (ON DELETE CASCADE).
            let deleted = sqlx::query("DELETE FROM accounts WHERE uid = $1")
                .bind(uid.as_str())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
            if deleted.rows_affected() > 0 {
                tracing::info!("Account deleted");
            }
            Ok(())
        })
    }

    fn send_verification(
        &self,
        uid: UserId,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let email = sqlx::query_as::<_, (String,)>("SELECT email FROM accounts WHERE uid = $1")
                .bind(uid.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?
                .map(|(email,)| Email::new(email))
                .ok_or(IdentityError::InvalidCredentials)?;

            let token = VerificationToken::new(generate_token());
            sqlx::query("INSERT INTO verification_tokens (token, uid) VALUES ($1, $2)")
                .bind(token.as_str())
                .bind(uid.as_str())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;

            self.mailer.send_verification(&email, &token).await
        })
    }

    fn verify_email(
        &self,
        token: VerificationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Account, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;

            // Deleting the token is the redemption; a second redeem finds nothing.
            let (uid,) = sqlx::query_as::<_, (String,)>(
                "DELETE FROM verification_tokens WHERE token = $1 RETURNING uid",
            )
            .bind(token.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or(IdentityError::InvalidVerificationToken)?;

            let row = sqlx::query_as::<_, AccountRow>(
                "UPDATE accounts SET email_verified = TRUE WHERE uid = $1 \
                 RETURNING uid, email, email_verified",
            )
            .bind(&uid)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or(IdentityError::InvalidVerificationToken)?;

            tx.commit().await.map_err(unavailable)?;
            tracing::info!(uid = %uid, "E-mail verified");
            Ok(account_from_row(row))
        })
    }

    #[tracing::instrument(skip_all, fields(email = %email))]
    fn sign_in(
        &self,
        email: Email,
        password: String,
    ) -> Pin<Box<dyn Future<Output = Result<Session, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, (String, String, bool, String)>(
                "SELECT uid, email, email_verified, password_hash FROM accounts WHERE email = $1",
            )
            .bind(email.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

            let Some((uid, stored_email, email_verified, password_hash)) = row else {
                metrics::counter!("party_identity_sign_ins_total", "outcome" => "rejected")
                    .increment(1);
                return Err(IdentityError::InvalidCredentials);
            };
            if !verify_password(password, password_hash).await {
                metrics::counter!("party_identity_sign_ins_total", "outcome" => "rejected")
                    .increment(1);
                return Err(IdentityError::InvalidCredentials);
            }
            let account = account_from_row((uid, stored_email, email_verified));
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
            sqlx::query(
                "INSERT INTO sessions (token, uid, email, issued_at, expires_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(session.token.as_str())
            .bind(session.uid.as_str())
            .bind(session.email.as_str())
            .bind(session.issued_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

            metrics::counter!("party_identity_sign_ins_total", "outcome" => "accepted")
                .increment(1);
            Ok(session)
        })
    }

    fn sign_out(
        &self,
        token: SessionToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM sessions WHERE token = $1")
                .bind(token.as_str())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
            Ok(())
        })
    }

    fn resolve_session(
        &self,
        token: SessionToken,
    ) -> Pin<Box<dyn Future<Output = Result<Session, IdentityError>> + Send + '_>> {
        Box::pin(async move {
            let (uid, email, issued_at, expires_at) =
                sqlx::query_as::<_, (String, String, DateTime<Utc>, DateTime<Utc>)>(
                    "SELECT uid, email, issued_at, expires_at FROM sessions WHERE token = $1",
                )
                .bind(token.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?
                .ok_or(IdentityError::SessionNotFound)?;

            let session = Session {
                token,
                uid: UserId::new(uid),
                email: Email::new(email),
                issued_at,
                expires_at,
            };
            if session.is_expired_at(self.clock.now()) {
                return Err(IdentityError::SessionExpired);
            }
            Ok(session)
        })
    }
}
