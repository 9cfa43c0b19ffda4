//! `PostgreSQL` backends for the party planner.
//!
//! This crate provides:
//!
//! - [`PostgresDocumentStore`]: JSONB documents with row-locked atomic updates
//!   and `LISTEN`/`NOTIFY` query subscriptions
//! - [`PostgresIdentityProvider`]: argon2-hashed accounts, verification tokens
//!   and sessions
//!
//! Both share one connection pool and one schema, created by [`migrate`].
//!
//! # Example
//!
//! ```no_run
//! use party_postgres::{connect, migrate, PostgresDocumentStore};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/party", 10, Duration::from_secs(5)).await?;
//! migrate(&pool).await?;
//! let store = PostgresDocumentStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod identity;
mod schema;
mod store;

pub use identity::{ConsoleMailer, PostgresIdentityProvider, VerificationMailer};
pub use schema::migrate;
pub use store::{PostgresDocumentStore, NOTIFY_CHANNEL};

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Open a connection pool
///
/// # Errors
///
/// Returns the driver error if no connection can be established within
/// `connect_timeout`.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    connect_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}
