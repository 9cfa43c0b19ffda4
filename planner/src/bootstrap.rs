//! Wires the services to the configured backend.

use crate::config::{Config, StoreBackend};
use crate::mailbox::DevMailbox;
use party_core::environment::{Clock, SystemClock};
use party_core::identity::{IdentityProvider, VerificationToken};
use party_core::model::Email;
use party_core::store::DocumentStore;
use party_postgres::{PostgresDocumentStore, PostgresIdentityProvider};
use party_runtime::metrics::{register_metrics, MetricsError, MetricsServer};
use party_runtime::{
    AccountService, EventFeed, EventLifecycle, FileSessionCache, MemorySessionCache, SessionCache,
};
use party_testing::{InMemoryDocumentStore, InMemoryIdentityProvider};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Startup failures.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Database connection or schema setup failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Metrics exporter could not be installed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// Where verification tokens end up in a local run
enum Outbox {
    Memory(InMemoryIdentityProvider),
    Mailbox(DevMailbox),
}

/// The assembled application.
///
/// # Example
///
/// ```no_run
/// use party_planner::{Config, PartyPlanner};
///
/// # async fn example() -> Result<(), party_planner::BootstrapError> {
/// let app = PartyPlanner::build(&Config::from_env()).await?;
/// let events = app.lifecycle.list().await;
/// # Ok(())
/// # }
/// ```
pub struct PartyPlanner {
    /// Event lifecycle operations
    pub lifecycle: EventLifecycle,
    /// Live event lists
    pub feed: EventFeed,
    /// Registration, sign-in and profiles
    pub accounts: AccountService,
    outbox: Outbox,
    metrics: Option<MetricsServer>,
}

impl PartyPlanner {
    /// Connect the backend and build every service.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The database cannot be reached or migrated
    /// - The metrics exporter cannot be built
    pub async fn build(config: &Config) -> Result<Self, BootstrapError> {
        let metrics = if config.observability.metrics_enabled {
            let mut server = MetricsServer::new(config.observability.metrics_addr);
            server.start()?;
            Some(server)
        } else {
            register_metrics();
            None
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (store, identity, outbox): (Arc<dyn DocumentStore>, Arc<dyn IdentityProvider>, Outbox) =
            match config.store.backend {
                StoreBackend::Memory => {
                    info!("Using in-memory backend; data is lost on exit");
                    let identity = InMemoryIdentityProvider::with_session_ttl(
                        Arc::clone(&clock),
                        config.session_ttl(),
                    );
                    (
                        Arc::new(InMemoryDocumentStore::new()),
                        Arc::new(identity.clone()),
                        Outbox::Memory(identity),
                    )
                }
                StoreBackend::Postgres => {
                    info!("Connecting to PostgreSQL...");
                    let pool = party_postgres::connect(
                        &config.store.database_url,
                        config.store.max_connections,
                        Duration::from_secs(config.store.connect_timeout),
                    )
                    .await?;
                    party_postgres::migrate(&pool).await?;

                    let mailbox = DevMailbox::new();
                    let identity = PostgresIdentityProvider::new(
                        pool.clone(),
                        Arc::clone(&clock),
                        config.session_ttl(),
                        Arc::new(mailbox.clone()),
                    );
                    (
                        Arc::new(PostgresDocumentStore::new(pool)),
                        Arc::new(identity),
                        Outbox::Mailbox(mailbox),
                    )
                }
            };

        let cache: Arc<dyn SessionCache> = match &config.session.cache_path {
            Some(path) => Arc::new(FileSessionCache::new(path.clone())),
            None => Arc::new(MemorySessionCache::new()),
        };

        let lifecycle = EventLifecycle::with_policy(Arc::clone(&store), config.lifecycle_policy());
        let feed = EventFeed::new(Arc::clone(&store)).with_retry_policy(config.feed_retry_policy());
        let accounts = AccountService::new(identity, store, cache, clock);
        info!(backend = ?config.store.backend, "Party planner ready");

        Ok(Self {
            lifecycle,
            feed,
            accounts,
            outbox,
            metrics,
        })
    }

    /// Latest verification token sent to `email` during this run
    #[must_use]
    pub fn pending_verification(&self, email: &Email) -> Option<VerificationToken> {
        match &self.outbox {
            Outbox::Memory(identity) => identity.latest_verification(email),
            Outbox::Mailbox(mailbox) => mailbox.latest(email),
        }
    }

    /// Current metrics in Prometheus text format, if the exporter runs
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().and_then(MetricsServer::render)
    }
}
