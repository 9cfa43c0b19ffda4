//! # Party Runtime
//!
//! The imperative shell of the party planner.
//!
//! `party-core` decides *what* a lifecycle operation writes; this crate
//! performs the write against an injected [`DocumentStore`](party_core::store::DocumentStore)
//! and surfaces the result.
//!
//! ## Core Components
//!
//! - **[`EventLifecycle`]**: every organizer and participant operation, one atomic store call each
//! - **[`EventFeed`]**: live, query-keyed event snapshots fanned out to observers
//! - **[`AccountService`]**: registration, verification, sign-in and session restore
//! - **Metrics**: Prometheus counters and histograms for all of the above
//!
//! ## Example
//!
//! ```no_run
//! use party_runtime::{EventFeed, EventLifecycle};
//! use party_core::store::DocumentStore;
//! use std::sync::Arc;
//!
//! # async fn example(store: Arc<dyn DocumentStore>) -> Result<(), party_core::LifecycleError> {
//! let lifecycle = EventLifecycle::new(Arc::clone(&store));
//! let feed = EventFeed::new(store);
//!
//! let mut events = feed.all_events().await?;
//! if let Some(snapshot) = events.next().await {
//!     for event in snapshot.events.iter() {
//!         println!("{}: {}/{}", event.event_name, event.participants.len(), event.participant_limit);
//!     }
//! }
//! # drop(lifecycle);
//! # Ok(())
//! # }
//! ```

/// Registration, sign-in and profile lookups
pub mod accounts;

/// Query-keyed live feed of events
pub mod feed;

/// Lifecycle command execution
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Exponential backoff for transient store failures
pub mod retry;

/// Local persistence of the signed-in session
pub mod session_cache;

pub use accounts::{AccountError, AccountService, RegistrationForm};
pub use feed::{EventFeed, FeedSnapshot, FeedSubscription};
pub use lifecycle::{EventLifecycle, JoinOutcome};
pub use session_cache::{FileSessionCache, MemorySessionCache, SessionCache, SessionCacheError};
