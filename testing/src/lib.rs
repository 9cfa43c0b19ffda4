//! # Party Testing
//!
//! Testing utilities for the party planner.
//!
//! This crate provides:
//! - Mock implementations of the environment traits (`FixedClock`)
//! - [`InMemoryDocumentStore`]: atomic, subscribable in-memory document store
//! - [`InMemoryIdentityProvider`]: argon2-backed accounts with a verification outbox
//! - Fixtures, invariant assertions and proptest strategies
//!
//! ## Example
//!
//! ```
//! use party_testing::{fixtures, test_clock, InMemoryDocumentStore};
//! use party_core::environment::Clock;
//!
//! let store = InMemoryDocumentStore::new();
//! let draft = fixtures::open_draft(2);
//! assert_eq!(draft.participant_limit, 2);
//! assert_eq!(test_clock().now(), test_clock().now());
//! # drop(store);
//! ```

use chrono::{DateTime, Utc};
use party_core::environment::Clock;

pub mod fixtures;
mod identity;
mod store;

pub use identity::{InMemoryIdentityProvider, SentVerification};
pub use store::InMemoryDocumentStore;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use party_testing::mocks::FixedClock;
    /// use party_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a test-friendly `tracing` subscriber (captured by the test harness)
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
