//! # Party Core
//!
//! Domain types and the functional core of the party planner.
//!
//! This crate owns the rules governing an event's participant roster, the
//! pending-approval queue and per-participant role assignments. It performs no
//! I/O: every lifecycle operation is *planned* here as a description of a single
//! atomic document write, and executed elsewhere against a [`store::DocumentStore`].
//!
//! ## Core Concepts
//!
//! - **Event**: One document per party, see [`model::Event`]
//! - **Command**: Every organizer/participant operation, see [`command::EventCommand`]
//! - **Plan**: Pure output of [`command::plan`]; transforms guarded by preconditions
//! - **Document transforms**: Store-native field operations (set, array union/remove)
//! - **Environment**: Injected dependencies via traits (`Clock`, `DocumentStore`, `IdentityProvider`)
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - One operation, one atomic document mutation
//! - Authorization and capacity are preconditions evaluated by the store, never
//!   read-then-write in the caller
//!
//! ## Example
//!
//! ```
//! use party_core::command::{plan, EventCommand, LifecyclePolicy};
//! use party_core::model::{Email, EventDraft, Organizer, RoleShare};
//!
//! let organizer = Organizer::new("Ana Pop", Email::new("ana@example.com"));
//! let mut draft = EventDraft::new("Halloween", chrono::NaiveDate::from_ymd_opt(2025, 10, 31).unwrap_or_default(), 10, 25.0);
//! draft.role_percentages = vec![RoleShare::new("Food", 40.0), RoleShare::new("Drinks", 70.0)];
//!
//! let result = plan(
//!     EventCommand::Create { organizer, draft },
//!     None,
//!     LifecyclePolicy::default(),
//! );
//! assert!(result.is_err()); // 110% > 100%
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, NaiveDate, Utc};
pub use serde::{Deserialize, Serialize};

/// Role budget split validation and allocation arithmetic
pub mod budget;

/// Lifecycle commands and the pure planner
pub mod command;

/// JSON documents, field paths, transforms and queries
pub mod document;

/// Age and eligibility rules for registered users
pub mod eligibility;

/// Lifecycle error taxonomy
pub mod error;

/// Identity provider contract (register, verify, sign in/out)
pub mod identity;

/// Events, users and their value types
pub mod model;

/// Document store contract
pub mod store;

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// into the runtime services.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use error::LifecycleError;
