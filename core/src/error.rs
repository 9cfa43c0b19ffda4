//! Error types for event lifecycle operations.

use crate::model::Email;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Every way a lifecycle operation can fail.
///
/// Each operation is a single atomic store mutation, so any error means the
/// stored event is unchanged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    /// Event or user id could not be resolved.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("event", "user")
        kind: &'static str,
        /// The unresolved id or key
        id: String,
    },

    /// A non-organizer attempted an organizer-only operation, or the organizer
    /// attempted something reserved for other participants.
    #[error("{actor} may not {operation}")]
    PermissionDenied {
        /// Who attempted the operation
        actor: Email,
        /// Operation name
        operation: &'static str,
    },

    /// The roster is full.
    #[error("Participant limit of {limit} reached")]
    CapacityExceeded {
        /// The event's participant limit
        limit: u32,
    },

    /// Role percentages add up to more than 100.
    #[error("Role percentages add up to {sum}%, must not exceed 100%")]
    InvalidPercentageSum {
        /// The offending sum
        sum: f64,
    },

    /// A role was assigned to someone who is not on the roster.
    #[error("{participant} is not a participant")]
    NotAParticipant {
        /// The target of the assignment
        participant: Email,
    },

    /// The candidate has no pending join request.
    #[error("{candidate} has no pending join request")]
    NotPending {
        /// The candidate
        candidate: Email,
    },

    /// The event is not accepting join requests.
    #[error("Event is not accepting registrations")]
    RegistrationClosed,

    /// The event changed between planning and applying in a way that
    /// invalidates the plan (e.g. the join flow was switched).
    #[error("Event changed concurrently, retry the operation")]
    Conflict,

    /// Input rejected before reaching the store.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The stored document does not decode as an event.
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Transient backend failure; not retried automatically.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LifecycleError {
    /// Shorthand for an unresolved event id
    #[must_use]
    pub fn event_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "event",
            id: id.into(),
        }
    }

    /// Stable label for metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InvalidPercentageSum { .. } => "invalid_percentage_sum",
            Self::NotAParticipant { .. } => "not_a_participant",
            Self::NotPending { .. } => "not_pending",
            Self::RegistrationClosed => "registration_closed",
            Self::Conflict => "conflict",
            Self::Validation(_) => "validation",
            Self::MalformedDocument(_) => "malformed_document",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Whether the caller may reasonably retry the same request
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Conflict)
    }
}

impl From<StoreError> for LifecycleError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { collection, id } => Self::NotFound {
                kind: collection.entity_name(),
                id: id.into_inner(),
            },
            StoreError::Serialization(reason) | StoreError::InvalidDocument { reason, .. } => {
                Self::MalformedDocument(reason)
            }
            // Precondition failures are mapped by the caller, which knows which
            // guard each precondition stands for.
            StoreError::PreconditionFailed(precondition) => {
                Self::StoreUnavailable(format!("unmapped precondition failure: {precondition}"))
            }
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}
