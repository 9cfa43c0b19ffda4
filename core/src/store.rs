//! Document store abstraction.
//!
//! The store is the single source of truth for users and events. It offers
//! exactly what the lifecycle needs:
//!
//! - Create, read and delete documents by id
//! - Equality queries within one collection
//! - Conditional updates: preconditions plus field transforms applied atomically
//! - Push subscriptions to a query's result set
//!
//! Atomicity is the contract that matters. An implementation must evaluate the
//! preconditions of a [`DocumentUpdate`] and apply its transforms as one
//! indivisible step with respect to every other writer of the same document.
//! Capacity and authorization checks rely on it.
//!
//! # Implementations
//!
//! - `PostgresDocumentStore` (in `party-postgres`): JSONB rows, `SELECT ... FOR UPDATE`
//! - `InMemoryDocumentStore` (in `party-testing`): Lock-protected maps for tests
//!
//! # Example
//!
//! ```no_run
//! use party_core::document::{Collection, DocumentId, DocumentUpdate, FieldPath, FieldTransform};
//! use party_core::store::{DocumentStore, StoreError};
//! use serde_json::json;
//!
//! async fn rename(store: &dyn DocumentStore, id: DocumentId) -> Result<(), StoreError> {
//!     let update = DocumentUpdate::new().transform(FieldTransform::Set {
//!         path: FieldPath::new("eventName"),
//!         value: json!("Renamed"),
//!     });
//!     store.update(Collection::Events, id, update).await?;
//!     Ok(())
//! }
//! ```

use crate::document::{
    Collection, Document, DocumentChange, DocumentId, DocumentUpdate, Precondition, Query,
    TransformError,
};
use futures::Stream;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during document store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No document with this id.
    #[error("Document not found: {collection}/{id}")]
    NotFound {
        /// Collection searched
        collection: Collection,
        /// Missing id
        id: DocumentId,
    },

    /// A create with an explicit id collided with an existing document.
    #[error("Document already exists: {collection}/{id}")]
    AlreadyExists {
        /// Target collection
        collection: Collection,
        /// Taken id
        id: DocumentId,
    },

    /// A precondition of a conditional write did not hold; nothing was written.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(Precondition),

    /// A transform did not fit the stored document's shape.
    #[error("Invalid document at '{path}': {reason}")]
    InvalidDocument {
        /// Offending field path
        path: String,
        /// What was wrong
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A subscriber fell behind and missed notifications.
    #[error("Subscription lagged, {0} changes skipped")]
    Lagged(u64),

    /// Database connection or backend failure.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether repeating the call may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Lagged(_))
    }
}

impl From<TransformError> for StoreError {
    fn from(error: TransformError) -> Self {
        match error {
            TransformError::PreconditionFailed(precondition) => {
                Self::PreconditionFailed(precondition)
            }
            TransformError::NotAnObject { path } => Self::InvalidDocument {
                path,
                reason: "not inside an object".to_string(),
            },
            TransformError::NotAnArray { path } => Self::InvalidDocument {
                path,
                reason: "not an array".to_string(),
            },
            TransformError::EmptyPath => Self::InvalidDocument {
                path: String::new(),
                reason: "empty field path".to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Stream of changes to a query's result set
///
/// The first items describe the result set at subscription time (one
/// `Added` per matching document); every committed write that affects the
/// result set follows in commit order.
pub type DocumentChangeStream =
    Pin<Box<dyn Stream<Item = Result<DocumentChange, StoreError>> + Send>>;

/// Persistent, subscribable document storage.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn DocumentStore>` by the runtime services.
pub trait DocumentStore: Send + Sync {
    /// Create a document and return its id.
    ///
    /// With `id: None` the store assigns a fresh unique id.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists`: an explicit id is already taken
    /// - `Unavailable`: backend failure
    fn create(
        &self,
        collection: Collection,
        id: Option<DocumentId>,
        body: Value,
    ) -> Pin<Box<dyn Future<Output = Result<DocumentId, StoreError>> + Send + '_>>;

    /// Fetch one document; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: backend failure
    fn get(
        &self,
        collection: Collection,
        id: DocumentId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Document>, StoreError>> + Send + '_>>;

    /// All documents matching a query, ordered by id.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: backend failure
    fn query(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Document>, StoreError>> + Send + '_>>;

    /// Atomically check preconditions and apply transforms; returns the new document.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no document with this id
    /// - `PreconditionFailed`: the first precondition that did not hold
    /// - `InvalidDocument`: a transform did not fit the document's shape
    /// - `Unavailable`: backend failure
    fn update(
        &self,
        collection: Collection,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Document, StoreError>> + Send + '_>>;

    /// Atomically check preconditions and delete a document.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no document with this id
    /// - `PreconditionFailed`: the first precondition that did not hold
    /// - `Unavailable`: backend failure
    fn delete(
        &self,
        collection: Collection,
        id: DocumentId,
        preconditions: Vec<Precondition>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Subscribe to a query's result set.
    ///
    /// Dropping the returned stream ends the subscription.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: the subscription could not be established
    fn subscribe(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<DocumentChangeStream, StoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FieldPath;

    #[test]
    fn not_found_error_display() {
        let error = StoreError::NotFound {
            collection: Collection::Events,
            id: DocumentId::new("evt-1"),
        };
        assert_eq!(error.to_string(), "Document not found: events/evt-1");
    }

    #[test]
    fn transform_error_keeps_failed_precondition() {
        let precondition = Precondition::ArrayLenBelow {
            path: FieldPath::new("participants"),
            limit_path: FieldPath::new("participantLimit"),
        };
        let error = StoreError::from(TransformError::PreconditionFailed(precondition.clone()));
        assert_eq!(error, StoreError::PreconditionFailed(precondition));
    }
}
