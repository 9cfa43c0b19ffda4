//! In-memory document store
//!
//! Fast, deterministic [`DocumentStore`] for tests and the `memory` backend:
//! - Every write runs under one write lock, so preconditions and transforms are
//!   applied atomically with respect to concurrent writers
//! - Subscriptions are fed from a broadcast channel of committed writes
//! - Availability can be toggled to exercise `StoreUnavailable` paths
//! - Live subscriptions can be cut to exercise resubscription

#![allow(clippy::unwrap_used)] // Test infrastructure: lock poisoning is a test failure
#![allow(clippy::missing_panics_doc)]

use party_core::document::{
    apply_update, check_preconditions, classify_change, ChangeKind, Collection, Document,
    DocumentChange, DocumentId, DocumentUpdate, Precondition, Query,
};
use party_core::store::{DocumentChangeStream, DocumentStore, StoreError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Buffered committed writes per subscriber before it lags
const CHANGE_BUFFER: usize = 1024;

/// A committed write, before and after
#[derive(Clone, Debug)]
struct CommittedWrite {
    collection: Collection,
    id: DocumentId,
    before: Option<Value>,
    after: Option<Value>,
}

#[derive(Debug)]
struct Shared {
    documents: RwLock<HashMap<Collection, BTreeMap<DocumentId, Value>>>,
    writes: broadcast::Sender<CommittedWrite>,
    // Bumped to cut every open subscription.
    epoch: watch::Sender<u64>,
    unavailable: AtomicBool,
    write_count: AtomicUsize,
}

/// In-memory document store.
///
/// Cloning is cheap and every clone shares the same documents.
///
/// # Example
///
/// ```
/// use party_testing::InMemoryDocumentStore;
/// use party_core::document::{Collection, DocumentId};
/// use party_core::store::DocumentStore;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryDocumentStore::new();
/// let id = store.create(Collection::Events, None, json!({ "eventName": "Party" })).await?;
/// assert!(store.get(Collection::Events, id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryDocumentStore {
    shared: Arc<Shared>,
}

impl InMemoryDocumentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (writes, _) = broadcast::channel(CHANGE_BUFFER);
        let (epoch, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                documents: RwLock::new(HashMap::new()),
                writes,
                epoch,
                unavailable: AtomicBool::new(false),
                write_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End every open subscription with `StoreError::Lagged`, as a backend
    /// losing its change feed would
    pub fn drop_subscriptions(&self) {
        self.shared.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Number of committed writes (creates, updates and deletes)
    ///
    /// Useful to assert that a rejected operation wrote nothing.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.shared.write_count.load(Ordering::SeqCst)
    }

    /// Number of documents in a collection
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.shared
            .documents
            .read()
            .unwrap()
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// Raw body of a document, bypassing availability checks
    #[must_use]
    pub fn raw(&self, collection: Collection, id: &DocumentId) -> Option<Value> {
        self.shared
            .documents
            .read()
            .unwrap()
            .get(&collection)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    /// Store a body as-is, bypassing validation (for malformed-document tests)
    pub fn insert_raw(&self, collection: Collection, id: DocumentId, body: Value) {
        let mut documents = self.shared.documents.write().unwrap();
        let before = documents.entry(collection).or_default().insert(id.clone(), body.clone());
        self.commit(collection, id, before, Some(body));
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }

    // Called with the documents write lock held so subscribers observe
    // writes in commit order.
    fn commit(
        &self,
        collection: Collection,
        id: DocumentId,
        before: Option<Value>,
        after: Option<Value>,
    ) {
        self.shared.write_count.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine: nobody is subscribed.
        let _ = self.shared.writes.send(CommittedWrite {
            collection,
            id,
            before,
            after,
        });
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn create(
        &self,
        collection: Collection,
        id: Option<DocumentId>,
        body: Value,
    ) -> Pin<Box<dyn Future<Output = Result<DocumentId, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            if !body.is_object() {
                return Err(StoreError::InvalidDocument {
                    path: String::new(),
                    reason: "document body must be a JSON object".to_string(),
                });
            }

            let id = id.unwrap_or_else(|| DocumentId::new(Uuid::new_v4().to_string()));
            let mut documents = self.shared.documents.write().unwrap();
            let entries = documents.entry(collection).or_default();
            if entries.contains_key(&id) {
                return Err(StoreError::AlreadyExists { collection, id });
            }
            entries.insert(id.clone(), body.clone());
            self.commit(collection, id.clone(), None, Some(body));
            Ok(id)
        })
    }

    fn get(
        &self,
        collection: Collection,
        id: DocumentId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Document>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(self.raw(collection, &id).map(|body| Document::new(id, body)))
        })
    }

    fn query(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Document>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let documents = self.shared.documents.read().unwrap();
            Ok(documents
                .get(&query.collection)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(_, body)| query.matches(body))
                        .map(|(id, body)| Document::new(id.clone(), body.clone()))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn update(
        &self,
        collection: Collection,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Document, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut documents = self.shared.documents.write().unwrap();
            let current = documents
                .get_mut(&collection)
                .and_then(|entries| entries.get_mut(&id));
            let Some(current) = current else {
                return Err(StoreError::NotFound { collection, id });
            };

            let next = apply_update(current, &update)?;
            let before = std::mem::replace(current, next.clone());
            self.commit(collection, id.clone(), Some(before), Some(next.clone()));
            Ok(Document::new(id, next))
        })
    }

    fn delete(
        &self,
        collection: Collection,
        id: DocumentId,
        preconditions: Vec<Precondition>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut documents = self.shared.documents.write().unwrap();
            let entries = documents.entry(collection).or_default();
            let Some(current) = entries.get(&id) else {
                return Err(StoreError::NotFound { collection, id });
            };

            check_preconditions(current, &preconditions)?;
            let before = entries.remove(&id);
            self.commit(collection, id, before, None);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<DocumentChangeStream, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;

            // Subscribe and snapshot under the same lock so no write falls
            // between the two.
            let (mut receiver, initial) = {
                let documents = self.shared.documents.read().unwrap();
                let receiver = self.shared.writes.subscribe();
                let initial: Vec<Document> = documents
                    .get(&query.collection)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|(_, body)| query.matches(body))
                            .map(|(id, body)| Document::new(id.clone(), body.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                (receiver, initial)
            };

            let mut epoch = self.shared.epoch.subscribe();
            let stream: DocumentChangeStream = Box::pin(async_stream::stream! {
                for document in initial {
                    yield Ok(DocumentChange { kind: ChangeKind::Added, document });
                }

                loop {
                    let received = tokio::select! {
                        received = receiver.recv() => Some(received),
                        Ok(()) = epoch.changed() => None,
                    };
                    let Some(received) = received else {
                        yield Err(StoreError::Lagged(0));
                        break;
                    };
                    match received {
                        Ok(write) => {
                            if write.collection != query.collection {
                                continue;
                            }
                            let before = write.before.as_ref();
                            let Some(kind) = classify_change(&query, before, write.after.as_ref())
                            else {
                                continue;
                            };
                            let body = match kind {
                                ChangeKind::Removed => write.before,
                                ChangeKind::Added | ChangeKind::Modified => write.after,
                            };
                            if let Some(body) = body {
                                let document = Document::new(write.id, body);
                                yield Ok(DocumentChange { kind, document });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(StoreError::Lagged(skipped));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            Ok(stream)
        })
    }
}
