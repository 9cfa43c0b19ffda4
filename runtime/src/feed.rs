//! Live event feed.
//!
//! One store subscription per distinct query, fanned out to any number of
//! observers. Each upstream subscription materializes its result set and
//! publishes it as a [`FeedSnapshot`] on a `watch` channel: observers always
//! see the latest complete state and never a backlog of stale ones.
//!
//! Observers hold a [`FeedSubscription`]; dropping the last one for a query
//! cancels the upstream subscription.

use crate::metrics::FeedMetrics;
use crate::retry::{retry_transient, RetryPolicy};
use futures::{FutureExt, Stream, StreamExt};
use party_core::document::{ChangeKind, Collection, DocumentChange, Query};
use party_core::error::{LifecycleError, Result};
use party_core::model::{Event, EventId};
use party_core::store::{DocumentChangeStream, DocumentStore, StoreError};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The materialized result set of a query at one point in time
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedSnapshot {
    /// Matching events, ordered by id
    pub events: Arc<Vec<Event>>,
    /// Bumped on every published snapshot; `0` until the initial load is published
    pub revision: u64,
}

impl FeedSnapshot {
    /// Find an event by id
    #[must_use]
    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.events.iter().find(|event| event.id == *id)
    }
}

struct Hub {
    receiver: watch::Receiver<FeedSnapshot>,
    subscribers: usize,
    task: JoinHandle<()>,
}

type Hubs = Arc<Mutex<HashMap<String, Hub>>>;

fn lock(hubs: &Hubs) -> MutexGuard<'_, HashMap<String, Hub>> {
    hubs.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_gauges(hubs: &HashMap<String, Hub>) {
    let subscribers = hubs.values().map(|hub| hub.subscribers).sum();
    FeedMetrics::record_subscribers(subscribers, hubs.len());
}

/// Query-keyed subscription fan-out.
///
/// # Example
///
/// ```no_run
/// use party_runtime::EventFeed;
/// use party_core::store::DocumentStore;
/// use std::sync::Arc;
///
/// # async fn example(store: Arc<dyn DocumentStore>) -> Result<(), party_core::LifecycleError> {
/// let feed = EventFeed::new(store);
/// let mut subscription = feed.all_events().await?;
/// while let Some(snapshot) = subscription.next().await {
///     println!("{} events", snapshot.events.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventFeed {
    store: Arc<dyn DocumentStore>,
    hubs: Hubs,
    retry: RetryPolicy,
}

impl EventFeed {
    /// Feed backed by `store`
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            hubs: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff used when an upstream subscription has to be re-established
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Subscribe to every event
    ///
    /// # Errors
    ///
    /// - `StoreUnavailable`: the store subscription could not be opened
    pub async fn all_events(&self) -> Result<FeedSubscription> {
        self.subscribe(Query::collection(Collection::Events)).await
    }

    /// Subscribe to the events matching `query`
    ///
    /// Observers of equal queries share one store subscription.
    ///
    /// # Errors
    ///
    /// - `Validation`: the query does not target the events collection
    /// - `StoreUnavailable`: the store subscription could not be opened
    #[tracing::instrument(skip_all, fields(query = %query.key()))]
    pub async fn subscribe(&self, query: Query) -> Result<FeedSubscription> {
        if query.collection != Collection::Events {
            return Err(LifecycleError::Validation(format!(
                "the event feed cannot follow the '{}' collection",
                query.collection
            )));
        }
        let key = query.key();

        if let Some(subscription) = self.join_hub(&key) {
            return Ok(subscription);
        }

        let changes = self.store.subscribe(query.clone()).await?;

        let mut hubs = lock(&self.hubs);
        // Another observer may have opened the same query meanwhile.
        if let Some(hub) = hubs.get_mut(&key).filter(|hub| !hub.task.is_finished()) {
            drop(changes);
            return Ok(self.attach(hub, key));
        }

        let (sender, receiver) = watch::channel(FeedSnapshot::default());
        let upstream = Upstream {
            store: Arc::clone(&self.store),
            query,
            retry: self.retry.clone(),
        };
        let task = tokio::spawn(upstream.follow(changes, sender));
        let fresh = Hub {
            receiver,
            subscribers: 0,
            task,
        };
        // A finished hub left behind by a failed upstream is replaced.
        let hub = match hubs.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(fresh);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(fresh),
        };
        let subscription = self.attach(hub, key);
        record_gauges(&hubs);
        tracing::debug!("Opened upstream feed subscription");
        Ok(subscription)
    }

    /// Number of distinct queries currently followed upstream
    #[must_use]
    pub fn active_queries(&self) -> usize {
        lock(&self.hubs).len()
    }

    /// Number of open subscriptions across all queries
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.hubs).values().map(|hub| hub.subscribers).sum()
    }

    fn join_hub(&self, key: &str) -> Option<FeedSubscription> {
        let mut hubs = lock(&self.hubs);
        let hub = hubs.get_mut(key).filter(|hub| !hub.task.is_finished())?;
        let subscription = self.attach(hub, key.to_string());
        record_gauges(&hubs);
        Some(subscription)
    }

    fn attach(&self, hub: &mut Hub, key: String) -> FeedSubscription {
        hub.subscribers += 1;
        let mut receiver = hub.receiver.clone();
        receiver.borrow_and_update();
        FeedSubscription {
            key,
            receiver,
            primed: false,
            hubs: Arc::clone(&self.hubs),
        }
    }
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("active_queries", &self.active_queries())
            .finish_non_exhaustive()
    }
}

struct Upstream {
    store: Arc<dyn DocumentStore>,
    query: Query,
    retry: RetryPolicy,
}

impl Upstream {
    /// Materialize the query's result set and publish every change
    ///
    /// The first snapshot is published as soon as the already-delivered part
    /// of the initial result set is folded in, even when it is empty.
    async fn follow(self, mut changes: DocumentChangeStream, sender: watch::Sender<FeedSnapshot>) {
        let mut events: BTreeMap<EventId, Event> = BTreeMap::new();
        let mut revision = 0;
        let mut batch = drain_ready(&mut changes);

        loop {
            let mut resync = false;
            for change in batch {
                match change {
                    Ok(change) => apply_change(&mut events, change),
                    Err(error) if error.is_transient() => {
                        tracing::warn!(%error, "Feed lost track of the store, resubscribing");
                        resync = true;
                        break;
                    }
                    Err(error) => {
                        tracing::error!(%error, "Upstream feed subscription failed");
                        return;
                    }
                }
            }

            if resync {
                match self.resubscribe().await {
                    Ok(fresh) => {
                        // The fresh subscription replays the whole result set.
                        changes = fresh;
                        events.clear();
                        batch = drain_ready(&mut changes);
                        continue;
                    }
                    Err(error) => {
                        tracing::error!(%error, "Could not resubscribe to the store");
                        return;
                    }
                }
            }

            revision += 1;
            let snapshot = FeedSnapshot {
                events: Arc::new(events.values().cloned().collect()),
                revision,
            };
            if sender.send(snapshot).is_err() {
                // Every receiver is gone, including the hub's own.
                return;
            }

            let Some(first) = changes.next().await else {
                tracing::debug!("Upstream feed subscription closed");
                return;
            };
            // Fold everything that is already buffered into one snapshot.
            batch = vec![first];
            batch.extend(drain_ready(&mut changes));
        }
    }

    async fn resubscribe(&self) -> std::result::Result<DocumentChangeStream, StoreError> {
        retry_transient(&self.retry, || self.store.subscribe(self.query.clone())).await
    }
}

fn drain_ready(
    changes: &mut DocumentChangeStream,
) -> Vec<std::result::Result<DocumentChange, StoreError>> {
    let mut ready = Vec::new();
    while let Some(Some(change)) = changes.next().now_or_never() {
        ready.push(change);
    }
    ready
}

fn apply_change(events: &mut BTreeMap<EventId, Event>, change: DocumentChange) {
    let DocumentChange { kind, document } = change;
    match kind {
        ChangeKind::Removed => {
            events.remove(&EventId::from(document.id));
        }
        ChangeKind::Added | ChangeKind::Modified => match Event::from_document(&document) {
            Ok(event) => {
                events.insert(event.id.clone(), event);
            }
            Err(error) => {
                tracing::warn!(event_id = %document.id, %error, "Skipping malformed event in feed");
                events.remove(&EventId::from(document.id));
            }
        },
    }
}

/// An observer's handle on a live query
///
/// Dropping the handle unsubscribes.
pub struct FeedSubscription {
    key: String,
    receiver: watch::Receiver<FeedSnapshot>,
    primed: bool,
    hubs: Hubs,
}

impl FeedSubscription {
    /// Latest published snapshot
    #[must_use]
    pub fn current(&self) -> FeedSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next snapshot
    ///
    /// The first call returns the current snapshot if one was already loaded.
    /// Returns `None` once the upstream subscription has ended.
    pub async fn next(&mut self) -> Option<FeedSnapshot> {
        if !self.primed {
            self.primed = true;
            let current = self.receiver.borrow_and_update().clone();
            if current.revision > 0 {
                return Some(current);
            }
        }
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Consume the handle as a stream of snapshots
    pub fn into_stream(mut self) -> impl Stream<Item = FeedSnapshot> + Send {
        async_stream::stream! {
            while let Some(snapshot) = self.next().await {
                yield snapshot;
            }
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        let mut hubs = lock(&self.hubs);
        // Handles of a replaced hub no longer count towards the live one.
        let Some(hub) = hubs
            .get_mut(&self.key)
            .filter(|hub| hub.receiver.same_channel(&self.receiver))
        else {
            return;
        };
        hub.subscribers = hub.subscribers.saturating_sub(1);
        if hub.subscribers == 0 {
            if let Some(hub) = hubs.remove(&self.key) {
                hub.task.abort();
                tracing::debug!(query = %self.key, "Closed upstream feed subscription");
            }
        }
        record_gauges(&hubs);
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("query", &self.key)
            .field("revision", &self.receiver.borrow().revision)
            .finish_non_exhaustive()
    }
}
