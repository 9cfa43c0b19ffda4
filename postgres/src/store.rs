//! `PostgreSQL` document store.
//!
//! Every document is one row of the `documents` table, its body a JSONB
//! value. Conditional updates run in a transaction that locks the row with
//! `SELECT ... FOR UPDATE`, applies the transforms with
//! [`apply_update`](party_core::document::apply_update) and writes the result
//! back, so concurrent updates of one document serialize on the row lock.
//!
//! Every committed write sends a `NOTIFY` on [`NOTIFY_CHANNEL`] carrying the
//! document's key and new version. Subscribers re-read the row and classify
//! the change against their query.

use futures::StreamExt;
use party_core::document::{
    apply_update, check_preconditions, classify_change, ChangeKind, Collection, Document,
    DocumentChange, DocumentId, DocumentUpdate, Precondition, Query,
};
use party_core::store::{DocumentChangeStream, DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgListener, PgPool};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Channel carrying change notices
pub const NOTIFY_CHANNEL: &str = "party_documents";

/// Payload of one change notice
#[derive(Debug, Serialize, Deserialize)]
struct Notice {
    collection: Collection,
    id: String,
    version: i64,
}

fn unavailable(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

/// `PostgreSQL`-backed [`DocumentStore`].
///
/// # Example
///
/// ```no_run
/// use party_postgres::PostgresDocumentStore;
/// use party_core::document::{Collection, DocumentId};
/// use party_core::store::DocumentStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), party_core::store::StoreError> {
/// let store = PostgresDocumentStore::new(pool);
/// let id = store.create(Collection::Events, None, serde_json::json!({ "eventName": "Picnic" })).await?;
/// assert!(store.get(Collection::Events, id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Store backed by `pool`; the schema must exist (see [`crate::migrate`]).
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_row(
        tx: &mut Transaction<'static, Postgres>,
        collection: Collection,
        id: &DocumentId,
    ) -> Result<(Value, i64), StoreError> {
        sqlx::query_as::<_, (Value, i64)>(
            "SELECT body, version FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(collection.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| StoreError::NotFound {
            collection,
            id: id.clone(),
        })
    }

    async fn notify(
        tx: &mut Transaction<'static, Postgres>,
        collection: Collection,
        id: &DocumentId,
        version: i64,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&Notice {
            collection,
            id: id.as_str().to_string(),
            version,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&mut **tx)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn commit(
        tx: Transaction<'static, Postgres>,
        operation: &'static str,
        collection: Collection,
    ) -> Result<(), StoreError> {
        tx.commit().await.map_err(unavailable)?;
        metrics::counter!(
            "party_store_writes_total",
            "operation" => operation,
            "collection" => collection.as_str()
        )
        .increment(1);
        Ok(())
    }
}

/// JSONB containment object equivalent to the query's equality filters
fn containment(query: &Query) -> Value {
    let mut root = Map::new();
    for filter in &query.filters {
        let nested = filter
            .path
            .segments()
            .iter()
            .rev()
            .fold(filter.value.clone(), |inner, segment| {
                let mut wrapper = Map::new();
                wrapper.insert(segment.clone(), inner);
                Value::Object(wrapper)
            });
        if let Value::Object(fields) = nested {
            merge_objects(&mut root, fields);
        }
    }
    Value::Object(root)
}

/// Deep-merges `source` into `target`; scalars in `source` win.
fn merge_objects(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    merge_objects(existing, incoming);
                } else {
                    target.insert(key, Value::Object(incoming));
                }
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

async fn fetch_row(
    pool: &PgPool,
    collection: Collection,
    id: &str,
) -> Result<Option<(Value, i64)>, StoreError> {
    sqlx::query_as::<_, (Value, i64)>(
        "SELECT body, version FROM documents WHERE collection = $1 AND id = $2",
    )
    .bind(collection.as_str())
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(unavailable)
}

impl DocumentStore for PostgresDocumentStore {
    fn create(
        &self,
        collection: Collection,
        id: Option<DocumentId>,
        body: Value,
    ) -> Pin<Box<dyn Future<Output = Result<DocumentId, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let id = id.unwrap_or_else(|| DocumentId::new(Uuid::new_v4().simple().to_string()));
            let mut tx = self.pool.begin().await.map_err(unavailable)?;

            let inserted = sqlx::query(
                "INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(collection.as_str())
            .bind(id.as_str())
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            if inserted.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists { collection, id });
            }

            Self::notify(&mut tx, collection, &id, 1).await?;
            Self::commit(tx, "create", collection).await?;
            tracing::debug!(%collection, %id, "Document created");
            Ok(id)
        })
    }

    fn get(
        &self,
        collection: Collection,
        id: DocumentId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Document>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = fetch_row(&self.pool, collection, id.as_str()).await?;
            Ok(row.map(|(body, _)| Document::new(id, body)))
        })
    }

    fn query(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Document>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, (String, Value)>(
                "SELECT id, body FROM documents WHERE collection = $1 AND body @> $2 ORDER BY id",
            )
            .bind(query.collection.as_str())
            .bind(containment(&query))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

            // Containment is looser than equality for arrays and objects.
            Ok(rows
                .into_iter()
                .filter(|(_, body)| query.matches(body))
                .map(|(id, body)| Document::new(DocumentId::new(id), body))
                .collect())
        })
    }

    fn update(
        &self,
        collection: Collection,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Document, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let (body, _) = Self::lock_row(&mut tx, collection, &id).await?;

            // Dropping the transaction on error rolls it back and releases the lock.
            let next = apply_update(&body, &update)?;

            let (version,) = sqlx::query_as::<_, (i64,)>(
                r"
                UPDATE documents
                SET body = $3, version = version + 1, updated_at = now()
                WHERE collection = $1 AND id = $2
                RETURNING version
                ",
            )
            .bind(collection.as_str())
            .bind(id.as_str())
            .bind(&next)
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;

            Self::notify(&mut tx, collection, &id, version).await?;
            Self::commit(tx, "update", collection).await?;
            tracing::debug!(%collection, %id, version, "Document updated");
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
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let (body, version) = Self::lock_row(&mut tx, collection, &id).await?;
            check_preconditions(&body, &preconditions)?;

            sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection.as_str())
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;

            Self::notify(&mut tx, collection, &id, version + 1).await?;
            Self::commit(tx, "delete", collection).await?;
            tracing::debug!(%collection, %id, "Document deleted");
            Ok(())
        })
    }

    fn subscribe(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<DocumentChangeStream, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut listener = PgListener::connect_with(&self.pool).await.map_err(unavailable)?;
            listener.listen(NOTIFY_CHANNEL).await.map_err(unavailable)?;

            // Listening before the snapshot: a write committed in between is
            // both in the snapshot and notified, and the version check drops
            // the duplicate.
            let initial = sqlx::query_as::<_, (String, Value, i64)>(
                "SELECT id, body, version FROM documents \
                 WHERE collection = $1 AND body @> $2 ORDER BY id",
            )
            .bind(query.collection.as_str())
            .bind(containment(&query))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

            let pool = self.pool.clone();
            let stream = async_stream::stream! {
                let mut known: HashMap<String, (i64, Value)> = HashMap::new();
                for (id, body, version) in initial {
                    if !query.matches(&body) {
                        continue;
                    }
                    known.insert(id.clone(), (version, body.clone()));
                    yield Ok(DocumentChange {
                        kind: ChangeKind::Added,
                        document: Document::new(DocumentId::new(id), body),
                    });
                }

                loop {
                    let notification = match listener.try_recv().await {
                        Ok(Some(notification)) => notification,
                        Ok(None) => {
                            // Connection lost and re-established; notices in
                            // between are gone.
                            yield Err(StoreError::Lagged(0));
                            break;
                        }
                        Err(error) => {
                            yield Err(unavailable(error));
                            break;
                        }
                    };

                    let notice: Notice = match serde_json::from_str(notification.payload()) {
                        Ok(notice) => notice,
                        Err(error) => {
                            tracing::warn!(%error, "Ignoring malformed change notice");
                            continue;
                        }
                    };
                    if notice.collection != query.collection {
                        continue;
                    }
                    let seen = known.get(&notice.id);
                    if seen.is_some_and(|(version, _)| *version >= notice.version) {
                        continue;
                    }

                    let current = match fetch_row(&pool, notice.collection, &notice.id).await {
                        Ok(current) => current,
                        Err(error) => {
                            yield Err(error);
                            break;
                        }
                    };
                    let before = known.get(&notice.id).map(|(_, body)| body);
                    let after = current.as_ref().map(|(body, _)| body);
                    let Some(kind) = classify_change(&query, before, after) else {
                        continue;
                    };

                    let body = match kind {
                        ChangeKind::Removed => known.remove(&notice.id).map(|(_, body)| body),
                        ChangeKind::Added | ChangeKind::Modified => current.map(|(body, version)| {
                            known.insert(notice.id.clone(), (version, body.clone()));
                            body
                        }),
                    };
                    if let Some(body) = body {
                        yield Ok(DocumentChange {
                            kind,
                            document: Document::new(DocumentId::new(notice.id), body),
                        });
                    }
                }
            };

            Ok(stream.boxed())
        })
    }
}
