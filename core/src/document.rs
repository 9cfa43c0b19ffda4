//! Documents, field transforms and equality queries.
//!
//! The store holds schemaless JSON documents grouped in collections. Writes are
//! expressed as a [`DocumentUpdate`]: a list of [`Precondition`]s checked against
//! the current body followed by a list of [`FieldTransform`]s. A store applies
//! an update atomically with [`apply_update`], so either every transform lands
//! or none does.
//!
//! # Example
//!
//! ```
//! use party_core::document::{apply_update, DocumentUpdate, FieldPath, FieldTransform, Precondition};
//! use serde_json::json;
//!
//! let body = json!({ "participants": ["a@x.io"], "participantLimit": 2 });
//! let update = DocumentUpdate::new()
//!     .require(Precondition::ArrayLenBelow {
//!         path: FieldPath::new("participants"),
//!         limit_path: FieldPath::new("participantLimit"),
//!     })
//!     .transform(FieldTransform::ArrayUnion {
//!         path: FieldPath::new("participants"),
//!         values: vec![json!("b@x.io")],
//!     });
//!
//! let updated = apply_update(&body, &update).unwrap();
//! assert_eq!(updated["participants"], json!(["a@x.io", "b@x.io"]));
//!
//! // The roster is now full: the same update is rejected as a whole.
//! assert!(apply_update(&updated, &update).is_err());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Addressing
// ============================================================================

/// Top-level document collections
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Registered user profiles, keyed by identity-provider uid
    Users,
    /// Events, keyed by store-assigned id
    Events,
}

impl Collection {
    /// Collection name as stored
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Events => "events",
        }
    }

    /// Singular name of the entities held in the collection
    #[must_use]
    pub const fn entity_name(self) -> &'static str {
        match self {
            Self::Users => "user",
            Self::Events => "event",
        }
    }

    /// Parse a stored collection name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "users" => Some(Self::Users),
            "events" => Some(Self::Events),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a document within its collection
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap a raw id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the raw id
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Id within the collection
    pub id: DocumentId,
    /// JSON object body
    pub body: Value,
}

impl Document {
    /// Creates a new `Document`
    #[must_use]
    pub const fn new(id: DocumentId, body: Value) -> Self {
        Self { id, body }
    }
}

/// Path to a (possibly nested) field, one segment per object level
///
/// Segments are kept separate because map keys such as e-mail addresses
/// contain dots.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Single-segment path to a top-level field
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self(vec![field.into()])
    }

    /// Split a dotted path (`"organizer.email"`)
    #[must_use]
    pub fn dotted(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    /// Extend the path by one segment taken verbatim
    #[must_use]
    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Path segments, outermost first
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

// ============================================================================
// Updates
// ============================================================================

/// Store-native field operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FieldTransform {
    /// Replace (or create) a field, creating intermediate objects
    Set {
        /// Target field
        path: FieldPath,
        /// New value
        value: Value,
    },
    /// Remove a field; absent fields are left alone
    Delete {
        /// Target field
        path: FieldPath,
    },
    /// Append values not already present (set union)
    ArrayUnion {
        /// Target array
        path: FieldPath,
        /// Values to add
        values: Vec<Value>,
    },
    /// Remove every occurrence of the values (set difference)
    ArrayRemove {
        /// Target array
        path: FieldPath,
        /// Values to remove
        values: Vec<Value>,
    },
}

/// Condition the current document must satisfy for an update to apply
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "camelCase")]
pub enum Precondition {
    /// Field equals the value (an absent field equals `null`)
    FieldEquals {
        /// Field to compare
        path: FieldPath,
        /// Expected value
        value: Value,
    },
    /// Array field contains the value
    ArrayContains {
        /// Array field
        path: FieldPath,
        /// Required member
        value: Value,
    },
    /// Array field does not contain the value (absent arrays are empty)
    ArrayExcludes {
        /// Array field
        path: FieldPath,
        /// Forbidden member
        value: Value,
    },
    /// Array length is strictly below the number stored at `limit_path`
    ArrayLenBelow {
        /// Array field
        path: FieldPath,
        /// Numeric limit field of the same document
        limit_path: FieldPath,
    },
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldEquals { path, value } => write!(f, "{path} == {value}"),
            Self::ArrayContains { path, value } => write!(f, "{value} in {path}"),
            Self::ArrayExcludes { path, value } => write!(f, "{value} not in {path}"),
            Self::ArrayLenBelow { path, limit_path } => write!(f, "len({path}) < {limit_path}"),
        }
    }
}

/// Preconditions plus transforms, applied all-or-nothing
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    /// Checked against the current body before anything changes
    pub preconditions: Vec<Precondition>,
    /// Applied in order once every precondition holds
    pub transforms: Vec<FieldTransform>,
}

impl DocumentUpdate {
    /// Empty update
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition
    #[must_use]
    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    /// Add a transform
    #[must_use]
    pub fn transform(mut self, transform: FieldTransform) -> Self {
        self.transforms.push(transform);
        self
    }
}

/// Why an update could not be applied
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    /// A precondition did not hold
    #[error("Precondition failed: {0}")]
    PreconditionFailed(Precondition),

    /// A path segment crossed a non-object value
    #[error("'{path}' is not inside an object")]
    NotAnObject {
        /// Offending path
        path: String,
    },

    /// An array transform targeted a non-array value
    #[error("'{path}' is not an array")]
    NotAnArray {
        /// Offending path
        path: String,
    },

    /// A transform had an empty path
    #[error("Empty field path")]
    EmptyPath,
}

/// Look up a nested field
#[must_use]
pub fn lookup<'a>(body: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(body, |current, segment| current.as_object()?.get(segment))
}

fn lookup_mut<'a>(body: &'a mut Value, path: &FieldPath) -> Option<&'a mut Value> {
    let mut current = body;
    for segment in path.segments() {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Parent object of the path's last segment, created on the way down
fn parent_mut<'a, 'p>(
    body: &'a mut Value,
    path: &'p FieldPath,
) -> Result<(&'a mut Map<String, Value>, &'p str), TransformError> {
    let (last, parents) = path.segments().split_last().ok_or(TransformError::EmptyPath)?;

    let mut current = body;
    for segment in parents {
        let map = current
            .as_object_mut()
            .ok_or_else(|| TransformError::NotAnObject { path: path.to_string() })?;
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let map = current
        .as_object_mut()
        .ok_or_else(|| TransformError::NotAnObject { path: path.to_string() })?;
    Ok((map, last.as_str()))
}

/// Structural equality that compares numbers by value (`20 == 20.0`)
#[must_use]
#[allow(clippy::float_cmp)]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a == b || a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

fn array_len(body: &Value, path: &FieldPath) -> Result<usize, TransformError> {
    match lookup(body, path) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Array(items)) => Ok(items.len()),
        Some(_) => Err(TransformError::NotAnArray { path: path.to_string() }),
    }
}

fn array_contains(body: &Value, path: &FieldPath, value: &Value) -> bool {
    lookup(body, path)
        .and_then(Value::as_array)
        .is_some_and(|items| items.contains(value))
}

fn holds(body: &Value, precondition: &Precondition) -> Result<bool, TransformError> {
    Ok(match precondition {
        Precondition::FieldEquals { path, value } => {
            values_equal(lookup(body, path).unwrap_or(&Value::Null), value)
        }
        Precondition::ArrayContains { path, value } => array_contains(body, path, value),
        Precondition::ArrayExcludes { path, value } => !array_contains(body, path, value),
        Precondition::ArrayLenBelow { path, limit_path } => {
            let len = array_len(body, path)?;
            lookup(body, limit_path)
                .and_then(Value::as_u64)
                .is_some_and(|limit| (len as u64) < limit)
        }
    })
}

/// Check preconditions against a body without changing it
///
/// # Errors
///
/// Returns [`TransformError::PreconditionFailed`] with the first precondition
/// that does not hold.
pub fn check_preconditions(
    body: &Value,
    preconditions: &[Precondition],
) -> Result<(), TransformError> {
    for precondition in preconditions {
        if !holds(body, precondition)? {
            return Err(TransformError::PreconditionFailed(precondition.clone()));
        }
    }
    Ok(())
}

fn apply_transform(body: &mut Value, transform: &FieldTransform) -> Result<(), TransformError> {
    match transform {
        FieldTransform::Set { path, value } => {
            let (parent, key) = parent_mut(body, path)?;
            parent.insert(key.to_string(), value.clone());
        }
        FieldTransform::Delete { path } => {
            let Some((last, parents)) = path.segments().split_last() else {
                return Err(TransformError::EmptyPath);
            };
            let parent_path = FieldPath(parents.to_vec());
            if let Some(Value::Object(parent)) = lookup_mut(body, &parent_path) {
                parent.remove(last);
            }
        }
        FieldTransform::ArrayUnion { path, values } => {
            let (parent, key) = parent_mut(body, path)?;
            let slot = parent
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            let items = slot
                .as_array_mut()
                .ok_or_else(|| TransformError::NotAnArray { path: path.to_string() })?;
            for value in values {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
        }
        FieldTransform::ArrayRemove { path, values } => match lookup_mut(body, path) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => items.retain(|item| !values.contains(item)),
            Some(_) => return Err(TransformError::NotAnArray { path: path.to_string() }),
        },
    }
    Ok(())
}

/// Apply an update to a copy of `body`
///
/// Preconditions are checked first, then every transform is applied in order.
/// The input is never modified; on error nothing has changed.
///
/// # Errors
///
/// Returns a [`TransformError`] if a precondition fails or a transform does not
/// fit the document's shape.
pub fn apply_update(body: &Value, update: &DocumentUpdate) -> Result<Value, TransformError> {
    check_preconditions(body, &update.preconditions)?;

    let mut next = body.clone();
    for transform in &update.transforms {
        apply_transform(&mut next, transform)?;
    }
    Ok(next)
}

// ============================================================================
// Queries and change notifications
// ============================================================================

/// Equality filter on one field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field to compare
    pub path: FieldPath,
    /// Required value
    pub value: Value,
}

/// Documents of one collection matching every filter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Collection to search
    pub collection: Collection,
    /// Conjunction of equality filters; empty means "all documents"
    pub filters: Vec<Filter>,
}

impl Query {
    /// Every document of a collection
    #[must_use]
    pub const fn collection(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
        }
    }

    /// Add an equality filter
    #[must_use]
    pub fn where_eq(mut self, path: FieldPath, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            path,
            value: value.into(),
        });
        self
    }

    /// Whether a body satisfies every filter
    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|filter| {
            lookup(body, &filter.path).is_some_and(|value| values_equal(value, &filter.value))
        })
    }

    /// Stable key identifying the query, used to share subscriptions
    #[must_use]
    pub fn key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// How a document's membership in a query result changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Entered the result set
    Added,
    /// Changed while staying in the result set
    Modified,
    /// Left the result set (deleted or no longer matching)
    Removed,
}

/// One push notification of a query subscription
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    /// Kind of change
    pub kind: ChangeKind,
    /// The document after the change (before it, for `Removed`)
    pub document: Document,
}

/// Classify a committed write from a subscriber's point of view
///
/// Returns `None` when the write is invisible to the query.
#[must_use]
pub fn classify_change(
    query: &Query,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Option<ChangeKind> {
    let was_member = before.is_some_and(|body| query.matches(body));
    let is_member = after.is_some_and(|body| query.matches(body));

    match (was_member, is_member) {
        (false, true) => Some(ChangeKind::Added),
        (true, true) => Some(ChangeKind::Modified),
        (true, false) => Some(ChangeKind::Removed),
        (false, false) => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn participants() -> FieldPath {
        FieldPath::new("participants")
    }

    #[test]
    fn test_set_creates_nested_objects() {
        let update = DocumentUpdate::new().transform(FieldTransform::Set {
            path: FieldPath::new("roles").child("bob@example.com"),
            value: json!("DJ"),
        });
        let body = apply_update(&json!({}), &update).unwrap();
        assert_eq!(body["roles"]["bob@example.com"], json!("DJ"));
    }

    #[test]
    fn test_delete_missing_field_is_noop() {
        let update = DocumentUpdate::new().transform(FieldTransform::Delete {
            path: FieldPath::new("roles").child("nobody@example.com"),
        });
        let body = json!({ "eventName": "x" });
        assert_eq!(apply_update(&body, &update).unwrap(), body);
    }

    #[test]
    fn test_array_union_is_idempotent() {
        let update = DocumentUpdate::new().transform(FieldTransform::ArrayUnion {
            path: participants(),
            values: vec![json!("a"), json!("a")],
        });
        let once = apply_update(&json!({}), &update).unwrap();
        let twice = apply_update(&once, &update).unwrap();
        assert_eq!(twice["participants"], json!(["a"]));
    }

    #[test]
    fn test_array_remove_absent_value_is_noop() {
        let update = DocumentUpdate::new().transform(FieldTransform::ArrayRemove {
            path: participants(),
            values: vec![json!("zed")],
        });
        let body = json!({ "participants": ["a", "b"] });
        assert_eq!(apply_update(&body, &update).unwrap(), body);
        assert_eq!(apply_update(&json!({}), &update).unwrap(), json!({}));
    }

    #[test]
    fn test_failed_precondition_changes_nothing() {
        let body = json!({ "participants": ["a", "b"], "participantLimit": 2 });
        let update = DocumentUpdate::new()
            .require(Precondition::ArrayLenBelow {
                path: participants(),
                limit_path: FieldPath::new("participantLimit"),
            })
            .transform(FieldTransform::ArrayUnion {
                path: participants(),
                values: vec![json!("c")],
            });

        let err = apply_update(&body, &update).unwrap_err();
        assert!(matches!(
            err,
            TransformError::PreconditionFailed(Precondition::ArrayLenBelow { .. })
        ));
    }

    #[test]
    fn test_missing_limit_fails_len_check() {
        let body = json!({ "participants": [] });
        let result = check_preconditions(
            &body,
            &[Precondition::ArrayLenBelow {
                path: participants(),
                limit_path: FieldPath::new("participantLimit"),
            }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_field_equals_on_nested_path() {
        let body = json!({ "organizer": { "email": "ana@example.com" } });
        let ok = Precondition::FieldEquals {
            path: FieldPath::dotted("organizer.email"),
            value: json!("ana@example.com"),
        };
        let bad = Precondition::FieldEquals {
            path: FieldPath::dotted("organizer.email"),
            value: json!("eve@example.com"),
        };
        assert!(check_preconditions(&body, &[ok.clone()]).is_ok());
        assert_eq!(
            check_preconditions(&body, &[ok, bad.clone()]),
            Err(TransformError::PreconditionFailed(bad))
        );
    }

    #[test]
    fn test_array_union_on_scalar_is_rejected() {
        let update = DocumentUpdate::new().transform(FieldTransform::ArrayUnion {
            path: participants(),
            values: vec![json!("a")],
        });
        let err = apply_update(&json!({ "participants": 3 }), &update).unwrap_err();
        assert_eq!(err, TransformError::NotAnArray { path: "participants".to_string() });
    }

    #[test]
    fn test_query_matches_nested_equality() {
        let query = Query::collection(Collection::Events)
            .where_eq(FieldPath::dotted("organizer.email"), "ana@example.com");
        assert!(query.matches(&json!({ "organizer": { "email": "ana@example.com" } })));
        assert!(!query.matches(&json!({ "organizer": { "email": "bob@example.com" } })));
        assert!(!query.matches(&json!({})));
        assert!(Query::collection(Collection::Events).matches(&json!({})));
    }

    #[test]
    fn test_classify_change() {
        let query =
            Query::collection(Collection::Events).where_eq(FieldPath::new("accepting"), true);
        let open = json!({ "accepting": true });
        let closed = json!({ "accepting": false });

        assert_eq!(classify_change(&query, None, Some(&open)), Some(ChangeKind::Added));
        assert_eq!(classify_change(&query, Some(&open), Some(&open)), Some(ChangeKind::Modified));
        assert_eq!(classify_change(&query, Some(&open), Some(&closed)), Some(ChangeKind::Removed));
        assert_eq!(classify_change(&query, Some(&open), None), Some(ChangeKind::Removed));
        assert_eq!(classify_change(&query, None, Some(&closed)), None);
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(values_equal(&json!(20), &json!(20.0)));
        assert!(values_equal(&json!([{ "p": 50 }]), &json!([{ "p": 50.0 }])));
        assert!(!values_equal(&json!(20), &json!("20")));
        assert!(!values_equal(&json!({ "a": 1 }), &json!({ "a": 1, "b": 2 })));
    }

    #[test]
    fn test_query_key_is_stable() {
        let a = Query::collection(Collection::Events).where_eq(FieldPath::new("x"), 1);
        let b = Query::collection(Collection::Events).where_eq(FieldPath::new("x"), 1);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Query::collection(Collection::Events).key());
    }
}
