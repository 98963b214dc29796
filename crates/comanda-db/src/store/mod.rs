//! # Entity Store Contract
//!
//! The transactional document store the services talk to. Documents are
//! `serde_json::Value` objects that always carry a string `id`.
//!
//! ## Operations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  find_one / find_many      filter by top-level field equality           │
//! │  insert_one                fails with Duplicate on an existing id       │
//! │  insert_one_unless         atomic "insert unless a match exists"        │
//! │  update_one                RFC 7396 merge patch on the first match,     │
//! │                            optional upsert                              │
//! │  delete_one                removes the first match                      │
//! │  move_one                  archive-by-move; atomic where the backend    │
//! │                            has transactions, two-phase otherwise        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Compare-and-swap is expressed as an update filtered on `id` + `version`:
//! `matched == 0` means someone else wrote first.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use tracing::{error, warn};

use crate::error::{StoreError, StoreResult};

/// A stored document body.
pub type Document = Value;

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Tables,
    Orders,
    OrderArchive,
    CashSessions,
    Discrepancies,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Tables,
        Collection::Orders,
        Collection::OrderArchive,
        Collection::CashSessions,
        Collection::Discrepancies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Tables => "tables",
            Collection::Orders => "orders",
            Collection::OrderArchive => "order_archive",
            Collection::CashSessions => "cash_sessions",
            Collection::Discrepancies => "discrepancies",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Filter / Sort / Options
// =============================================================================

/// Conjunction of top-level field equalities. An empty filter matches all.
///
/// ## Example
/// ```rust
/// use comanda_db::store::Filter;
/// use serde_json::json;
///
/// let open_on_five = Filter::new().eq("table_number", "05").eq("status", "open");
/// assert!(open_on_five.matches(&json!({"id": "o-1", "table_number": "05", "status": "open"})));
/// assert!(!open_on_five.matches(&json!({"id": "o-2", "table_number": "05", "status": "closed"})));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// Matches the document whose `id` is `id`.
    pub fn by_id(id: impl Into<String>) -> Self {
        Filter::new().eq("id", id.into())
    }

    /// Adds `field == value`. A `null` value also matches a missing field.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The `id` this filter pins, if any.
    pub fn id(&self) -> Option<&str> {
        self.clauses
            .iter()
            .find(|(field, _)| field == "id")
            .and_then(|(_, value)| value.as_str())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            match doc.get(field.as_str()) {
                Some(actual) => values_equal(actual, expected),
                None => expected.is_null(),
            }
        })
    }

    /// Rejects field names that aren't plain identifiers.
    pub fn validate(&self) -> StoreResult<()> {
        for (field, value) in &self.clauses {
            validate_field_name(field)?;
            if value.is_object() || value.is_array() {
                return Err(StoreError::InvalidFilter(format!(
                    "{field}: only scalar values can be compared"
                )));
            }
        }
        Ok(())
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => actual == expected,
    }
}

pub(crate) fn validate_field_name(field: &str) -> StoreResult<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidFilter(format!("bad field name '{field}'")))
    }
}

/// Orders results by one top-level field; ties broken by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            descending: true,
        }
    }

    /// Comparator used by backends that sort in process.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let by_field = compare_values(a.get(&self.field), b.get(&self.field));
        let by_field = if self.descending {
            by_field.reverse()
        } else {
            by_field
        };
        by_field.then_with(|| compare_values(a.get("id"), b.get("id")))
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert `filter ∪ patch` when nothing matches.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        UpdateOptions { upsert: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub upserted: bool,
}

// =============================================================================
// Document Helpers
// =============================================================================

/// RFC 7396 JSON merge patch: objects merge recursively, `null` removes a
/// key, everything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Document built for an upsert: the filter's equalities, then the patch.
pub(crate) fn upsert_document(filter: &Filter, patch: &Document) -> StoreResult<Document> {
    let mut doc = Value::Object(Map::new());
    for (field, value) in filter.clauses() {
        if let Value::Object(map) = &mut doc {
            map.insert(field.clone(), value.clone());
        }
    }
    merge_patch(&mut doc, patch);
    document_id(&doc)?;
    Ok(doc)
}

/// The `id` every document must carry.
pub fn document_id(doc: &Document) -> StoreResult<String> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidDocument("document has no string id".to_string()))
}

pub fn to_document<T: Serialize>(value: &T) -> StoreResult<Document> {
    let doc = serde_json::to_value(value)?;
    document_id(&doc)?;
    Ok(doc)
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> StoreResult<T> {
    Ok(serde_json::from_value(doc)?)
}

// =============================================================================
// EntityStore Trait
// =============================================================================

/// The store contract. Backends must make every single operation atomic.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Name used in logs.
    fn backend(&self) -> &'static str;

    async fn find_one(&self, collection: Collection, filter: &Filter) -> StoreResult<Option<Document>>;

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> StoreResult<Vec<Document>>;

    /// Inserts `doc`; `Duplicate` when its id (or a unique key) exists.
    async fn insert_one(&self, collection: Collection, doc: Document) -> StoreResult<()>;

    /// Inserts `doc` unless a document matching `conflict` exists.
    /// Returns whether the insert happened.
    async fn insert_one_unless(
        &self,
        collection: Collection,
        doc: Document,
        conflict: &Filter,
    ) -> StoreResult<bool>;

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: Document,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult>;

    /// Returns the number of removed documents (0 or 1).
    async fn delete_one(&self, collection: Collection, filter: &Filter) -> StoreResult<u64>;

    /// Moves the document matching `filter` from `from` to `to`, storing
    /// `doc` as the destination body. Returns `false` when nothing matched.
    ///
    /// ## Default: Two-Phase Move
    /// ```text
    ///  1. find source (filter)       none ──► Ok(false)
    ///  2. insert destination copy    (an existing copy is kept)
    ///  3. delete source (filter)     0 rows ──► undo step 2, Ok(false)
    ///                                error  ──► PartialMove (both copies)
    /// ```
    async fn move_one(
        &self,
        from: Collection,
        to: Collection,
        filter: &Filter,
        doc: Document,
    ) -> StoreResult<bool> {
        let id = document_id(&doc)?;

        if self.find_one(from, filter).await?.is_none() {
            return Ok(false);
        }

        let inserted = match self.insert_one(to, doc).await {
            Ok(()) => true,
            Err(e) if e.is_duplicate() => {
                warn!(%id, %to, "Destination copy already present, finishing move");
                false
            }
            Err(e) => return Err(e),
        };

        match self.delete_one(from, filter).await {
            Ok(1) => Ok(true),
            Ok(_) => {
                // Source changed after the check; take back our copy
                if inserted {
                    self.delete_one(to, &Filter::by_id(id.as_str())).await?;
                }
                Ok(false)
            }
            Err(e) => {
                error!(%id, %from, %to, error = %e, "Move left a duplicate");
                Err(StoreError::PartialMove {
                    from: from.to_string(),
                    to: to.to_string(),
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_rfc7396() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}, "keep": 1});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}, "new": [1, 2]}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}, "keep": 1, "new": [1, 2]}));
    }

    #[test]
    fn test_merge_patch_replaces_arrays_and_scalars() {
        let mut doc = json!({"items": [1, 2, 3], "n": {"x": 1}});
        merge_patch(&mut doc, &json!({"items": [4], "n": 5}));
        assert_eq!(doc, json!({"items": [4], "n": 5}));
    }

    #[test]
    fn test_filter_matches_null_as_missing() {
        let filter = Filter::new().eq("closed_at", Value::Null);
        assert!(filter.matches(&json!({"id": "x"})));
        assert!(filter.matches(&json!({"id": "x", "closed_at": null})));
        assert!(!filter.matches(&json!({"id": "x", "closed_at": "2026-01-01"})));
    }

    #[test]
    fn test_filter_numbers_compare_by_value() {
        let filter = Filter::by_id("o-1").eq("version", 3u64);
        assert!(filter.matches(&json!({"id": "o-1", "version": 3})));
        assert!(!filter.matches(&json!({"id": "o-1", "version": 4})));
        assert_eq!(filter.id(), Some("o-1"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(Filter::new().eq("table_number", "05").validate().is_ok());
        assert!(Filter::new().eq("body'); DROP", "x").validate().is_err());
        assert!(Filter::new().eq("items", json!([1])).validate().is_err());
    }

    #[test]
    fn test_sort_compare() {
        let a = json!({"id": "a", "opened_at": "2026-01-01T10:00:00Z"});
        let b = json!({"id": "b", "opened_at": "2026-01-02T10:00:00Z"});
        assert_eq!(Sort::desc("opened_at").compare(&a, &b), Ordering::Greater);
        assert_eq!(Sort::asc("opened_at").compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_upsert_document_needs_id() {
        let doc = upsert_document(&Filter::by_id("t-1"), &json!({"status": "free"})).unwrap();
        assert_eq!(doc, json!({"id": "t-1", "status": "free"}));
        assert!(upsert_document(&Filter::new(), &json!({"status": "free"})).is_err());
    }
}
