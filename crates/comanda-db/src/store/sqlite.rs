//! # SQLite Store
//!
//! `EntityStore` over the `documents` table. Queries are assembled at
//! runtime because filters are dynamic; every value is bound, never
//! interpolated.
//!
//! ## Atomicity
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────────────┐
//! │ insert_one_unless    │ INSERT … SELECT … WHERE NOT EXISTS (one stmt)    │
//! │ update_one           │ UPDATE … json_patch(body, ?) WHERE rowid =       │
//! │                      │   (SELECT rowid … LIMIT 1)        (one stmt)     │
//! │ delete_one           │ DELETE … WHERE rowid = (SELECT …) (one stmt)     │
//! │ move_one             │ DELETE source + INSERT destination in one        │
//! │                      │ transaction                                      │
//! └──────────────────────┴──────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::Row;
use tracing::{debug, trace};

use super::{
    document_id, upsert_document, validate_field_name, Collection, Document, EntityStore, Filter,
    Sort, UpdateOptions, UpdateResult,
};
use crate::error::{StoreError, StoreResult};
use crate::pool::SqliteStore;

// =============================================================================
// Query Building
// =============================================================================

/// A value bound into a runtime query.
#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
}

/// `collection = ? AND <clauses>` plus its binds.
struct WhereClause {
    sql: String,
    binds: Vec<Bind>,
}

fn where_clause(collection: Collection, filter: &Filter) -> StoreResult<WhereClause> {
    filter.validate()?;

    let mut sql = String::from("collection = ?");
    let mut binds = vec![Bind::Text(collection.as_str().to_string())];

    for (field, value) in filter.clauses() {
        if field == "id" {
            match value {
                Value::String(id) => {
                    sql.push_str(" AND id = ?");
                    binds.push(Bind::Text(id.clone()));
                    continue;
                }
                _ => return Err(StoreError::InvalidFilter("id must be a string".to_string())),
            }
        }

        let path = Bind::Text(format!("$.{field}"));
        match value {
            Value::Null => {
                sql.push_str(" AND json_extract(body, ?) IS NULL");
                binds.push(path);
            }
            Value::Bool(b) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                binds.push(path);
                binds.push(Bind::Int(i64::from(*b)));
            }
            Value::Number(n) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                binds.push(path);
                binds.push(match n.as_i64() {
                    Some(i) => Bind::Int(i),
                    None => Bind::Real(n.as_f64().unwrap_or(f64::NAN)),
                });
            }
            Value::String(s) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                binds.push(path);
                binds.push(Bind::Text(s.clone()));
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(StoreError::InvalidFilter(format!(
                    "{field}: only scalar values can be compared"
                )))
            }
        }
    }

    Ok(WhereClause { sql, binds })
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: &[Bind],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(s) => query.bind(s.clone()),
            Bind::Int(i) => query.bind(*i),
            Bind::Real(f) => query.bind(*f),
        };
    }
    query
}

fn parse_body(body: &str) -> StoreResult<Document> {
    Ok(serde_json::from_str(body)?)
}

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

/// Maps a unique-index violation to a Duplicate naming the collection.
fn tag_duplicate(err: sqlx::Error, collection: Collection, id: &str) -> StoreError {
    match StoreError::from(err) {
        StoreError::Duplicate { key, .. } => {
            StoreError::duplicate(collection.as_str(), format!("{id} ({key})"))
        }
        other => other,
    }
}

// =============================================================================
// EntityStore Implementation
// =============================================================================

#[async_trait]
impl EntityStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn find_one(&self, collection: Collection, filter: &Filter) -> StoreResult<Option<Document>> {
        let clause = where_clause(collection, filter)?;
        let sql = format!("SELECT body FROM documents WHERE {} LIMIT 1", clause.sql);

        let body: Option<String> = bind_all(sqlx::query(&sql), &clause.binds)
            .try_map(|row: SqliteRow| row.try_get::<String, _>(0))
            .fetch_optional(self.pool())
            .await?;

        body.map(|b| parse_body(&b)).transpose()
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> StoreResult<Vec<Document>> {
        let clause = where_clause(collection, filter)?;
        let mut binds = clause.binds;
        let mut sql = format!("SELECT body FROM documents WHERE {}", clause.sql);

        match sort {
            Some(sort) => {
                validate_field_name(&sort.field)?;
                let direction = if sort.descending { "DESC" } else { "ASC" };
                sql.push_str(&format!(" ORDER BY json_extract(body, ?) {direction}, id ASC"));
                binds.push(Bind::Text(format!("$.{}", sort.field)));
            }
            None => sql.push_str(" ORDER BY id ASC"),
        }

        let bodies: Vec<String> = bind_all(sqlx::query(&sql), &binds)
            .try_map(|row: SqliteRow| row.try_get::<String, _>(0))
            .fetch_all(self.pool())
            .await?;

        bodies.iter().map(|b| parse_body(b)).collect()
    }

    async fn insert_one(&self, collection: Collection, doc: Document) -> StoreResult<()> {
        let id = document_id(&doc)?;
        let now = now_text();
        trace!(%collection, %id, "insert");

        sqlx::query(
            "INSERT INTO documents (collection, id, body, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection.as_str())
        .bind(&id)
        .bind(serde_json::to_string(&doc)?)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| tag_duplicate(e, collection, &id))?;

        Ok(())
    }

    async fn insert_one_unless(
        &self,
        collection: Collection,
        doc: Document,
        conflict: &Filter,
    ) -> StoreResult<bool> {
        let id = document_id(&doc)?;
        let clause = where_clause(collection, conflict)?;
        let now = now_text();

        let sql = format!(
            "INSERT INTO documents (collection, id, body, created_at, updated_at) \
             SELECT ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM documents WHERE {})",
            clause.sql
        );

        let mut binds = vec![
            Bind::Text(collection.as_str().to_string()),
            Bind::Text(id.clone()),
            Bind::Text(serde_json::to_string(&doc)?),
            Bind::Text(now.clone()),
            Bind::Text(now),
        ];
        binds.extend(clause.binds);

        match bind_all(sqlx::query(&sql), &binds).execute(self.pool()).await {
            Ok(result) => Ok(result.rows_affected() == 1),
            // Same id, or a partial unique index caught what the filter didn't
            Err(e) => match StoreError::from(e) {
                StoreError::Duplicate { key, .. } => {
                    debug!(%collection, %id, %key, "Conditional insert hit a unique index");
                    Ok(false)
                }
                other => Err(other),
            },
        }
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: Document,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        let clause = where_clause(collection, filter)?;

        // The id lives in its own column; keep the body's copy in step
        let mut patch = patch;
        if let Some(map) = patch.as_object_mut() {
            map.remove("id");
        }

        let sql = format!(
            "UPDATE documents SET body = json_patch(body, ?), updated_at = ? \
             WHERE rowid = (SELECT rowid FROM documents WHERE {} LIMIT 1)",
            clause.sql
        );
        let mut binds = vec![
            Bind::Text(serde_json::to_string(&patch)?),
            Bind::Text(now_text()),
        ];
        binds.extend(clause.binds);

        let result = bind_all(sqlx::query(&sql), &binds)
            .execute(self.pool())
            .await
            .map_err(|e| tag_duplicate(e, collection, filter.id().unwrap_or("?")))?;

        if result.rows_affected() > 0 {
            return Ok(UpdateResult {
                matched: result.rows_affected(),
                upserted: false,
            });
        }

        if !options.upsert {
            return Ok(UpdateResult::default());
        }

        let doc = upsert_document(filter, &patch)?;
        let id = document_id(&doc)?;
        let now = now_text();
        let inserted = sqlx::query(
            "INSERT INTO documents (collection, id, body, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(collection.as_str())
        .bind(&id)
        .bind(serde_json::to_string(&doc)?)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| tag_duplicate(e, collection, &id))?;

        Ok(UpdateResult {
            matched: 0,
            upserted: inserted.rows_affected() == 1,
        })
    }

    async fn delete_one(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        let clause = where_clause(collection, filter)?;
        let sql = format!(
            "DELETE FROM documents WHERE rowid = (SELECT rowid FROM documents WHERE {} LIMIT 1)",
            clause.sql
        );

        let result = bind_all(sqlx::query(&sql), &clause.binds)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Archive-by-move inside one transaction: either both the delete and
    /// the insert commit or neither does.
    async fn move_one(
        &self,
        from: Collection,
        to: Collection,
        filter: &Filter,
        doc: Document,
    ) -> StoreResult<bool> {
        let id = document_id(&doc)?;
        let clause = where_clause(from, filter)?;
        let delete_sql = format!(
            "DELETE FROM documents WHERE rowid = (SELECT rowid FROM documents WHERE {} LIMIT 1)",
            clause.sql
        );

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        // Delete first so the transaction takes the write lock immediately
        let deleted = bind_all(sqlx::query(&delete_sql), &clause.binds)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
            return Ok(false);
        }

        let now = now_text();
        sqlx::query(
            "INSERT INTO documents (collection, id, body, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(to.as_str())
        .bind(&id)
        .bind(serde_json::to_string(&doc)?)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| tag_duplicate(e, to, &id))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        debug!(%id, %from, %to, "Moved document");
        Ok(true)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::connect(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_find_and_filter_types() {
        let store = store().await;
        store
            .insert_one(
                Collection::Discrepancies,
                json!({"id": "d-1", "resolved": false, "amount": 500, "session_id": null}),
            )
            .await
            .unwrap();

        let by_bool = store
            .find_one(Collection::Discrepancies, &Filter::new().eq("resolved", false))
            .await
            .unwrap();
        assert!(by_bool.is_some());

        let by_null = store
            .find_many(Collection::Discrepancies, &Filter::new().eq("session_id", Value::Null), None)
            .await
            .unwrap();
        assert_eq!(by_null.len(), 1);

        let by_number = store
            .find_one(Collection::Discrepancies, &Filter::new().eq("amount", 500))
            .await
            .unwrap();
        assert_eq!(by_number.unwrap()["id"], "d-1");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let store = store().await;
        store
            .insert_one(Collection::Tables, json!({"id": "t-1", "number": "01"}))
            .await
            .unwrap();
        let err = store
            .insert_one(Collection::Tables, json!({"id": "t-1", "number": "02"}))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_partial_unique_index_backs_open_orders() {
        let store = store().await;
        store
            .insert_one(
                Collection::Orders,
                json!({"id": "o-1", "table_number": "05", "status": "open"}),
            )
            .await
            .unwrap();

        // Conflict filter deliberately too loose to match; the index still holds
        let inserted = store
            .insert_one_unless(
                Collection::Orders,
                json!({"id": "o-2", "table_number": "05", "status": "open"}),
                &Filter::by_id("o-2"),
            )
            .await
            .unwrap();
        assert!(!inserted);
    }

    #[tokio::test]
    async fn test_cas_update_and_merge_patch() {
        let store = store().await;
        store
            .insert_one(
                Collection::Orders,
                json!({"id": "o-1", "version": 0, "note": "x", "items": [1, 2]}),
            )
            .await
            .unwrap();

        let cas = Filter::by_id("o-1").eq("version", 0);
        let first = store
            .update_one(
                Collection::Orders,
                &cas,
                json!({"version": 1, "note": null, "items": [3]}),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        let stale = store
            .update_one(Collection::Orders, &cas, json!({"version": 1}), UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(first.matched, 1);
        assert_eq!(stale.matched, 0);

        let doc = store
            .find_one(Collection::Orders, &Filter::by_id("o-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc, json!({"id": "o-1", "version": 1, "items": [3]}));
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let store = store().await;
        let result = store
            .update_one(
                Collection::Tables,
                &Filter::by_id("t-3"),
                json!({"number": "03"}),
                UpdateOptions::upsert(),
            )
            .await
            .unwrap();
        assert!(result.upserted);

        assert_eq!(store.delete_one(Collection::Tables, &Filter::by_id("t-3")).await.unwrap(), 1);
        assert_eq!(store.delete_one(Collection::Tables, &Filter::by_id("t-3")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transactional_move() {
        let store = store().await;
        store
            .insert_one(Collection::Orders, json!({"id": "o-1", "version": 2, "status": "open"}))
            .await
            .unwrap();

        let stale = store
            .move_one(
                Collection::Orders,
                Collection::OrderArchive,
                &Filter::by_id("o-1").eq("version", 1),
                json!({"id": "o-1", "status": "closed"}),
            )
            .await
            .unwrap();
        assert!(!stale);

        let moved = store
            .move_one(
                Collection::Orders,
                Collection::OrderArchive,
                &Filter::by_id("o-1").eq("version", 2),
                json!({"id": "o-1", "status": "closed"}),
            )
            .await
            .unwrap();
        assert!(moved);

        assert!(store
            .find_one(Collection::Orders, &Filter::by_id("o-1"))
            .await
            .unwrap()
            .is_none());
        let archived = store
            .find_one(Collection::OrderArchive, &Filter::by_id("o-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived["status"], "closed");
    }

    #[tokio::test]
    async fn test_sorted_listing() {
        let store = store().await;
        for (id, at) in [("s-1", "2026-01-01"), ("s-2", "2026-03-01"), ("s-3", "2026-02-01")] {
            store
                .insert_one(Collection::CashSessions, json!({"id": id, "opened_at": at, "status": "closed"}))
                .await
                .unwrap();
        }
        let docs = store
            .find_many(Collection::CashSessions, &Filter::new(), Some(&Sort::desc("opened_at")))
            .await
            .unwrap();
        let ids: Vec<&str> = docs.iter().filter_map(|d| d["id"].as_str()).collect();
        assert_eq!(ids, vec!["s-2", "s-3", "s-1"]);
    }
}
