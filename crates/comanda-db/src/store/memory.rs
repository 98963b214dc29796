//! # In-Memory Store
//!
//! `EntityStore` over a `tokio::sync::RwLock`. Every mutation runs under the
//! write lock, so each operation (including `move_one`) is atomic. Used by
//! the engine's tests and by demos that don't want a database file.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::trace;

use super::{
    document_id, merge_patch, upsert_document, Collection, Document, EntityStore, Filter, Sort,
    UpdateOptions, UpdateResult,
};
use crate::error::{StoreError, StoreResult};

type Collections = HashMap<Collection, BTreeMap<String, Document>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of documents in `collection`.
    pub async fn count(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

fn first_match<'a>(
    docs: Option<&'a BTreeMap<String, Document>>,
    filter: &Filter,
) -> Option<(&'a String, &'a Document)> {
    let docs = docs?;
    if let Some(id) = filter.id() {
        return docs.get_key_value(id).filter(|(_, doc)| filter.matches(doc));
    }
    docs.iter().find(|(_, doc)| filter.matches(doc))
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_one(&self, collection: Collection, filter: &Filter) -> StoreResult<Option<Document>> {
        filter.validate()?;
        let guard = self.collections.read().await;
        Ok(first_match(guard.get(&collection), filter).map(|(_, doc)| doc.clone()))
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> StoreResult<Vec<Document>> {
        filter.validate()?;
        let guard = self.collections.read().await;
        let mut docs: Vec<Document> = guard
            .get(&collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();

        if let Some(sort) = sort {
            super::validate_field_name(&sort.field)?;
            docs.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(docs)
    }

    async fn insert_one(&self, collection: Collection, doc: Document) -> StoreResult<()> {
        let id = document_id(&doc)?;
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection).or_default();
        if docs.contains_key(&id) {
            return Err(StoreError::duplicate(collection.as_str(), id));
        }
        trace!(%collection, %id, "insert");
        docs.insert(id, doc);
        Ok(())
    }

    async fn insert_one_unless(
        &self,
        collection: Collection,
        doc: Document,
        conflict: &Filter,
    ) -> StoreResult<bool> {
        conflict.validate()?;
        let id = document_id(&doc)?;
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection).or_default();
        if docs.contains_key(&id) || docs.values().any(|d| conflict.matches(d)) {
            return Ok(false);
        }
        docs.insert(id, doc);
        Ok(true)
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: Document,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        filter.validate()?;
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection).or_default();

        let key = first_match(Some(&*docs), filter).map(|(key, _)| key.clone());
        if let Some(key) = key {
            if let Some(doc) = docs.get_mut(&key) {
                merge_patch(doc, &patch);
                // The id is the key; a patch can't move the document
                if let Some(map) = doc.as_object_mut() {
                    map.insert("id".to_string(), key.clone().into());
                }
            }
            return Ok(UpdateResult {
                matched: 1,
                upserted: false,
            });
        }

        if !options.upsert {
            return Ok(UpdateResult::default());
        }

        let doc = upsert_document(filter, &patch)?;
        let id = document_id(&doc)?;
        if docs.contains_key(&id) {
            return Ok(UpdateResult::default());
        }
        docs.insert(id, doc);
        Ok(UpdateResult {
            matched: 0,
            upserted: true,
        })
    }

    async fn delete_one(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        filter.validate()?;
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(&collection) else {
            return Ok(0);
        };
        let key = first_match(Some(&*docs), filter).map(|(key, _)| key.clone());
        Ok(match key {
            Some(key) => {
                docs.remove(&key);
                1
            }
            None => 0,
        })
    }

    async fn move_one(
        &self,
        from: Collection,
        to: Collection,
        filter: &Filter,
        doc: Document,
    ) -> StoreResult<bool> {
        filter.validate()?;
        let id = document_id(&doc)?;
        let mut guard = self.collections.write().await;

        let key = first_match(guard.get(&from), filter).map(|(key, _)| key.clone());
        let Some(key) = key else {
            return Ok(false);
        };

        if let Some(source) = guard.get_mut(&from) {
            source.remove(&key);
        }
        guard.entry(to).or_default().entry(id).or_insert(doc);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryStore::new();
        store
            .insert_one(Collection::Tables, json!({"id": "t-1", "number": "05"}))
            .await
            .unwrap();

        let found = store
            .find_one(Collection::Tables, &Filter::new().eq("number", "05"))
            .await
            .unwrap();
        assert_eq!(found.unwrap()["id"], "t-1");

        let err = store
            .insert_one(Collection::Tables, json!({"id": "t-1", "number": "06"}))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_insert_unless() {
        let store = MemoryStore::new();
        let open_on_five = Filter::new().eq("table_number", "05").eq("status", "open");

        let first = store
            .insert_one_unless(
                Collection::Orders,
                json!({"id": "o-1", "table_number": "05", "status": "open"}),
                &open_on_five,
            )
            .await
            .unwrap();
        let second = store
            .insert_one_unless(
                Collection::Orders,
                json!({"id": "o-2", "table_number": "05", "status": "open"}),
                &open_on_five,
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(store.count(Collection::Orders).await, 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_update() {
        let store = MemoryStore::new();
        store
            .insert_one(Collection::Orders, json!({"id": "o-1", "version": 0, "total": 0}))
            .await
            .unwrap();

        let cas = Filter::by_id("o-1").eq("version", 0);
        let first = store
            .update_one(Collection::Orders, &cas, json!({"version": 1, "total": 500}), UpdateOptions::default())
            .await
            .unwrap();
        let stale = store
            .update_one(Collection::Orders, &cas, json!({"version": 1, "total": 900}), UpdateOptions::default())
            .await
            .unwrap();

        assert_eq!(first.matched, 1);
        assert_eq!(stale.matched, 0);

        let doc = store
            .find_one(Collection::Orders, &Filter::by_id("o-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["total"], 500);
    }

    #[tokio::test]
    async fn test_upsert() {
        let store = MemoryStore::new();
        let result = store
            .update_one(
                Collection::Tables,
                &Filter::by_id("t-9"),
                json!({"number": "09", "status": "free"}),
                UpdateOptions::upsert(),
            )
            .await
            .unwrap();
        assert!(result.upserted);

        let doc = store
            .find_one(Collection::Tables, &Filter::by_id("t-9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["number"], "09");
    }

    #[tokio::test]
    async fn test_move_is_atomic() {
        let store = MemoryStore::new();
        store
            .insert_one(Collection::Orders, json!({"id": "o-1", "status": "open"}))
            .await
            .unwrap();

        let moved = store
            .move_one(
                Collection::Orders,
                Collection::OrderArchive,
                &Filter::by_id("o-1"),
                json!({"id": "o-1", "status": "closed"}),
            )
            .await
            .unwrap();
        assert!(moved);
        assert_eq!(store.count(Collection::Orders).await, 0);
        assert_eq!(store.count(Collection::OrderArchive).await, 1);

        let again = store
            .move_one(
                Collection::Orders,
                Collection::OrderArchive,
                &Filter::by_id("o-1"),
                json!({"id": "o-1", "status": "closed"}),
            )
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn test_find_many_sorted() {
        let store = MemoryStore::new();
        for (id, at) in [("s-1", "2026-01-01"), ("s-2", "2026-03-01"), ("s-3", "2026-02-01")] {
            store
                .insert_one(Collection::CashSessions, json!({"id": id, "opened_at": at}))
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
