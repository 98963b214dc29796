//! Typed access to store documents shared by the services.

use serde::de::DeserializeOwned;
use serde::Serialize;

use comanda_core::{Order, OrderStatus};
use comanda_db::{
    from_document, to_document, Collection, EntityStore, Filter, Sort, StoreError, UpdateOptions,
};

use crate::error::EngineResult;

pub(crate) async fn find<S, T>(store: &S, collection: Collection, filter: &Filter) -> EngineResult<Option<T>>
where
    S: EntityStore + ?Sized,
    T: DeserializeOwned,
{
    match store.find_one(collection, filter).await? {
        Some(doc) => Ok(Some(from_document(doc)?)),
        None => Ok(None),
    }
}

pub(crate) async fn find_all<S, T>(
    store: &S,
    collection: Collection,
    filter: &Filter,
    sort: Option<&Sort>,
) -> EngineResult<Vec<T>>
where
    S: EntityStore + ?Sized,
    T: DeserializeOwned,
{
    let docs = store.find_many(collection, filter, sort).await?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        out.push(from_document(doc)?);
    }
    Ok(out)
}

/// Conditional insert; a unique-index hit counts as "not inserted".
pub(crate) async fn insert_unless<S, T>(
    store: &S,
    collection: Collection,
    value: &T,
    conflict: &Filter,
) -> EngineResult<bool>
where
    S: EntityStore + ?Sized,
    T: Serialize,
{
    match store
        .insert_one_unless(collection, to_document(value)?, conflict)
        .await
    {
        Ok(inserted) => Ok(inserted),
        Err(StoreError::Duplicate { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Replaces the document `id` with `value` if it is still at `read_version`.
///
/// `value` must already carry the bumped version. Returns `false` when
/// someone else wrote first.
pub(crate) async fn compare_and_swap<S, T>(
    store: &S,
    collection: Collection,
    id: &str,
    read_version: u64,
    value: &T,
) -> EngineResult<bool>
where
    S: EntityStore + ?Sized,
    T: Serialize,
{
    let filter = Filter::by_id(id).eq("version", read_version);
    let result = store
        .update_one(collection, &filter, to_document(value)?, UpdateOptions::default())
        .await?;
    Ok(result.matched == 1)
}

/// Matches the open order bound to a canonical table number.
pub(crate) fn open_order_filter(table_number: &str) -> Filter {
    Filter::new()
        .eq("table_number", table_number)
        .eq("status", OrderStatus::Open.as_str())
}

pub(crate) async fn find_open_order<S>(store: &S, table_number: &str) -> EngineResult<Option<Order>>
where
    S: EntityStore + ?Sized,
{
    find(store, Collection::Orders, &open_order_filter(table_number)).await
}
