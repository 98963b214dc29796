//! Shared fixtures for the service tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use comanda_core::{Identity, Money, NewLineItem, Role};
use comanda_db::{
    Collection, Document, EntityStore, Filter, MemoryStore, Sort, StoreError, StoreResult,
    UpdateOptions, UpdateResult,
};

use crate::{Engine, EngineSettings};

pub(crate) fn admin() -> Identity {
    Identity::new("u-admin", "Ana", Role::Admin)
}

pub(crate) fn manager() -> Identity {
    Identity::new("u-manager", "Bruno", Role::Manager)
}

pub(crate) fn cashier() -> Identity {
    Identity::new("u-cashier", "Carla", Role::Cashier)
}

pub(crate) fn waiter() -> Identity {
    Identity::new("u-waiter", "Davi", Role::Waiter)
}

pub(crate) fn kitchen() -> Identity {
    Identity::new("u-kitchen", "Edu", Role::Kitchen)
}

pub(crate) fn item(name: &str, unit_cents: i64, quantity: i64) -> NewLineItem {
    NewLineItem {
        product_id: format!("p-{}", name.to_lowercase()),
        name: name.to_string(),
        quantity,
        unit_price: Money::from_cents(unit_cents),
        note: None,
    }
}

pub(crate) fn memory_engine() -> Engine<MemoryStore> {
    Engine::new(Arc::new(MemoryStore::new()), EngineSettings::default())
}

pub(crate) fn flaky_engine() -> (Engine<FlakyStore>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    (Engine::new(Arc::clone(&store), EngineSettings::default()), store)
}

// =============================================================================
// Failure Injection
// =============================================================================

/// `MemoryStore` whose deletes or updates can be made to fail per collection.
///
/// It keeps the trait's default two-phase `move_one`, so a failing delete on
/// `orders` leaves the archive copy behind exactly like a backend without
/// transactions would.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing_deletes: Mutex<HashSet<Collection>>,
    failing_updates: Mutex<HashSet<Collection>>,
}

impl FlakyStore {
    pub(crate) fn fail_deletes(&self, collection: Collection) {
        self.failing_deletes.lock().unwrap().insert(collection);
    }

    pub(crate) fn fail_updates(&self, collection: Collection) {
        self.failing_updates.lock().unwrap().insert(collection);
    }

    pub(crate) fn heal(&self) {
        self.failing_deletes.lock().unwrap().clear();
        self.failing_updates.lock().unwrap().clear();
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn injected(collection: Collection) -> StoreError {
        StoreError::QueryFailed(format!("injected failure on {}", collection))
    }
}

#[async_trait]
impl EntityStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn find_one(&self, collection: Collection, filter: &Filter) -> StoreResult<Option<Document>> {
        self.inner.find_one(collection, filter).await
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> StoreResult<Vec<Document>> {
        self.inner.find_many(collection, filter, sort).await
    }

    async fn insert_one(&self, collection: Collection, doc: Document) -> StoreResult<()> {
        self.inner.insert_one(collection, doc).await
    }

    async fn insert_one_unless(
        &self,
        collection: Collection,
        doc: Document,
        conflict: &Filter,
    ) -> StoreResult<bool> {
        self.inner.insert_one_unless(collection, doc, conflict).await
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: Document,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        if self.failing_updates.lock().unwrap().contains(&collection) {
            return Err(Self::injected(collection));
        }
        self.inner.update_one(collection, filter, patch, options).await
    }

    async fn delete_one(&self, collection: Collection, filter: &Filter) -> StoreResult<u64> {
        if self.failing_deletes.lock().unwrap().contains(&collection) {
            return Err(Self::injected(collection));
        }
        self.inner.delete_one(collection, filter).await
    }
}
