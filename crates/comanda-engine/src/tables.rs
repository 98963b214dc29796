//! # Table Registry
//!
//! Physical tables and whether someone is sitting at them.
//!
//! ## Table Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Table Status                                   │
//! │                                                                         │
//! │             reserve_table                open_table                     │
//! │   ┌──────┐ ─────────────► ┌──────────┐ ───────────► ┌──────────┐       │
//! │   │ FREE │                │ RESERVED │              │ OCCUPIED │       │
//! │   └──────┘ ◄───────────── └──────────┘              └──────────┘       │
//! │      ▲  │  release_reservation                            │             │
//! │      │  └──────────────── open_table ───────────────────►│             │
//! │      └──────── close_order (archive) / close_table ───────┘             │
//! │                                                                         │
//! │   OCCUPIED ⇔ an open order exists for the canonical number              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## One Open Order Per Table
//! `open_table` never reads-then-writes. The new order goes in through
//! `insert_one_unless` with the "open order on this number" filter, so two
//! terminals opening table 5 at once produce exactly one order; the other
//! gets `Conflict`.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use comanda_core::table_number::canonical_table_number;
use comanda_core::validation::{validate_capacity, validate_display_name, validate_search_term};
use comanda_core::{authorize, Action, Identity, Order, Table, TableStatus};
use comanda_db::{Collection, EntityStore, Filter};

use crate::docs;
use crate::error::{EngineError, EngineResult};
use crate::EngineSettings;

/// Table registry service.
pub struct TableRegistry<S: ?Sized> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: ?Sized> Clone for TableRegistry<S> {
    fn clone(&self) -> Self {
        TableRegistry {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

fn default_display_name(number: &str) -> String {
    format!("Mesa {}", number)
}

/// Numeric numbers first in numeric order ("02" < "10" < "123"), then the rest.
fn number_sort_key(number: &str) -> (bool, usize, String) {
    let numeric = number.bytes().all(|b| b.is_ascii_digit());
    (!numeric, number.len(), number.to_string())
}

impl<S: EntityStore + ?Sized> TableRegistry<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        TableRegistry { store, settings }
    }

    // =========================================================================
    // Open / Close
    // =========================================================================

    /// Opens a tab on `number`, registering the table if it is unknown.
    pub async fn open_table(
        &self,
        number: &str,
        capacity: Option<u32>,
        identity: &Identity,
    ) -> EngineResult<Order> {
        self.open_table_for(number, capacity, None, identity).await
    }

    /// `open_table` with a head count recorded on the order.
    pub async fn open_table_for(
        &self,
        number: &str,
        capacity: Option<u32>,
        guests: Option<u32>,
        identity: &Identity,
    ) -> EngineResult<Order> {
        authorize(identity, Action::OpenTable)?;
        let number = canonical_table_number(number)?;
        if let Some(capacity) = capacity {
            validate_capacity(capacity)?;
        }

        debug!(table = %number, user = %identity.id, ?guests, "Opening table");

        self.ensure_registered(&number, capacity).await?;

        let order = Order::open(number.clone(), identity.id.clone(), guests);
        let inserted = docs::insert_unless(
            &*self.store,
            Collection::Orders,
            &order,
            &docs::open_order_filter(&number),
        )
        .await?;

        if !inserted {
            warn!(table = %number, "Table already has an open order");
            return Err(EngineError::conflict(format!(
                "table {} already has an open order",
                number
            )));
        }

        info!(table = %number, order_id = %order.id, "Table opened");

        if let Err(e) = self.set_status(&number, TableStatus::Occupied).await {
            error!(table = %number, order_id = %order.id, error = %e, "Order opened but table not marked occupied");
            return Err(EngineError::unavailable(format!(
                "order {} was opened on table {} but the table status was not updated: {}",
                order.id, number, e
            )));
        }

        Ok(order)
    }

    /// Frees a table whose order has already been closed.
    pub async fn close_table(&self, number: &str, identity: &Identity) -> EngineResult<Table> {
        authorize(identity, Action::CloseTable)?;
        let number = canonical_table_number(number)?;

        if let Some(order) = docs::find_open_order(&*self.store, &number).await? {
            warn!(table = %number, order_id = %order.id, "Close refused, order still open");
            return Err(EngineError::invalid_state(format!(
                "table {} still has open order {}",
                number, order.id
            )));
        }

        let table = self
            .update_table(&number, |table| {
                let changed = table.status != TableStatus::Free;
                table.status = TableStatus::Free;
                Ok(changed)
            })
            .await?;

        info!(table = %number, "Table closed");
        Ok(table)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Finds a table by stored number, canonical number, display-name
    /// fragment or id, in that order.
    pub async fn lookup(&self, term: &str) -> EngineResult<Table> {
        let term = validate_search_term(term)?;

        if let Some(table) = self.find_by_number(&term).await? {
            return Ok(table);
        }

        if let Ok(canonical) = canonical_table_number(&term) {
            if canonical != term {
                if let Some(table) = self.find_by_number(&canonical).await? {
                    return Ok(table);
                }
            }
        }

        let needle = term.to_lowercase();
        if let Some(table) = self
            .list_tables()
            .await?
            .into_iter()
            .find(|t| t.display_name.to_lowercase().contains(&needle))
        {
            return Ok(table);
        }

        if let Some(table) = docs::find(&*self.store, Collection::Tables, &Filter::by_id(term.as_str())).await? {
            return Ok(table);
        }

        Err(EngineError::not_found("Table", &term))
    }

    /// All tables, numeric numbers in numeric order first.
    pub async fn list_tables(&self) -> EngineResult<Vec<Table>> {
        let mut tables: Vec<Table> =
            docs::find_all(&*self.store, Collection::Tables, &Filter::new(), None).await?;
        tables.sort_by_key(|t| number_sort_key(&t.number));
        Ok(tables)
    }

    pub(crate) async fn find_by_number(&self, number: &str) -> EngineResult<Option<Table>> {
        docs::find(&*self.store, Collection::Tables, &Filter::new().eq("number", number)).await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Registers a table up front.
    pub async fn register_table(
        &self,
        number: &str,
        display_name: Option<&str>,
        capacity: Option<u32>,
        identity: &Identity,
    ) -> EngineResult<Table> {
        authorize(identity, Action::RegisterTable)?;
        let number = canonical_table_number(number)?;
        let display_name = match display_name {
            Some(name) => validate_display_name(name)?,
            None => default_display_name(&number),
        };
        let capacity = match capacity {
            Some(capacity) => {
                validate_capacity(capacity)?;
                capacity
            }
            None => self.settings.default_table_capacity,
        };

        let table = Table::new(number.clone(), display_name, capacity);
        let inserted = docs::insert_unless(
            &*self.store,
            Collection::Tables,
            &table,
            &Filter::new().eq("number", number.as_str()),
        )
        .await?;

        if !inserted {
            return Err(EngineError::conflict(format!("table {} already exists", number)));
        }

        info!(table = %number, capacity, "Table registered");
        Ok(table)
    }

    /// Removes the table record. Orders and the archive are left alone.
    pub async fn delete_table(&self, number: &str, identity: &Identity) -> EngineResult<bool> {
        authorize(identity, Action::DeleteTable)?;
        let number = canonical_table_number(number)?;

        let removed = self
            .store
            .delete_one(Collection::Tables, &Filter::new().eq("number", number.as_str()))
            .await?;

        if removed > 0 {
            info!(table = %number, user = %identity.id, "Table deleted");
        } else {
            debug!(table = %number, "Delete found no table");
        }
        Ok(removed > 0)
    }

    pub async fn reserve_table(&self, number: &str, identity: &Identity) -> EngineResult<Table> {
        authorize(identity, Action::ReserveTable)?;
        let number = canonical_table_number(number)?;

        let table = self
            .update_table(&number, |table| match table.status {
                TableStatus::Free => {
                    table.status = TableStatus::Reserved;
                    Ok(true)
                }
                other => Err(EngineError::invalid_state(format!(
                    "table {} is {}, only a free table can be reserved",
                    table.number,
                    other.as_str()
                ))),
            })
            .await?;

        info!(table = %number, "Table reserved");
        Ok(table)
    }

    pub async fn release_reservation(&self, number: &str, identity: &Identity) -> EngineResult<Table> {
        authorize(identity, Action::ReserveTable)?;
        let number = canonical_table_number(number)?;

        let table = self
            .update_table(&number, |table| match table.status {
                TableStatus::Reserved => {
                    table.status = TableStatus::Free;
                    Ok(true)
                }
                other => Err(EngineError::invalid_state(format!(
                    "table {} is {}, not reserved",
                    table.number,
                    other.as_str()
                ))),
            })
            .await?;

        info!(table = %number, "Reservation released");
        Ok(table)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Marks the table free after its order was archived, unless another
    /// open order already holds it. A missing table is not an error.
    pub(crate) async fn release_after_close(&self, number: &str) -> EngineResult<()> {
        if docs::find_open_order(&*self.store, number).await?.is_some() {
            debug!(table = %number, "Table reopened meanwhile, leaving it occupied");
            return Ok(());
        }

        match self
            .update_table(number, |table| {
                let changed = table.status == TableStatus::Occupied;
                if changed {
                    table.status = TableStatus::Free;
                }
                Ok(changed)
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == crate::ErrorKind::NotFound => {
                debug!(table = %number, "Table record gone, nothing to free");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn set_status(&self, number: &str, status: TableStatus) -> EngineResult<Table> {
        self.update_table(number, |table| {
            let changed = table.status != status;
            table.status = status;
            Ok(changed)
        })
        .await
    }

    async fn ensure_registered(&self, number: &str, capacity: Option<u32>) -> EngineResult<Table> {
        if let Some(table) = self.find_by_number(number).await? {
            return Ok(table);
        }

        let table = Table::new(
            number.to_string(),
            default_display_name(number),
            capacity.unwrap_or(self.settings.default_table_capacity),
        );
        let inserted = docs::insert_unless(
            &*self.store,
            Collection::Tables,
            &table,
            &Filter::new().eq("number", number),
        )
        .await?;

        if inserted {
            info!(table = %number, capacity = table.capacity, "Table registered on first open");
            return Ok(table);
        }

        // Another terminal registered it first
        self.find_by_number(number)
            .await?
            .ok_or_else(|| EngineError::not_found("Table", number))
    }

    /// Read-modify-CAS loop. `mutate` returns whether it changed anything;
    /// unchanged tables are not rewritten.
    async fn update_table<F>(&self, number: &str, mutate: F) -> EngineResult<Table>
    where
        F: Fn(&mut Table) -> EngineResult<bool>,
    {
        for attempt in 1..=self.settings.max_write_retries {
            let mut table = self
                .find_by_number(number)
                .await?
                .ok_or_else(|| EngineError::not_found("Table", number))?;

            if !mutate(&mut table)? {
                return Ok(table);
            }

            let read_version = table.version;
            table.version = read_version + 1;
            table.updated_at = Utc::now();

            if docs::compare_and_swap(&*self.store, Collection::Tables, &table.id, read_version, &table).await? {
                return Ok(table);
            }
            debug!(table = %number, attempt, "Table changed concurrently, retrying");
        }

        Err(EngineError::retries_exhausted(
            "Table",
            number,
            self.settings.max_write_retries,
        ))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{admin, kitchen, memory_engine, waiter};
    use crate::ErrorKind;
    use comanda_core::{Money, OrderStatus};

    #[tokio::test]
    async fn test_open_table_registers_and_occupies() {
        let engine = memory_engine();
        let tables = engine.tables();

        let order = tables.open_table("5", Some(4), &waiter()).await.unwrap();
        assert_eq!(order.table_number, "05");
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.total, Money::zero());
        assert!(order.items.is_empty());

        let table = tables.lookup("05").await.unwrap();
        assert_eq!(table.status, TableStatus::Occupied);
        assert_eq!(table.capacity, 4);
        assert_eq!(table.display_name, "Mesa 05");
    }

    #[tokio::test]
    async fn test_second_open_conflicts_for_any_spelling() {
        let engine = memory_engine();
        let tables = engine.tables();

        tables.open_table("5", None, &waiter()).await.unwrap();
        for spelling in ["5", "05", "005", " 5 "] {
            let err = tables.open_table(spelling, None, &waiter()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Conflict, "spelling {:?}", spelling);
        }
    }

    #[tokio::test]
    async fn test_concurrent_open_yields_one_order() {
        let engine = memory_engine();

        let a = {
            let tables = engine.tables();
            tokio::spawn(async move { tables.open_table("5", None, &waiter()).await })
        };
        let b = {
            let tables = engine.tables();
            tokio::spawn(async move { tables.open_table("5", None, &waiter()).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Conflict))
            .count();

        assert_eq!(ok, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(engine.orders().list_open().await.unwrap().len(), 1);
        assert_eq!(engine.tables().list_tables().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_table_can_be_opened() {
        let engine = memory_engine();
        let tables = engine.tables();

        tables.register_table("12", Some("Janela"), Some(2), &admin()).await.unwrap();
        tables.reserve_table("12", &admin()).await.unwrap();

        tables.open_table("12", None, &waiter()).await.unwrap();
        assert_eq!(tables.lookup("12").await.unwrap().status, TableStatus::Occupied);

        let err = tables.reserve_table("12", &admin()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_close_table_requires_no_open_order() {
        let engine = memory_engine();
        let tables = engine.tables();

        let order = tables.open_table("3", None, &waiter()).await.unwrap();
        let err = tables.close_table("3", &waiter()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        engine.orders().close_order(&order.id, false, &waiter()).await.unwrap();
        let table = tables.close_table("03", &waiter()).await.unwrap();
        assert_eq!(table.status, TableStatus::Free);
    }

    #[tokio::test]
    async fn test_lookup_order() {
        let engine = memory_engine();
        let tables = engine.tables();

        let varanda = tables
            .register_table("7", Some("Varanda Norte"), None, &admin())
            .await
            .unwrap();
        tables.register_table("B2", None, None, &admin()).await.unwrap();

        assert_eq!(tables.lookup("07").await.unwrap().number, "07");
        assert_eq!(tables.lookup("7").await.unwrap().number, "07");
        assert_eq!(tables.lookup("b2").await.unwrap().number, "B2");
        assert_eq!(tables.lookup("norte").await.unwrap().number, "07");
        assert_eq!(tables.lookup(&varanda.id).await.unwrap().number, "07");

        let err = tables.lookup("terraço").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_number() {
        let engine = memory_engine();
        let tables = engine.tables();

        tables.register_table("1", None, None, &admin()).await.unwrap();
        let err = tables.register_table("01", None, None, &admin()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = tables.register_table("2", None, Some(0), &admin()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_delete_table_keeps_orders() {
        let engine = memory_engine();
        let tables = engine.tables();

        let order = tables.open_table("9", None, &waiter()).await.unwrap();
        assert!(tables.delete_table("09", &admin()).await.unwrap());
        assert!(!tables.delete_table("09", &admin()).await.unwrap());

        let still_open = engine.orders().find_open_by_table("9").await.unwrap();
        assert_eq!(still_open.unwrap().id, order.id);

        let err = tables.delete_table("10", &waiter()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_list_tables_numeric_order() {
        let engine = memory_engine();
        let tables = engine.tables();

        for number in ["10", "BAR", "2", "123"] {
            tables.register_table(number, None, None, &admin()).await.unwrap();
        }

        let numbers: Vec<String> = tables
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.number)
            .collect();
        assert_eq!(numbers, vec!["02", "10", "123", "BAR"]);
    }

    #[tokio::test]
    async fn test_release_reservation_only_from_reserved() {
        let engine = memory_engine();
        let tables = engine.tables();

        tables.register_table("4", None, None, &admin()).await.unwrap();
        let err = tables.release_reservation("4", &admin()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        tables.reserve_table("4", &admin()).await.unwrap();
        let table = tables.release_reservation("4", &admin()).await.unwrap();
        assert_eq!(table.status, TableStatus::Free);
    }

    #[tokio::test]
    async fn test_kitchen_cannot_open_tables() {
        let engine = memory_engine();
        let err = engine.tables().open_table("1", None, &kitchen()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = engine.tables().open_table("  ", None, &waiter()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
