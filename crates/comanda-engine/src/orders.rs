//! # Order Ledger
//!
//! The tab (comanda) bound to a table: items in, payments in, archive out.
//!
//! ## Order Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Order Lifecycle                                 │
//! │                                                                         │
//! │  open_table ──► OPEN ──► add_item / remove_item  (total recomputed)     │
//! │                  │                                                      │
//! │                  ├──► apply_payment ──► SettlementEngine                │
//! │                  │        (payments + amount_paid, one CAS write)       │
//! │                  │                                                      │
//! │                  ▼                                                      │
//! │            close_order                                                  │
//! │     amount_paid ≥ total ── or ── force (admin | manager)                │
//! │                  │                                                      │
//! │                  ▼                                                      │
//! │   move_one(orders ──► order_archive)   then table ──► FREE              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Archive Move
//! Over SQLite the move is one transaction. Over a store that only has the
//! two-phase default, a failed delete leaves the order in both collections;
//! the caller gets `Unavailable` naming the archive as committed and
//! `ReconciliationJob::repair_archive_duplicates` removes the active copy.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use comanda_core::settlement::SettlementRequest;
use comanda_core::table_number::canonical_table_number;
use comanda_core::validation::{validate_new_item, validate_search_term};
use comanda_core::{
    authorize, Action, ArchivedOrder, Identity, LineItem, NewLineItem, Order, OrderStatus,
    Payment, Table,
};
use comanda_db::{to_document, Collection, EntityStore, Filter, Sort};

use crate::docs;
use crate::error::{EngineError, EngineResult};
use crate::settlement::{SettlementEngine, SettlementOutcome};
use crate::tables::TableRegistry;
use crate::EngineSettings;

/// Order ledger service.
pub struct OrderLedger<S: ?Sized> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: ?Sized> Clone for OrderLedger<S> {
    fn clone(&self) -> Self {
        OrderLedger {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

impl<S: EntityStore + ?Sized> OrderLedger<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        OrderLedger { store, settings }
    }

    fn tables(&self) -> TableRegistry<S> {
        TableRegistry::new(Arc::clone(&self.store), self.settings)
    }

    // =========================================================================
    // Items
    // =========================================================================

    /// Appends a line item and recomputes the total.
    pub async fn add_item(
        &self,
        order_id: &str,
        item: NewLineItem,
        identity: &Identity,
    ) -> EngineResult<Order> {
        authorize(identity, Action::ModifyOrder)?;
        debug!(order_id, product_id = %item.product_id, quantity = item.quantity, "Adding item");

        let order = self
            .update_open(order_id, |order| {
                validate_new_item(&item, order.items.len())?;
                order.items.push(LineItem::from_new(item.clone(), Utc::now()));
                order.recompute_total();
                Ok(())
            })
            .await?;

        info!(order_id, total = %order.total, items = order.items.len(), "Item added");
        Ok(order)
    }

    /// Removes the line at `index` unless payments already cover part of it.
    pub async fn remove_item(
        &self,
        order_id: &str,
        index: usize,
        identity: &Identity,
    ) -> EngineResult<Order> {
        authorize(identity, Action::ModifyOrder)?;
        debug!(order_id, index, "Removing item");

        let order = self
            .update_open(order_id, |order| {
                if index >= order.items.len() {
                    return Err(EngineError::invalid_input(format!(
                        "item index {} out of range, order has {} items",
                        index,
                        order.items.len()
                    )));
                }
                if order.line_is_paid(index) {
                    return Err(EngineError::conflict(format!(
                        "item {} is already paid; record a reversal first",
                        index
                    )));
                }
                order.items.remove(index);
                order.recompute_total();
                Ok(())
            })
            .await?;

        info!(order_id, total = %order.total, "Item removed");
        Ok(order)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Settles payments against the order. See [`SettlementEngine::settle`].
    pub async fn apply_payment(
        &self,
        request: &SettlementRequest,
        identity: &Identity,
    ) -> EngineResult<SettlementOutcome> {
        SettlementEngine::new(Arc::clone(&self.store), self.settings)
            .settle(request, identity)
            .await
    }

    /// Appends `payments` to `order` as read, in one compare-and-swap.
    ///
    /// Returns `None` when the order changed since it was read; the caller
    /// re-reads and re-plans.
    pub async fn persist_payments(
        &self,
        order: &Order,
        payments: Vec<Payment>,
    ) -> EngineResult<Option<Order>> {
        let mut updated = order.clone();
        updated.payments.extend(payments);
        updated.recompute_paid();
        updated.version = order.version + 1;
        updated.updated_at = Utc::now();

        if docs::compare_and_swap(&*self.store, Collection::Orders, &order.id, order.version, &updated).await? {
            Ok(Some(updated))
        } else {
            Ok(None)
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Archives the order and frees its table.
    ///
    /// Without `force` the order must be fully paid. With `force` (admin or
    /// manager) any residual is written to `discrepancy_note`.
    pub async fn close_order(
        &self,
        order_id: &str,
        force: bool,
        identity: &Identity,
    ) -> EngineResult<ArchivedOrder> {
        authorize(identity, Action::CloseOrder)?;
        if force {
            authorize(identity, Action::ForceCloseOrder)?;
        }
        debug!(order_id, force, user = %identity.id, "Closing order");

        for attempt in 1..=self.settings.max_write_retries {
            let order = self.load_open(order_id).await?;

            if !force && !order.is_fully_paid() {
                warn!(order_id, remaining = %order.remaining(), "Close refused, balance outstanding");
                return Err(EngineError::invalid_state(format!(
                    "order {} still owes {}",
                    order_id,
                    order.remaining()
                )));
            }

            let now = Utc::now();
            let residual = order.remaining();
            let discrepancy_note = (force && residual.is_positive())
                .then(|| format!("forced close with {} unpaid", residual));

            let read_version = order.version;
            let table_number = order.table_number.clone();
            let mut closed = order;
            closed.status = OrderStatus::Closed;
            closed.closed_at = Some(now);
            closed.updated_at = now;
            closed.version = read_version + 1;

            let archived = ArchivedOrder {
                order: closed,
                closed_by: identity.id.clone(),
                forced: force,
                discrepancy_note,
                archived_at: now,
            };

            let moved = self
                .store
                .move_one(
                    Collection::Orders,
                    Collection::OrderArchive,
                    &Filter::by_id(order_id).eq("version", read_version),
                    to_document(&archived)?,
                )
                .await?;

            if !moved {
                debug!(order_id, attempt, "Order changed while closing, retrying");
                continue;
            }

            if force && residual.is_positive() {
                warn!(order_id, residual = %residual, user = %identity.id, "Order force-closed with balance");
            }
            info!(order_id, table = %table_number, total = %archived.order.total, "Order archived");

            if let Err(e) = self.tables().release_after_close(&table_number).await {
                return Err(EngineError::unavailable(format!(
                    "order {} was archived but table {} was not freed: {}",
                    order_id, table_number, e
                )));
            }

            return Ok(archived);
        }

        Err(EngineError::retries_exhausted(
            "Order",
            order_id,
            self.settings.max_write_retries,
        ))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The order by id, from the archive or the active set. The archive
    /// copy wins when both exist.
    pub async fn get(&self, order_id: &str) -> EngineResult<Order> {
        if let Some(archived) = self.find_archived(order_id).await? {
            return Ok(archived.order);
        }
        self.find_active(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_id))
    }

    pub async fn find_open_by_table(&self, number: &str) -> EngineResult<Option<Order>> {
        let number = canonical_table_number(number)?;
        self.find_live_open_order(&number).await
    }

    /// Open orders, oldest first.
    pub async fn list_open(&self) -> EngineResult<Vec<Order>> {
        docs::find_all(
            &*self.store,
            Collection::Orders,
            &Filter::new().eq("status", OrderStatus::Open.as_str()),
            Some(&Sort::asc("created_at")),
        )
        .await
    }

    pub async fn find_archived(&self, order_id: &str) -> EngineResult<Option<ArchivedOrder>> {
        docs::find(&*self.store, Collection::OrderArchive, &Filter::by_id(order_id)).await
    }

    /// Finds orders by id, by table number (any spelling), or by a fragment
    /// of the table's display name. Archived orders only match by id.
    pub async fn search(&self, term: &str) -> EngineResult<Vec<Order>> {
        let term = validate_search_term(term)?;
        let mut found = Vec::new();

        if let Some(archived) = self.find_archived(&term).await? {
            found.push(archived.order);
        } else if let Some(order) = self.find_active(&term).await? {
            found.push(order);
        }

        let mut numbers = vec![term.clone()];
        if let Ok(canonical) = canonical_table_number(&term) {
            if canonical != term {
                numbers.push(canonical);
            }
        }

        let needle = term.to_lowercase();
        let tables: Vec<Table> =
            docs::find_all(&*self.store, Collection::Tables, &Filter::new(), None).await?;
        numbers.extend(
            tables
                .into_iter()
                .filter(|t| t.display_name.to_lowercase().contains(&needle))
                .map(|t| t.number),
        );

        for number in numbers {
            if let Some(order) = self.find_live_open_order(&number).await? {
                found.push(order);
            }
        }

        let mut seen = HashSet::new();
        found.retain(|o| seen.insert(o.id.clone()));
        Ok(found)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// The open order on a table, ignoring a leftover copy of an archived one.
    async fn find_live_open_order(&self, number: &str) -> EngineResult<Option<Order>> {
        let Some(order) = docs::find_open_order(&*self.store, number).await? else {
            return Ok(None);
        };
        if self.is_archived(&order.id).await? {
            return Ok(None);
        }
        Ok(Some(order))
    }

    async fn find_active(&self, order_id: &str) -> EngineResult<Option<Order>> {
        docs::find(&*self.store, Collection::Orders, &Filter::by_id(order_id)).await
    }

    async fn is_archived(&self, order_id: &str) -> EngineResult<bool> {
        Ok(self
            .store
            .find_one(Collection::OrderArchive, &Filter::by_id(order_id))
            .await?
            .is_some())
    }

    /// The active order, `InvalidState` when it is already archived.
    ///
    /// The archive is checked first: after a partial move the active copy
    /// is a leftover that reconciliation deletes, so it must not take writes.
    pub(crate) async fn load_open(&self, order_id: &str) -> EngineResult<Order> {
        if self.is_archived(order_id).await? {
            return Err(EngineError::invalid_state(format!(
                "order {} is closed",
                order_id
            )));
        }

        match self.find_active(order_id).await? {
            Some(order) if order.is_open() => Ok(order),
            Some(_) => Err(EngineError::invalid_state(format!(
                "order {} is closed",
                order_id
            ))),
            None => Err(EngineError::not_found("Order", order_id)),
        }
    }

    async fn update_open<F>(&self, order_id: &str, mut mutate: F) -> EngineResult<Order>
    where
        F: FnMut(&mut Order) -> EngineResult<()>,
    {
        for attempt in 1..=self.settings.max_write_retries {
            let mut order = self.load_open(order_id).await?;
            let read_version = order.version;

            mutate(&mut order)?;
            order.version = read_version + 1;
            order.updated_at = Utc::now();

            if docs::compare_and_swap(&*self.store, Collection::Orders, order_id, read_version, &order).await? {
                return Ok(order);
            }
            debug!(order_id, attempt, "Order changed concurrently, retrying");
        }

        Err(EngineError::retries_exhausted(
            "Order",
            order_id,
            self.settings.max_write_retries,
        ))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
