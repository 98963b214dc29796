//! # Reconciliation Job
//!
//! Repairs what a partially committed write can leave behind.
//!
//! ## What It Repairs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Reconciliation Pass                              │
//! │                                                                         │
//! │  1. repair_archive_duplicates                                           │
//! │     order id in BOTH orders and order_archive                           │
//! │        ──► delete the active copy (archive wins) ──► free the table     │
//! │                                                                         │
//! │  2. retry_session_mirrors                                               │
//! │     session_write_failed items whose session is still open              │
//! │        ──► record_sale again (idempotent per payment) ──► resolved      │
//! │                                                                         │
//! │  3. recover_unmirrored_payments                                         │
//! │     payment routed to a session that holds no sale for it and has no    │
//! │     queue item (crash between order write and mirror, failed queue)     │
//! │        session open   ──► record_sale                                   │
//! │        session closed ──► queue session_write_failed                    │
//! │                                                                         │
//! │  4. sync_table_statuses                                                 │
//! │     occupied without an open order ──► free                             │
//! │     free/reserved with an open order ──► occupied                       │
//! │                                                                         │
//! │  no_active_session items are never routed automatically; a manager     │
//! │  resolves them with a note.                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every step is idempotent, so the job can run on a timer or by hand
//! (`comanda-reconcile`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use ts_rs::TS;

use comanda_core::validation::validate_reason;
use comanda_core::{
    authorize, Action, ArchivedOrder, CashSession, Discrepancy, DiscrepancyKind, Identity, Order,
    OrderStatus, Payment, Table, TableStatus,
};
use comanda_db::{to_document, Collection, EntityStore, Filter, Sort};

use crate::cash::{CashSessionManager, SaleReference};
use crate::docs;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::tables::TableRegistry;
use crate::EngineSettings;

/// Recorded as `recorded_by` on sales the job mirrors.
pub const RECONCILIATION_ACTOR: &str = "reconciliation";

/// What one `run()` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReconciliationReport {
    /// Order ids removed from the active set.
    pub duplicates_removed: Vec<String>,

    /// Discrepancy ids resolved by re-mirroring.
    pub mirrors_retried: Vec<String>,

    /// Payment ids found missing from their session and recorded there.
    pub payments_remirrored: Vec<String>,

    /// Table numbers whose status was corrected.
    pub tables_resynced: Vec<String>,

    /// Unresolved discrepancies left after the pass.
    pub open_discrepancies: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates_removed.is_empty()
            && self.mirrors_retried.is_empty()
            && self.payments_remirrored.is_empty()
            && self.tables_resynced.is_empty()
            && self.open_discrepancies == 0
    }
}

/// Reconciliation service.
pub struct ReconciliationJob<S: ?Sized> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: ?Sized> Clone for ReconciliationJob<S> {
    fn clone(&self) -> Self {
        ReconciliationJob {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

impl<S: EntityStore + ?Sized> ReconciliationJob<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        ReconciliationJob { store, settings }
    }

    fn tables(&self) -> TableRegistry<S> {
        TableRegistry::new(Arc::clone(&self.store), self.settings)
    }

    fn cash(&self) -> CashSessionManager<S> {
        CashSessionManager::new(Arc::clone(&self.store), self.settings)
    }

    /// Runs every repair and reports what changed.
    pub async fn run(&self) -> EngineResult<ReconciliationReport> {
        info!(backend = self.store.backend(), "Reconciliation started");

        let duplicates_removed = self.repair_archive_duplicates().await?;
        let mirrors_retried = self.retry_session_mirrors().await?;
        let payments_remirrored = self.recover_unmirrored_payments().await?;
        let tables_resynced = self.sync_table_statuses().await?;
        let open_discrepancies = self.list_discrepancies(false).await?.len();

        let report = ReconciliationReport {
            duplicates_removed,
            mirrors_retried,
            payments_remirrored,
            tables_resynced,
            open_discrepancies,
        };

        info!(
            duplicates = report.duplicates_removed.len(),
            mirrors = report.mirrors_retried.len(),
            remirrored = report.payments_remirrored.len(),
            tables = report.tables_resynced.len(),
            open_discrepancies = report.open_discrepancies,
            "Reconciliation finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Repairs
    // =========================================================================

    /// Deletes active orders that already have an archive copy.
    pub async fn repair_archive_duplicates(&self) -> EngineResult<Vec<String>> {
        let active: Vec<Order> =
            docs::find_all(&*self.store, Collection::Orders, &Filter::new(), None).await?;
        let mut removed = Vec::new();

        for order in active {
            let archived = self
                .store
                .find_one(Collection::OrderArchive, &Filter::by_id(order.id.as_str()))
                .await?;
            if archived.is_none() {
                continue;
            }

            let deleted = self
                .store
                .delete_one(Collection::Orders, &Filter::by_id(order.id.as_str()))
                .await?;
            if deleted == 0 {
                continue;
            }

            warn!(order_id = %order.id, table = %order.table_number, "Removed active copy of archived order");
            self.tables().release_after_close(&order.table_number).await?;
            removed.push(order.id);
        }

        Ok(removed)
    }

    /// Re-mirrors `session_write_failed` payments into their still-open
    /// session. Returns the resolved discrepancy ids.
    pub async fn retry_session_mirrors(&self) -> EngineResult<Vec<String>> {
        let pending: Vec<Discrepancy> = docs::find_all(
            &*self.store,
            Collection::Discrepancies,
            &Filter::new()
                .eq("kind", DiscrepancyKind::SessionWriteFailed.as_str())
                .eq("resolved", false),
            Some(&Sort::asc("created_at")),
        )
        .await?;

        let cash = self.cash();
        let mut resolved = Vec::new();

        for item in pending {
            let Some(session_id) = item.session_id.clone() else {
                continue;
            };

            let reference = SaleReference {
                order_id: item.order_id.clone(),
                payment_id: item.payment_id.clone(),
                recorded_by: RECONCILIATION_ACTOR.to_string(),
            };

            match cash.record_sale_to(&session_id, item.amount, &reference).await {
                Ok(receipt) => {
                    let note = if receipt.applied {
                        format!("mirrored into session {} by reconciliation", session_id)
                    } else {
                        format!("session {} already held the sale", session_id)
                    };
                    self.mark_resolved(&item.id, note).await?;
                    info!(discrepancy_id = %item.id, payment_id = %item.payment_id, "Session mirror repaired");
                    resolved.push(item.id);
                }
                Err(e) if e.kind() == ErrorKind::NoActiveSession => {
                    debug!(discrepancy_id = %item.id, session_id = %session_id, "Session closed, left for manual resolution");
                }
                Err(e) => {
                    warn!(discrepancy_id = %item.id, error = %e, "Session mirror retry failed");
                }
            }
        }

        Ok(resolved)
    }

    /// Finds payments stamped with a session that never received the sale
    /// and has no queue item for it. Re-mirrors into open sessions; queues
    /// `session_write_failed` for closed or missing ones. Returns the
    /// re-mirrored payment ids.
    pub async fn recover_unmirrored_payments(&self) -> EngineResult<Vec<String>> {
        let active: Vec<Order> =
            docs::find_all(&*self.store, Collection::Orders, &Filter::new(), None).await?;
        let archived: Vec<ArchivedOrder> =
            docs::find_all(&*self.store, Collection::OrderArchive, &Filter::new(), None).await?;

        let known: Vec<Discrepancy> = self.list_discrepancies(true).await?;
        let queued: HashSet<String> = known.into_iter().map(|d| d.payment_id).collect();

        let mut seen = HashSet::new();
        let candidates: Vec<(String, Payment)> = archived
            .into_iter()
            .map(|a| a.order)
            .chain(active)
            .flat_map(|order| {
                let order_id = order.id;
                order.payments.into_iter().map(move |p| (order_id.clone(), p))
            })
            .filter(|(_, p)| p.session_id.is_some() && !p.unreconciled && !p.net.is_zero())
            .filter(|(_, p)| !queued.contains(&p.id))
            .filter(|(_, p)| seen.insert(p.id.clone()))
            .collect();

        let cash = self.cash();
        let mut sessions: HashMap<String, Option<CashSession>> = HashMap::new();
        let mut remirrored = Vec::new();

        for (order_id, payment) in candidates {
            let Some(session_id) = payment.session_id.clone() else {
                continue;
            };
            if !sessions.contains_key(&session_id) {
                let session: Option<CashSession> = docs::find(
                    &*self.store,
                    Collection::CashSessions,
                    &Filter::by_id(session_id.as_str()),
                )
                .await?;
                sessions.insert(session_id.clone(), session);
            }

            let (open, recorded) = match sessions.get(&session_id) {
                Some(Some(session)) => (session.is_open(), session.has_sale_for(&payment.id)),
                _ => (false, false),
            };
            if recorded {
                continue;
            }

            if open {
                let reference = SaleReference {
                    order_id: order_id.clone(),
                    payment_id: payment.id.clone(),
                    recorded_by: RECONCILIATION_ACTOR.to_string(),
                };
                match cash.record_sale_to(&session_id, payment.net, &reference).await {
                    Ok(_) => {
                        warn!(%order_id, payment_id = %payment.id, %session_id, "Recorded missing session sale");
                        remirrored.push(payment.id);
                        continue;
                    }
                    Err(e) if e.kind() == ErrorKind::NoActiveSession => {}
                    Err(e) => {
                        warn!(payment_id = %payment.id, error = %e, "Missing session sale not recorded");
                        continue;
                    }
                }
            }

            let item = Discrepancy::new(
                DiscrepancyKind::SessionWriteFailed,
                order_id.clone(),
                payment.id.clone(),
                payment.net,
                Some(session_id.clone()),
                format!("session {} never received the sale", session_id),
            );
            self.store
                .insert_one(Collection::Discrepancies, to_document(&item)?)
                .await?;
            warn!(%order_id, payment_id = %payment.id, %session_id, "Unmirrored payment queued");
        }

        Ok(remirrored)
    }

    /// Makes every table's status agree with whether it has an open order.
    pub async fn sync_table_statuses(&self) -> EngineResult<Vec<String>> {
        let open: Vec<Order> = docs::find_all(
            &*self.store,
            Collection::Orders,
            &Filter::new().eq("status", OrderStatus::Open.as_str()),
            None,
        )
        .await?;
        let occupied: HashSet<String> = open.into_iter().map(|o| o.table_number).collect();

        let tables = self.tables();
        let all: Vec<Table> = tables.list_tables().await?;
        let mut fixed = Vec::new();

        for table in all {
            let has_order = occupied.contains(&table.number);
            let wanted = match (table.status, has_order) {
                (TableStatus::Occupied, false) => TableStatus::Free,
                (TableStatus::Free | TableStatus::Reserved, true) => TableStatus::Occupied,
                _ => continue,
            };

            tables.set_status(&table.number, wanted).await?;
            info!(table = %table.number, from = table.status.as_str(), to = wanted.as_str(), "Table status corrected");
            fixed.push(table.number);
        }

        Ok(fixed)
    }

    // =========================================================================
    // Discrepancy Queue
    // =========================================================================

    /// Queue items, oldest first.
    pub async fn list_discrepancies(&self, include_resolved: bool) -> EngineResult<Vec<Discrepancy>> {
        let filter = if include_resolved {
            Filter::new()
        } else {
            Filter::new().eq("resolved", false)
        };
        docs::find_all(
            &*self.store,
            Collection::Discrepancies,
            &filter,
            Some(&Sort::asc("created_at")),
        )
        .await
    }

    /// Closes a queue item by hand with a note.
    pub async fn resolve_discrepancy(
        &self,
        discrepancy_id: &str,
        note: &str,
        identity: &Identity,
    ) -> EngineResult<Discrepancy> {
        authorize(identity, Action::Reconcile)?;
        let note = validate_reason(note)?;

        let resolved = self
            .mark_resolved(discrepancy_id, format!("{} ({})", note, identity.name))
            .await?;
        info!(discrepancy_id, user = %identity.id, "Discrepancy resolved");
        Ok(resolved)
    }

    async fn mark_resolved(&self, discrepancy_id: &str, resolution: String) -> EngineResult<Discrepancy> {
        for attempt in 1..=self.settings.max_write_retries {
            let mut item: Discrepancy = docs::find(
                &*self.store,
                Collection::Discrepancies,
                &Filter::by_id(discrepancy_id),
            )
            .await?
            .ok_or_else(|| EngineError::not_found("Discrepancy", discrepancy_id))?;

            if item.resolved {
                return Err(EngineError::invalid_state(format!(
                    "discrepancy {} is already resolved",
                    discrepancy_id
                )));
            }

            let read_version = item.version;
            item.resolved = true;
            item.resolved_at = Some(Utc::now());
            item.resolution = Some(resolution.clone());
            item.version = read_version + 1;

            if docs::compare_and_swap(&*self.store, Collection::Discrepancies, discrepancy_id, read_version, &item).await? {
                return Ok(item);
            }
            debug!(discrepancy_id, attempt, "Discrepancy changed concurrently, retrying");
        }

        Err(EngineError::retries_exhausted(
            "Discrepancy",
            discrepancy_id,
            self.settings.max_write_retries,
        ))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
