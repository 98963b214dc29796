//! # Cash Session Manager
//!
//! One register shift (caixa) at a time: opening float, sales mirrored from
//! settlements, outflows, and the counted close.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Cash Session States                               │
//! │                                                                         │
//! │   (none open) ── open_session(float) ──► OPEN ── close_session(count) ──► CLOSED
//! │                   conditional insert      │                             │
//! │                   (Conflict if open)      ├── record_sale(net)          │
//! │                                           └── record_outflow(amount)    │
//! │                                                                         │
//! │   current_balance = opening_float + total_sales − total_outflows        │
//! │   variance        = closing_count − current_balance                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No component caches "the" open session; every call reads it from the
//! store, and every mutation is a compare-and-swap on its version.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use ts_rs::TS;

use comanda_core::session::{apply_close, apply_outflow, apply_sale};
use comanda_core::validation::{
    validate_closing_count, validate_opening_float, validate_outflow_amount, validate_reason,
};
use comanda_core::{
    authorize, Action, CashSession, Identity, Money, SessionStatus, SessionSummary, VarianceStatus,
};
use comanda_db::{Collection, EntityStore, Filter, Sort};

use crate::docs;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::EngineSettings;

/// What a mirrored sale points back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleReference {
    pub order_id: String,
    pub payment_id: String,
    pub recorded_by: String,
}

/// Result of `record_sale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleReceipt {
    pub session_id: String,

    /// `false` when the payment was already mirrored earlier.
    pub applied: bool,
}

/// Cash session service.
pub struct CashSessionManager<S: ?Sized> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: ?Sized> Clone for CashSessionManager<S> {
    fn clone(&self) -> Self {
        CashSessionManager {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

fn open_session_filter() -> Filter {
    Filter::new().eq("status", SessionStatus::Open.as_str())
}

fn no_active_session() -> EngineError {
    EngineError::new(ErrorKind::NoActiveSession, "No cash session is open")
}

impl<S: EntityStore + ?Sized> CashSessionManager<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        CashSessionManager { store, settings }
    }

    // =========================================================================
    // Open / Close
    // =========================================================================

    /// Opens the register with `opening_float` in the drawer.
    pub async fn open_session(&self, opening_float: Money, identity: &Identity) -> EngineResult<CashSession> {
        authorize(identity, Action::OpenSession)?;
        validate_opening_float(opening_float)?;

        let session = CashSession::open(opening_float, identity.id.clone());
        let inserted = docs::insert_unless(
            &*self.store,
            Collection::CashSessions,
            &session,
            &open_session_filter(),
        )
        .await?;

        if !inserted {
            warn!(user = %identity.id, "Cash session already open");
            return Err(EngineError::conflict("a cash session is already open"));
        }

        info!(session_id = %session.id, float = %opening_float, user = %identity.id, "Cash session opened");
        Ok(session)
    }

    /// Counts the drawer and closes the open session.
    pub async fn close_session(
        &self,
        closing_count: Money,
        identity: &Identity,
        note: Option<&str>,
    ) -> EngineResult<CashSession> {
        authorize(identity, Action::CloseSession)?;
        validate_closing_count(closing_count)?;
        let note = match note.map(str::trim) {
            Some(n) if !n.is_empty() => Some(validate_reason(n)?),
            _ => None,
        };

        let session = self
            .mutate(open_session_filter(), no_active_session, |session| {
                apply_close(session, closing_count, identity.id.clone(), note.clone(), Utc::now())?;
                Ok(true)
            })
            .await?;

        let variance = session.variance.unwrap_or_default();
        match session.variance_status {
            Some(VarianceStatus::Ok) | None => {
                info!(session_id = %session.id, count = %closing_count, "Cash session closed");
            }
            Some(status) => {
                warn!(session_id = %session.id, variance = %variance, ?status, "Cash session closed with variance");
            }
        }
        Ok(session)
    }

    // =========================================================================
    // Movements
    // =========================================================================

    /// Mirrors a settled payment into whichever session is open.
    pub async fn record_sale(&self, amount: Money, reference: &SaleReference) -> EngineResult<SaleReceipt> {
        self.record_sale_with(open_session_filter(), amount, reference).await
    }

    /// Mirrors a payment into a specific session, which must still be open.
    pub async fn record_sale_to(
        &self,
        session_id: &str,
        amount: Money,
        reference: &SaleReference,
    ) -> EngineResult<SaleReceipt> {
        self.record_sale_with(Filter::by_id(session_id), amount, reference).await
    }

    async fn record_sale_with(
        &self,
        filter: Filter,
        amount: Money,
        reference: &SaleReference,
    ) -> EngineResult<SaleReceipt> {
        if amount.is_zero() {
            return Err(EngineError::invalid_input("sale amount must not be zero"));
        }

        let mut applied = false;
        let session = self
            .mutate(filter, no_active_session, |session| {
                applied = apply_sale(
                    session,
                    amount,
                    &reference.order_id,
                    &reference.payment_id,
                    &reference.recorded_by,
                    Utc::now(),
                )?;
                Ok(applied)
            })
            .await?;

        if applied {
            debug!(session_id = %session.id, payment_id = %reference.payment_id, amount = %amount, "Sale recorded");
        } else {
            debug!(session_id = %session.id, payment_id = %reference.payment_id, "Sale already recorded");
        }

        Ok(SaleReceipt {
            session_id: session.id,
            applied,
        })
    }

    /// Cash leaving the drawer. Needs a positive amount and a reason.
    pub async fn record_outflow(
        &self,
        amount: Money,
        reason: &str,
        identity: &Identity,
    ) -> EngineResult<CashSession> {
        authorize(identity, Action::RecordOutflow)?;
        validate_outflow_amount(amount)?;
        let reason = validate_reason(reason)?;

        let session = self
            .mutate(open_session_filter(), no_active_session, |session| {
                apply_outflow(session, amount, reason.clone(), &identity.id, Utc::now())?;
                Ok(true)
            })
            .await?;

        info!(session_id = %session.id, amount = %amount, reason = %reason, "Outflow recorded");
        Ok(session)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn current(&self) -> EngineResult<Option<CashSession>> {
        docs::find(&*self.store, Collection::CashSessions, &open_session_filter()).await
    }

    /// `None` is the ordinary "register closed" state.
    pub async fn current_summary(&self) -> EngineResult<Option<SessionSummary>> {
        Ok(self.current().await?.as_ref().map(SessionSummary::from))
    }

    pub async fn get(&self, session_id: &str) -> EngineResult<CashSession> {
        docs::find(&*self.store, Collection::CashSessions, &Filter::by_id(session_id))
            .await?
            .ok_or_else(|| EngineError::not_found("Cash session", session_id))
    }

    /// Every session, newest first.
    pub async fn list_sessions(&self) -> EngineResult<Vec<CashSession>> {
        docs::find_all(
            &*self.store,
            Collection::CashSessions,
            &Filter::new(),
            Some(&Sort::desc("opened_at")),
        )
        .await
    }

    // =========================================================================
    // Internal
    // =========================================================================

    async fn mutate<F>(
        &self,
        filter: Filter,
        missing: fn() -> EngineError,
        mut apply: F,
    ) -> EngineResult<CashSession>
    where
        F: FnMut(&mut CashSession) -> EngineResult<bool>,
    {
        for attempt in 1..=self.settings.max_write_retries {
            let mut session: CashSession = docs::find(&*self.store, Collection::CashSessions, &filter)
                .await?
                .ok_or_else(missing)?;

            if !apply(&mut session)? {
                return Ok(session);
            }

            let read_version = session.version;
            session.version = read_version + 1;
            let session_id = session.id.clone();

            if docs::compare_and_swap(&*self.store, Collection::CashSessions, &session_id, read_version, &session).await? {
                return Ok(session);
            }
            debug!(session_id = %session_id, attempt, "Session changed concurrently, retrying");
        }

        Err(EngineError::retries_exhausted(
            "Cash session",
            "open",
            self.settings.max_write_retries,
        ))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
