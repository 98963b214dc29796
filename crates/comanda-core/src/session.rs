//! # Cash Session Math
//!
//! Pure functions behind the register shift: applying movements and the
//! closing variance.
//!
//! ```text
//!   expected = opening_float + total_sales − total_outflows
//!   variance = closing_count − expected
//!
//!   |variance| < 0.01  ──► ok
//!   variance  > 0      ──► over   (more cash than expected)
//!   variance  < 0      ──► short  (cash missing)
//! ```

use chrono::{DateTime, Utc};

use crate::error::{CoreError, CoreResult};
use crate::money::{Money, MONEY_EPSILON};
use crate::types::{new_id, CashMovement, CashSession, MovementKind, SessionStatus, VarianceStatus};

/// Buckets a variance.
pub fn classify_variance(variance: Money) -> VarianceStatus {
    if variance.abs() < MONEY_EPSILON {
        VarianceStatus::Ok
    } else if variance.is_positive() {
        VarianceStatus::Over
    } else {
        VarianceStatus::Short
    }
}

/// Figures frozen onto a session when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClose {
    pub expected_balance: Money,
    pub variance: Money,
    pub variance_status: VarianceStatus,
}

/// Computes the closing figures for `closing_count`.
///
/// ## Example
/// ```rust
/// use comanda_core::money::Money;
/// use comanda_core::session::compute_close;
/// use comanda_core::types::{CashSession, VarianceStatus};
///
/// let mut session = CashSession::open(Money::from_cents(10000), "u-1".into());
/// session.total_sales = Money::from_cents(5000);
///
/// let close = compute_close(&session, Money::from_cents(14500));
/// assert_eq!(close.variance.cents(), -500);
/// assert_eq!(close.variance_status, VarianceStatus::Short);
/// ```
pub fn compute_close(session: &CashSession, closing_count: Money) -> SessionClose {
    let expected_balance = session.current_balance();
    let variance = closing_count - expected_balance;
    SessionClose {
        expected_balance,
        variance,
        variance_status: classify_variance(variance),
    }
}

/// Stamps the closing figures onto the session.
pub fn apply_close(
    session: &mut CashSession,
    closing_count: Money,
    closed_by: String,
    note: Option<String>,
    at: DateTime<Utc>,
) -> CoreResult<SessionClose> {
    if !session.is_open() {
        return Err(CoreError::InvalidState(format!(
            "cash session {} is already closed",
            session.id
        )));
    }

    let close = compute_close(session, closing_count);
    session.status = SessionStatus::Closed;
    session.closed_at = Some(at);
    session.closed_by = Some(closed_by);
    session.closing_count = Some(closing_count);
    session.expected_balance = Some(close.expected_balance);
    session.variance = Some(close.variance);
    session.variance_status = Some(close.variance_status);
    session.note = note;
    Ok(close)
}

/// Sale mirrored from a settled (or reversed) payment.
///
/// Returns `false` without touching the session when a sale for
/// `payment_id` is already recorded.
pub fn apply_sale(
    session: &mut CashSession,
    amount: Money,
    order_id: &str,
    payment_id: &str,
    recorded_by: &str,
    at: DateTime<Utc>,
) -> CoreResult<bool> {
    ensure_open(session)?;
    if session.has_sale_for(payment_id) {
        return Ok(false);
    }

    session.total_sales += amount;
    session.movements.push(CashMovement {
        id: new_id(),
        kind: MovementKind::Sale,
        amount,
        reason: None,
        order_id: Some(order_id.to_string()),
        payment_id: Some(payment_id.to_string()),
        recorded_by: recorded_by.to_string(),
        at,
    });
    Ok(true)
}

/// Cash taken out of the drawer (sangria, supplier paid from the till).
pub fn apply_outflow(
    session: &mut CashSession,
    amount: Money,
    reason: String,
    recorded_by: &str,
    at: DateTime<Utc>,
) -> CoreResult<()> {
    ensure_open(session)?;
    session.total_outflows += amount;
    session.movements.push(CashMovement {
        id: new_id(),
        kind: MovementKind::Outflow,
        amount,
        reason: Some(reason),
        order_id: None,
        payment_id: None,
        recorded_by: recorded_by.to_string(),
        at,
    });
    Ok(())
}

fn ensure_open(session: &CashSession) -> CoreResult<()> {
    if session.is_open() {
        Ok(())
    } else {
        Err(CoreError::NoActiveSession)
    }
}
