//! # Settlement Planning
//!
//! Decides, without writing anything, what a payment request does to an
//! order. The engine commits the plan with a single compare-and-swap and
//! re-plans from a fresh read if the order changed underneath it.
//!
//! ## Split Payment Walkthrough
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Order total 80.00, already paid 10.00  →  remaining 70.00              │
//! │                                                                         │
//! │  entry 1: card 30.00  → over 0       → net 30.00   remaining 40.00      │
//! │  entry 2: cash 50.00  → over 10.00   → change 10.00, net 40.00          │
//! │                                                   remaining  0.00       │
//! │  entry 3: pix   5.00  → REJECTED (nothing left to pay)                  │
//! │                                                                         │
//! │  Non-cash entries never produce change: card 90.00 above is rejected.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::Money;
use crate::types::{new_id, Order, Payment, PaymentMethod};
use crate::validation::validate_payment_amount;
use crate::MAX_PAYMENT_ENTRIES;

// =============================================================================
// Request Types
// =============================================================================

/// One tender in a settlement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentEntry {
    pub method: PaymentMethod,
    pub amount: Money,
    #[serde(default)]
    pub fee: Option<Money>,
    #[serde(default)]
    pub change_given: Option<Money>,
    #[serde(default)]
    pub payer_reference: Option<String>,
}

impl PaymentEntry {
    pub fn new(method: PaymentMethod, amount: Money) -> Self {
        PaymentEntry {
            method,
            amount,
            fee: None,
            change_given: None,
            payer_reference: None,
        }
    }

    pub fn with_fee(mut self, fee: Money) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn with_change(mut self, change: Money) -> Self {
        self.change_given = Some(change);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.payer_reference = Some(reference.into());
        self
    }
}

/// `{order_id, payments: [...]}` as posted by the register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SettlementRequest {
    pub order_id: String,
    pub payments: Vec<PaymentEntry>,
}

// =============================================================================
// Plan
// =============================================================================

/// A validated entry with its change and net worked out.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPayment {
    pub method: PaymentMethod,
    pub amount: Money,
    pub fee: Money,
    pub change_given: Money,
    pub net: Money,
    pub payer_reference: Option<String>,
}

impl PlannedPayment {
    /// Materializes the payment. Session routing is filled in later.
    pub fn into_payment(self, recorded_by: &str, at: DateTime<Utc>) -> Payment {
        Payment {
            id: new_id(),
            method: self.method,
            amount: self.amount,
            fee: self.fee,
            change_given: self.change_given,
            net: self.net,
            timestamp: at,
            payer_reference: self.payer_reference,
            session_id: None,
            unreconciled: false,
            recorded_by: recorded_by.to_string(),
            reverses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPlan {
    pub remaining_before: Money,
    pub payments: Vec<PlannedPayment>,
    pub change_total: Money,
    pub amount_paid_after: Money,
    pub remaining_after: Money,
}

fn entry_error(index: usize, message: &str) -> CoreError {
    CoreError::InvalidInput(format!("payment entry {}: {}", index + 1, message))
}

fn check_entry_shape(index: usize, entry: &PaymentEntry) -> CoreResult<(Money, Money)> {
    validate_payment_amount(entry.amount).map_err(|e| entry_error(index, &e.to_string()))?;

    let fee = entry.fee.unwrap_or_default();
    if fee.is_negative() || fee > entry.amount {
        return Err(entry_error(index, "fee must be between 0 and the amount"));
    }

    let change = entry.change_given.unwrap_or_default();
    if change.is_negative() || change > entry.amount {
        return Err(entry_error(index, "change must be between 0 and the amount"));
    }

    Ok((fee, change))
}

/// Validates `entries` against `order` and computes every net.
///
/// ## Rules
/// - at least one entry, at most `MAX_PAYMENT_ENTRIES`
/// - every amount > 0; fee and change within `[0, amount]`
/// - the order is open and still has a balance
/// - over-payment beyond the running remaining becomes change, cash only
/// - an entry arriving after the balance reached zero is rejected
///
/// Nothing is partially accepted: any failure rejects the whole request.
pub fn plan_settlement(order: &Order, entries: &[PaymentEntry]) -> CoreResult<SettlementPlan> {
    if entries.is_empty() {
        return Err(ValidationError::Required {
            field: "payments".to_string(),
        }
        .into());
    }
    if entries.len() > MAX_PAYMENT_ENTRIES {
        return Err(ValidationError::OutOfRange {
            field: "payments".to_string(),
            min: 1,
            max: MAX_PAYMENT_ENTRIES as i64,
        }
        .into());
    }

    let shapes = entries
        .iter()
        .enumerate()
        .map(|(i, e)| check_entry_shape(i, e))
        .collect::<CoreResult<Vec<_>>>()?;

    if !order.is_open() {
        return Err(CoreError::InvalidState(format!(
            "order {} is closed",
            order.id
        )));
    }

    let remaining_before = order.remaining();
    if !remaining_before.is_positive() {
        return Err(CoreError::InvalidState(format!(
            "order {} is already fully paid",
            order.id
        )));
    }

    let mut remaining = remaining_before;
    let mut planned = Vec::with_capacity(entries.len());

    for (index, (entry, (fee, requested_change))) in entries.iter().zip(shapes).enumerate() {
        if !remaining.is_positive() {
            return Err(entry_error(index, "the order balance is already covered"));
        }

        let over = (entry.amount - remaining).clamp_non_negative();
        let change_given = requested_change.max(over);

        if change_given.is_positive() && entry.method != PaymentMethod::Cash {
            return Err(entry_error(
                index,
                &format!(
                    "{} cannot exceed the remaining {} (only cash gives change)",
                    entry.method, remaining
                ),
            ));
        }

        let net = entry.amount - change_given;
        if !net.is_positive() {
            return Err(entry_error(index, "change cannot consume the whole amount"));
        }

        remaining -= net;
        planned.push(PlannedPayment {
            method: entry.method,
            amount: entry.amount,
            fee,
            change_given,
            net,
            payer_reference: entry
                .payer_reference
                .as_ref()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        });
    }

    let change_total: Money = planned.iter().map(|p| p.change_given).sum();
    let net_total: Money = planned.iter().map(|p| p.net).sum();

    Ok(SettlementPlan {
        remaining_before,
        payments: planned,
        change_total,
        amount_paid_after: order.amount_paid + net_total,
        remaining_after: remaining,
    })
}

// =============================================================================
// Reversal
// =============================================================================

/// Builds the compensating entry for `payment_id`.
///
/// ## Rules
/// - the order is open
/// - the payment exists, is not itself a reversal, and was not reversed yet
pub fn plan_reversal(
    order: &Order,
    payment_id: &str,
    recorded_by: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> CoreResult<Payment> {
    if !order.is_open() {
        return Err(CoreError::InvalidState(format!(
            "order {} is closed",
            order.id
        )));
    }

    let original = order
        .find_payment(payment_id)
        .ok_or_else(|| CoreError::not_found("Payment", payment_id))?;

    if original.is_reversal() {
        return Err(CoreError::InvalidState(
            "a reversal cannot itself be reversed".to_string(),
        ));
    }

    if order
        .payments
        .iter()
        .any(|p| p.reverses.as_deref() == Some(payment_id))
    {
        return Err(CoreError::Conflict(format!(
            "payment {} was already reversed",
            payment_id
        )));
    }

    Ok(Payment {
        id: new_id(),
        method: original.method,
        amount: -original.net,
        fee: Money::zero(),
        change_given: Money::zero(),
        net: -original.net,
        timestamp: at,
        payer_reference: Some(reason.to_string()),
        session_id: None,
        unreconciled: false,
        recorded_by: recorded_by.to_string(),
        reverses: Some(original.id.clone()),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineItem, OrderStatus};

    fn order_with_total(total_cents: i64, paid_cents: i64) -> Order {
        let mut order = Order::open("05".to_string(), "u-1".to_string(), None);
        order.items.push(LineItem {
            product_id: "p".to_string(),
            name: "Feijoada".to_string(),
            quantity: 1,
            unit_price: Money::from_cents(total_cents),
            note: None,
            added_at: Utc::now(),
        });
        order.recompute_total();
        order.amount_paid = Money::from_cents(paid_cents);
        order
    }

    fn cash(cents: i64) -> PaymentEntry {
        PaymentEntry::new(PaymentMethod::Cash, Money::from_cents(cents))
    }

    fn card(cents: i64) -> PaymentEntry {
        PaymentEntry::new(PaymentMethod::Card, Money::from_cents(cents))
    }

    #[test]
    fn test_cash_overpayment_becomes_change() {
        let order = order_with_total(5000, 0);
        let plan = plan_settlement(&order, &[cash(6000)]).unwrap();

        assert_eq!(plan.payments[0].change_given.cents(), 1000);
        assert_eq!(plan.payments[0].net.cents(), 5000);
        assert_eq!(plan.change_total.cents(), 1000);
        assert_eq!(plan.amount_paid_after.cents(), 5000);
        assert!(plan.remaining_after.is_zero());
    }

    #[test]
    fn test_split_payment_runs_down_remaining() {
        let order = order_with_total(8000, 1000);
        let plan = plan_settlement(&order, &[card(3000), cash(5000)]).unwrap();

        assert_eq!(plan.remaining_before.cents(), 7000);
        assert_eq!(plan.payments[0].net.cents(), 3000);
        assert_eq!(plan.payments[1].change_given.cents(), 1000);
        assert_eq!(plan.payments[1].net.cents(), 4000);
        assert_eq!(plan.amount_paid_after.cents(), 8000);
    }

    #[test]
    fn test_partial_payment_leaves_balance() {
        let order = order_with_total(5000, 0);
        let plan = plan_settlement(&order, &[card(2000)]).unwrap();
        assert_eq!(plan.remaining_after.cents(), 3000);
        assert!(plan.change_total.is_zero());
    }

    #[test]
    fn test_non_cash_overpayment_is_rejected() {
        let order = order_with_total(5000, 0);
        let err = plan_settlement(&order, &[card(6000)]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        let err = plan_settlement(&order, &[card(1000).with_change(Money::from_cents(100))]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_entry_after_balance_covered_is_rejected() {
        let order = order_with_total(5000, 0);
        let err = plan_settlement(&order, &[cash(5000), card(100)]).unwrap_err();
        assert!(err.to_string().contains("payment entry 2"));
    }

    #[test]
    fn test_shape_errors() {
        let order = order_with_total(5000, 0);
        assert!(matches!(
            plan_settlement(&order, &[]),
            Err(CoreError::Validation(_))
        ));
        assert!(plan_settlement(&order, &[cash(0)]).is_err());
        assert!(plan_settlement(&order, &[card(1000).with_fee(Money::from_cents(2000))]).is_err());
        assert!(plan_settlement(&order, &[cash(1000).with_change(Money::from_cents(1000))]).is_err());
    }

    #[test]
    fn test_closed_or_paid_orders_are_invalid_state() {
        let paid = order_with_total(5000, 5000);
        assert!(matches!(
            plan_settlement(&paid, &[cash(100)]),
            Err(CoreError::InvalidState(_))
        ));

        let mut closed = order_with_total(5000, 0);
        closed.status = OrderStatus::Closed;
        assert!(matches!(
            plan_settlement(&closed, &[cash(100)]),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reversal_rules() {
        let mut order = order_with_total(5000, 0);
        let plan = plan_settlement(&order, &[card(2000)]).unwrap();
        let payment = plan.payments[0].clone().into_payment("u-1", Utc::now());
        let original_id = payment.id.clone();
        order.payments.push(payment);
        order.recompute_paid();

        let reversal = plan_reversal(&order, &original_id, "u-2", "wrong card", Utc::now()).unwrap();
        assert_eq!(reversal.net.cents(), -2000);
        assert_eq!(reversal.reverses.as_deref(), Some(original_id.as_str()));

        let reversal_id = reversal.id.clone();
        order.payments.push(reversal);
        order.recompute_paid();
        assert!(order.amount_paid.is_zero());

        assert!(matches!(
            plan_reversal(&order, &original_id, "u-2", "again", Utc::now()),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            plan_reversal(&order, &reversal_id, "u-2", "undo", Utc::now()),
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            plan_reversal(&order, "missing", "u-2", "?", Utc::now()),
            Err(CoreError::NotFound { .. })
        ));
    }
}
