//! # Domain Types
//!
//! Documents stored in the entity store and the values they carry.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌─────────────────┐  number   ┌─────────────────┐                      │
//! │  │     Table       │◄──────────│     Order       │  (one open per table)│
//! │  │  ─────────────  │           │  ─────────────  │                      │
//! │  │  number "05"    │           │  items[]        │──► LineItem          │
//! │  │  status         │           │  payments[]     │──► Payment           │
//! │  │  capacity       │           │  total / paid   │                      │
//! │  └─────────────────┘           └───────┬─────────┘                      │
//! │                                        │ close (move)                   │
//! │                                        ▼                                │
//! │                                ┌─────────────────┐                      │
//! │                                │  ArchivedOrder  │                      │
//! │                                └─────────────────┘                      │
//! │                                                                         │
//! │  ┌─────────────────┐  payment_id   ┌─────────────────┐                  │
//! │  │  CashSession    │──────────────►│  CashMovement   │                  │
//! │  │  (one open)     │  movements[]  │  sale / outflow │                  │
//! │  └─────────────────┘               └─────────────────┘                  │
//! │                                                                         │
//! │  Discrepancy: a payment that never reached a session                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every document carries `id` (UUID v4) and `version`, the counter used for
//! compare-and-swap writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::money::Money;

/// Fresh UUID v4 string for a new document.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Table
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    #[default]
    Free,
    Occupied,
    Reserved,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Free => "free",
            TableStatus::Occupied => "occupied",
            TableStatus::Reserved => "reserved",
        }
    }
}

/// A physical table on the floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Table {
    pub id: String,

    /// Canonical number (see `table_number`).
    pub number: String,

    pub display_name: String,

    pub capacity: u32,

    /// `Occupied` exactly while an open order exists for `number`.
    pub status: TableStatus,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    pub version: u64,
}

impl Table {
    /// New free table with a canonical `number`.
    pub fn new(number: String, display_name: String, capacity: u32) -> Self {
        let now = Utc::now();
        Table {
            id: new_id(),
            number,
            display_name,
            capacity,
            status: TableStatus::Free,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

// =============================================================================
// Line Items
// =============================================================================

/// Item as submitted by the waiter's terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewLineItem {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    #[serde(default)]
    pub note: Option<String>,
}

/// A line on the tab. Name and price are frozen when the item is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub note: Option<String>,
    #[ts(as = "String")]
    pub added_at: DateTime<Utc>,
}

impl LineItem {
    pub fn from_new(item: NewLineItem, at: DateTime<Utc>) -> Self {
        LineItem {
            product_id: item.product_id,
            name: item.name.trim().to_string(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            note: item.note.filter(|n| !n.trim().is_empty()),
            added_at: at,
        }
    }

    /// unit_price × quantity
    #[inline]
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply_quantity(self.quantity)
    }
}

// =============================================================================
// Payment
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Notes and coins; the only method that can produce change.
    Cash,
    /// Debit or credit on an external terminal.
    Card,
    /// Instant bank transfer.
    Pix,
    Other,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [
        PaymentMethod::Cash,
        PaymentMethod::Card,
        PaymentMethod::Pix,
        PaymentMethod::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Pix => "pix",
            PaymentMethod::Other => "other",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        PaymentMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == lowered)
            .ok_or_else(|| ValidationError::NotAllowed {
                field: "payment method".to_string(),
                allowed: PaymentMethod::ALL
                    .iter()
                    .map(|m| m.as_str().to_string())
                    .collect(),
            })
    }
}

/// One accepted payment entry. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Payment {
    pub id: String,
    pub method: PaymentMethod,

    /// What the payer handed over. Negative on reversals.
    pub amount: Money,

    /// Processor fee, informational only.
    pub fee: Money,

    pub change_given: Money,

    /// amount − change_given; what counts towards the order.
    pub net: Money,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,

    pub payer_reference: Option<String>,

    /// Cash session the payment was routed to, if any.
    pub session_id: Option<String>,

    /// Set when no session was open at settlement time.
    pub unreconciled: bool,

    pub recorded_by: String,

    /// Id of the payment this entry cancels.
    pub reverses: Option<String>,
}

impl Payment {
    #[inline]
    pub fn is_reversal(&self) -> bool {
        self.reverses.is_some()
    }
}

// =============================================================================
// Order
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Open,
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
        }
    }
}

/// The tab (comanda) for one seating at a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Order {
    pub id: String,

    /// Canonical table number.
    pub table_number: String,

    pub items: Vec<LineItem>,

    /// Σ line totals. Recomputed on every item change.
    pub total: Money,

    pub status: OrderStatus,

    pub payments: Vec<Payment>,

    /// Σ payment nets.
    pub amount_paid: Money,

    pub opened_by: String,

    pub guests: Option<u32>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,

    pub version: u64,
}

impl Order {
    /// Empty open tab for a canonical table number.
    pub fn open(table_number: String, opened_by: String, guests: Option<u32>) -> Self {
        let now = Utc::now();
        Order {
            id: new_id(),
            table_number,
            items: Vec::new(),
            total: Money::zero(),
            status: OrderStatus::Open,
            payments: Vec::new(),
            amount_paid: Money::zero(),
            opened_by,
            guests,
            created_at: now,
            updated_at: now,
            closed_at: None,
            version: 0,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn recompute_total(&mut self) {
        self.total = self.items.iter().map(LineItem::line_total).sum();
    }

    pub fn recompute_paid(&mut self) {
        self.amount_paid = self.payments.iter().map(|p| p.net).sum();
    }

    /// max(total − amount_paid, 0)
    pub fn remaining(&self) -> Money {
        (self.total - self.amount_paid).clamp_non_negative()
    }

    pub fn is_fully_paid(&self) -> bool {
        self.amount_paid >= self.total
    }

    /// Paid amount attributed to each line, first line first.
    ///
    /// ```text
    ///  amount_paid = 60.00
    ///  line 0: 50.00 ──► 50.00 paid
    ///  line 1: 30.00 ──► 10.00 paid
    ///  line 2: 20.00 ──►  0.00 paid
    /// ```
    pub fn line_paid_amounts(&self) -> Vec<Money> {
        let mut left = self.amount_paid.clamp_non_negative();
        self.items
            .iter()
            .map(|item| {
                let line = item.line_total();
                let covered = if left >= line { line } else { left };
                left -= covered;
                covered
            })
            .collect()
    }

    /// True when any part of the line at `index` is covered by payments.
    pub fn line_is_paid(&self, index: usize) -> bool {
        self.line_paid_amounts()
            .get(index)
            .map(|paid| paid.is_positive())
            .unwrap_or(false)
    }

    pub fn find_payment(&self, payment_id: &str) -> Option<&Payment> {
        self.payments.iter().find(|p| p.id == payment_id)
    }
}

/// A closed order, frozen in the archive under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ArchivedOrder {
    #[serde(flatten)]
    pub order: Order,

    pub closed_by: String,

    pub forced: bool,

    /// Unpaid residual recorded when a supervisor force-closes.
    pub discrepancy_note: Option<String>,

    #[ts(as = "String")]
    pub archived_at: DateTime<Utc>,
}

// =============================================================================
// Cash Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

/// How the counted drawer compares to the expected balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum VarianceStatus {
    Ok,
    Over,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Sale,
    Outflow,
}

/// One entry in the session's drawer log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CashMovement {
    pub id: String,
    pub kind: MovementKind,
    pub amount: Money,
    pub reason: Option<String>,
    pub order_id: Option<String>,
    /// Present on sales; makes mirroring idempotent.
    pub payment_id: Option<String>,
    pub recorded_by: String,
    #[ts(as = "String")]
    pub at: DateTime<Utc>,
}

/// One register shift (caixa), from open to close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CashSession {
    pub id: String,
    pub status: SessionStatus,

    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    pub opened_by: String,
    pub opening_float: Money,

    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub closing_count: Option<Money>,

    pub total_sales: Money,
    pub total_outflows: Money,

    pub expected_balance: Option<Money>,
    pub variance: Option<Money>,
    pub variance_status: Option<VarianceStatus>,

    pub note: Option<String>,

    pub movements: Vec<CashMovement>,

    pub version: u64,
}

impl CashSession {
    pub fn open(opening_float: Money, opened_by: String) -> Self {
        CashSession {
            id: new_id(),
            status: SessionStatus::Open,
            opened_at: Utc::now(),
            opened_by,
            opening_float,
            closed_at: None,
            closed_by: None,
            closing_count: None,
            total_sales: Money::zero(),
            total_outflows: Money::zero(),
            expected_balance: None,
            variance: None,
            variance_status: None,
            note: None,
            movements: Vec::new(),
            version: 0,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// opening_float + total_sales − total_outflows
    pub fn current_balance(&self) -> Money {
        self.opening_float + self.total_sales - self.total_outflows
    }

    pub fn has_sale_for(&self, payment_id: &str) -> bool {
        self.movements
            .iter()
            .any(|m| m.kind == MovementKind::Sale && m.payment_id.as_deref() == Some(payment_id))
    }
}

/// Read-only view of the open session for the register screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SessionSummary {
    pub session_id: String,
    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    pub opened_by: String,
    pub opening_float: Money,
    pub total_sales: Money,
    pub total_outflows: Money,
    pub current_balance: Money,
    pub sale_count: usize,
    pub outflow_count: usize,
}

impl From<&CashSession> for SessionSummary {
    fn from(session: &CashSession) -> Self {
        let count = |kind: MovementKind| session.movements.iter().filter(|m| m.kind == kind).count();
        SessionSummary {
            session_id: session.id.clone(),
            opened_at: session.opened_at,
            opened_by: session.opened_by.clone(),
            opening_float: session.opening_float,
            total_sales: session.total_sales,
            total_outflows: session.total_outflows,
            current_balance: session.current_balance(),
            sale_count: count(MovementKind::Sale),
            outflow_count: count(MovementKind::Outflow),
        }
    }
}

// =============================================================================
// Discrepancy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Payment settled while no register was open.
    NoActiveSession,
    /// Order committed but the session write failed.
    SessionWriteFailed,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::NoActiveSession => "no_active_session",
            DiscrepancyKind::SessionWriteFailed => "session_write_failed",
        }
    }
}

/// A payment waiting for a human (or the reconciliation job) to route it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Discrepancy {
    pub id: String,
    pub kind: DiscrepancyKind,
    pub order_id: String,
    pub payment_id: String,
    pub amount: Money,
    pub session_id: Option<String>,
    pub reason: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub version: u64,
}

impl Discrepancy {
    pub fn new(
        kind: DiscrepancyKind,
        order_id: String,
        payment_id: String,
        amount: Money,
        session_id: Option<String>,
        reason: String,
    ) -> Self {
        Discrepancy {
            id: new_id(),
            kind,
            order_id,
            payment_id,
            amount,
            session_id,
            reason,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution: None,
            version: 0,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn line(cents: i64, qty: i64) -> LineItem {
        LineItem {
            product_id: "p".to_string(),
            name: "Item".to_string(),
            quantity: qty,
            unit_price: Money::from_cents(cents),
            note: None,
            added_at: Utc::now(),
        }
    }

    #[test]
    fn test_order_totals() {
        let mut order = Order::open("05".to_string(), "u-1".to_string(), Some(4));
        assert!(order.total.is_zero());
        assert!(order.is_fully_paid());

        order.items.push(line(2500, 2));
        order.items.push(line(350, 1));
        order.recompute_total();
        assert_eq!(order.total.cents(), 5350);
        assert_eq!(order.remaining().cents(), 5350);
    }

    #[test]
    fn test_paid_allocation_is_first_line_first() {
        let mut order = Order::open("05".to_string(), "u-1".to_string(), None);
        order.items = vec![line(5000, 1), line(3000, 1), line(2000, 1)];
        order.recompute_total();
        order.amount_paid = Money::from_cents(6000);

        let paid: Vec<i64> = order.line_paid_amounts().iter().map(Money::cents).collect();
        assert_eq!(paid, vec![5000, 1000, 0]);
        assert!(order.line_is_paid(0));
        assert!(order.line_is_paid(1));
        assert!(!order.line_is_paid(2));
        assert!(!order.line_is_paid(7));
    }

    #[test]
    fn test_payment_method_parsing() {
        assert_eq!("PIX".parse::<PaymentMethod>().unwrap(), PaymentMethod::Pix);
        assert_eq!(" cash".parse::<PaymentMethod>().unwrap(), PaymentMethod::Cash);
        assert!("voucher".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_session_balance_and_summary() {
        let mut session = CashSession::open(Money::from_cents(10000), "u-1".to_string());
        session.total_sales = Money::from_cents(5000);
        session.total_outflows = Money::from_cents(1500);
        assert_eq!(session.current_balance().cents(), 13500);

        let summary = SessionSummary::from(&session);
        assert_eq!(summary.current_balance.cents(), 13500);
        assert_eq!(summary.sale_count, 0);
    }

    #[test]
    fn test_archived_order_flattens_order_fields() {
        let order = Order::open("07".to_string(), "u-1".to_string(), None);
        let archived = ArchivedOrder {
            order: order.clone(),
            closed_by: "u-2".to_string(),
            forced: false,
            discrepancy_note: None,
            archived_at: Utc::now(),
        };

        let value = serde_json::to_value(&archived).unwrap();
        assert_eq!(value["id"], serde_json::json!(order.id));
        assert_eq!(value["table_number"], "07");

        let back: ArchivedOrder = serde_json::from_value(value).unwrap();
        assert_eq!(back.order.id, order.id);
    }

    #[test]
    fn test_enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(DiscrepancyKind::SessionWriteFailed).unwrap(),
            "session_write_failed"
        );
        assert_eq!(serde_json::to_value(TableStatus::Occupied).unwrap(), "occupied");
    }
}
