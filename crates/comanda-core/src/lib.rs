//! # comanda-core: Pure Business Logic for Comanda POS
//!
//! Every rule about tables, tabs (comandas), payments and cash sessions that
//! can be expressed without touching storage lives here.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Comanda POS Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            comanda-engine (services, one call = one unit)        │   │
//! │  │   TableRegistry  OrderLedger  CashSessionManager  Settlement     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ comanda-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌────────────┐ ┌──────────────┐    │   │
//! │  │   │  types   │ │  money   │ │ settlement │ │ table_number │    │   │
//! │  │   │  Order   │ │  Money   │ │  planning  │ │  canonical   │    │   │
//! │  │   │ Session  │ │ parsing  │ │  variance  │ │    form      │    │   │
//! │  │   └──────────┘ └──────────┘ └────────────┘ └──────────────┘    │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 comanda-db (Entity Store contract)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Table, Order, Payment, CashSession, ...)
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//! - [`table_number`] - The one canonical form for table numbers
//! - [`settlement`] - Payment planning against an order
//! - [`session`] - Cash session balance and variance math
//! - [`auth`] - Roles and the per-action authorization matrix
//!
//! ## Example Usage
//!
//! ```rust
//! use comanda_core::money::Money;
//! use comanda_core::table_number::canonical_table_number;
//!
//! let price = Money::parse("25.00").unwrap();
//! assert_eq!((price * 2).cents(), 5000);
//!
//! assert_eq!(canonical_table_number("5").unwrap(), "05");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod error;
pub mod money;
pub mod session;
pub mod settlement;
pub mod table_number;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use auth::{authorize, Action, Identity, Role};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum line items on a single tab.
pub const MAX_ORDER_ITEMS: usize = 200;

/// Maximum quantity of a single line item.
///
/// Catches typing 1000 instead of 10 at the waiter's terminal.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Maximum payment entries accepted in one settlement request.
pub const MAX_PAYMENT_ENTRIES: usize = 20;

/// Seats assumed for a table registered implicitly by `open_table`.
pub const DEFAULT_TABLE_CAPACITY: u32 = 4;
