//! # Validation Module
//!
//! Input checks that run before any business logic and before any write.
//!
//! ## Where It Sits
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  caller input (HTTP layer, already deserialized)                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  THIS MODULE: shape and range checks  ──► ValidationError               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  settlement / session rules           ──► CoreError                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  entity store (CAS, conditional insert, partial unique indexes)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::NewLineItem;
use crate::{MAX_ITEM_QUANTITY, MAX_ORDER_ITEMS};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest free-text reason accepted on outflows, reversals and resolutions.
pub const MAX_REASON_LEN: usize = 500;

/// Largest table a restaurant is expected to seat.
pub const MAX_TABLE_CAPACITY: u32 = 99;

// =============================================================================
// String Validators
// =============================================================================

fn required_text(field: &str, value: &str, max: usize) -> ValidationResult<String> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(value.to_string())
}

/// Validates a table display name ("Varanda 3", "Mesa 12").
///
/// ## Example
/// ```rust
/// use comanda_core::validation::validate_display_name;
///
/// assert_eq!(validate_display_name("  Mesa 5 ").unwrap(), "Mesa 5");
/// assert!(validate_display_name("").is_err());
/// ```
pub fn validate_display_name(name: &str) -> ValidationResult<String> {
    required_text("display name", name, 100)
}

/// Validates a line item name as it will appear on the bill.
pub fn validate_item_name(name: &str) -> ValidationResult<String> {
    required_text("item name", name, 200)
}

/// Validates a free-text reason (outflow, reversal, discrepancy resolution).
pub fn validate_reason(reason: &str) -> ValidationResult<String> {
    required_text("reason", reason, MAX_REASON_LEN)
}

/// Validates a search term.
///
/// ## Rules
/// - Must not be empty after trimming
/// - Maximum 100 characters
///
/// ## Returns
/// The trimmed term.
pub fn validate_search_term(term: &str) -> ValidationResult<String> {
    required_text("search term", term, 100)
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line item quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a unit price. Zero is allowed (courtesy items).
pub fn validate_unit_price(price: Money) -> ValidationResult<()> {
    if price.is_negative() {
        return Err(ValidationError::Negative {
            field: "unit price".to_string(),
        });
    }

    Ok(())
}

/// Validates a tendered payment amount.
pub fn validate_payment_amount(amount: Money) -> ValidationResult<()> {
    if !amount.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "payment amount".to_string(),
        });
    }

    Ok(())
}

/// Validates a cash outflow (sangria) amount.
pub fn validate_outflow_amount(amount: Money) -> ValidationResult<()> {
    if !amount.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "outflow amount".to_string(),
        });
    }

    Ok(())
}

/// Validates the cash placed in the drawer when a session opens.
///
/// ## Example
/// ```rust
/// use comanda_core::money::Money;
/// use comanda_core::validation::validate_opening_float;
///
/// assert!(validate_opening_float(Money::zero()).is_ok());
/// assert!(validate_opening_float(Money::from_cents(-1)).is_err());
/// ```
pub fn validate_opening_float(amount: Money) -> ValidationResult<()> {
    if amount.is_negative() {
        return Err(ValidationError::Negative {
            field: "opening float".to_string(),
        });
    }

    Ok(())
}

/// Validates the cash counted in the drawer when a session closes.
pub fn validate_closing_count(amount: Money) -> ValidationResult<()> {
    if amount.is_negative() {
        return Err(ValidationError::Negative {
            field: "closing count".to_string(),
        });
    }

    Ok(())
}

/// Validates an explicitly requested table capacity.
pub fn validate_capacity(capacity: u32) -> ValidationResult<()> {
    if capacity == 0 || capacity > MAX_TABLE_CAPACITY {
        return Err(ValidationError::OutOfRange {
            field: "capacity".to_string(),
            min: 1,
            max: MAX_TABLE_CAPACITY as i64,
        });
    }

    Ok(())
}

// =============================================================================
// Composite Validators
// =============================================================================

/// Validates a line item before it is appended to an order that already
/// holds `current_items` lines.
pub fn validate_new_item(item: &NewLineItem, current_items: usize) -> ValidationResult<()> {
    if current_items >= MAX_ORDER_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "order items".to_string(),
            min: 0,
            max: MAX_ORDER_ITEMS as i64,
        });
    }

    validate_item_name(&item.name)?;
    validate_quantity(item.quantity)?;
    validate_unit_price(item.unit_price)?;

    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a UUID string format.
///
/// ## Example
/// ```rust
/// use comanda_core::validation::validate_uuid;
///
/// assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("not-a-uuid").is_err());
/// ```
pub fn validate_uuid(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id.trim()).map_err(|_| ValidationError::InvalidFormat {
        field: "id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, quantity: i64, cents: i64) -> NewLineItem {
        NewLineItem {
            product_id: "p-1".to_string(),
            name: name.to_string(),
            quantity,
            unit_price: Money::from_cents(cents),
            note: None,
        }
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(999).is_ok());

        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(1000).is_err());
    }

    #[test]
    fn test_validate_money_inputs() {
        assert!(validate_unit_price(Money::zero()).is_ok());
        assert!(validate_unit_price(Money::from_cents(-1)).is_err());

        assert!(validate_payment_amount(Money::from_cents(1)).is_ok());
        assert!(validate_payment_amount(Money::zero()).is_err());

        assert!(validate_outflow_amount(Money::zero()).is_err());
        assert!(validate_closing_count(Money::zero()).is_ok());
        assert!(validate_closing_count(Money::from_cents(-500)).is_err());
    }

    #[test]
    fn test_validate_reason() {
        assert_eq!(validate_reason(" troco ").unwrap(), "troco");
        assert!(validate_reason("   ").is_err());
        assert!(validate_reason(&"x".repeat(MAX_REASON_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_capacity() {
        assert!(validate_capacity(4).is_ok());
        assert!(validate_capacity(0).is_err());
        assert!(validate_capacity(100).is_err());
    }

    #[test]
    fn test_validate_new_item() {
        assert!(validate_new_item(&item("Feijoada", 2, 2500), 0).is_ok());
        assert!(validate_new_item(&item("", 2, 2500), 0).is_err());
        assert!(validate_new_item(&item("Feijoada", 0, 2500), 0).is_err());
        assert!(validate_new_item(&item("Feijoada", 1, -1), 0).is_err());
        assert!(validate_new_item(&item("Feijoada", 1, 100), MAX_ORDER_ITEMS).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("123").is_err());
    }
}
