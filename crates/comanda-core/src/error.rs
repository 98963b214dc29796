//! # Error Types
//!
//! Domain-specific error types for comanda-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  comanda-core errors (this file)                                        │
//! │  ├── CoreError        - Lifecycle / business rule violations            │
//! │  └── ValidationError  - Input validation failures                       │
//! │                                                                         │
//! │  comanda-db errors (separate crate)                                     │
//! │  └── StoreError       - Entity store failures                           │
//! │                                                                         │
//! │  comanda-engine errors                                                  │
//! │  └── EngineError      - What callers see, with a machine-readable kind  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError ─┐                                   │
//! │                        StoreError ──┴─► EngineError → caller            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::auth::{Action, Role};

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations detected without touching storage.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Referenced table / order / session does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A uniqueness invariant would be violated.
    ///
    /// ## When This Occurs
    /// - Opening a table that already has an open tab
    /// - Opening a cash session while another one is open
    /// - Removing a line item that is already (partly) paid
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is not legal in the current lifecycle state.
    ///
    /// ## When This Occurs
    /// - Adding items to a closed order
    /// - Closing an order that still has a balance (without force)
    /// - Paying an order that is already fully paid
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed amount, unknown payment method, bad change value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation needs an open cash session and there is none.
    #[error("No cash session is open")]
    NoActiveSession,

    /// The caller's role may not perform the action.
    #[error("Role {role} may not {action}")]
    Forbidden { role: Role, action: Action },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any business logic runs, and always before any write.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} cannot be negative")]
    Negative { field: String },

    /// Invalid format (e.g., invalid UUID, bad decimal).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::not_found("Order", "abc");
        assert_eq!(err.to_string(), "Order not found: abc");

        let err = CoreError::Forbidden {
            role: Role::Waiter,
            action: Action::OpenSession,
        };
        assert_eq!(err.to_string(), "Role waiter may not open a cash session");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "table number".to_string(),
        };
        assert_eq!(err.to_string(), "table number is required");

        let err = ValidationError::Negative {
            field: "opening float".to_string(),
        };
        assert_eq!(err.to_string(), "opening float cannot be negative");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::MustBePositive {
            field: "amount".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
