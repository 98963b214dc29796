//! # Engine Error Type
//!
//! The one error every service call returns.
//!
//! ## Error Handling Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Flow in Comanda                                │
//! │                                                                         │
//! │  Caller (HTTP handler, CLI)          Engine                             │
//! │  ──────────────────────────          ──────                             │
//! │                                                                         │
//! │  ledger.close_order(id, false, &who)                                    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Service method                                                  │  │
//! │  │  EngineResult<T>                                                 │  │
//! │  │         │                                                        │  │
//! │  │         ▼                                                        │  │
//! │  │  Store error? ─── StoreError::QueryFailed("...") ──┐            │  │
//! │  │         │                                          │            │  │
//! │  │         ▼                                          ▼            │  │
//! │  │  Rule violated? ─── CoreError::InvalidState ── EngineError ────►│  │
//! │  │         │                                                        │  │
//! │  │         ▼                                                        │  │
//! │  │  Success ──────────────────────────────────────────────────────►│  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  match err.kind() {                                                     │
//! │      ErrorKind::InvalidState => show "order still has a balance",       │
//! │      ErrorKind::Unavailable  => retry after re-querying,                │
//! │      ...                                                                │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Serialization
//! Errors serialize as `{ "kind": "NOT_FOUND", "message": "..." }` so a web
//! layer can hand them to the UI unchanged.

use serde::Serialize;
use thiserror::Error;
use ts_rs::TS;

use comanda_core::{CoreError, ValidationError};
use comanda_db::StoreError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error returned from every engine service.
///
/// ## Serialization
/// ```json
/// {
///   "kind": "CONFLICT",
///   "message": "table 05 already has an open order"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error, TS)]
#[ts(export)]
#[error("{message}")]
pub struct EngineError {
    /// Machine-readable category
    pub kind: ErrorKind,

    /// Human-readable message for display and logs
    pub message: String,
}

/// Error categories.
///
/// `Unreconciled` never comes back as an `Err`: it is the kind carried by a
/// settlement outcome entry whose session mirror did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Unknown table / order / session / discrepancy (404)
    NotFound,

    /// Uniqueness or version conflict (409)
    Conflict,

    /// Operation illegal in the current lifecycle state (422)
    InvalidState,

    /// Malformed or out-of-range input (400)
    InvalidInput,

    /// The operation needs an open cash session
    NoActiveSession,

    /// Payment recorded on the order but not mirrored into a session
    Unreconciled,

    /// Role not allowed to perform the action (403)
    Forbidden,

    /// Store failure; the outcome is unknown or partially committed (503)
    Unavailable,
}

impl EngineError {
    /// Creates a new engine error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Creates a not found error.
    pub fn not_found(entity: &str, id: &str) -> Self {
        EngineError::new(ErrorKind::NotFound, format!("{} not found: {}", entity, id))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        EngineError::new(ErrorKind::Conflict, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        EngineError::new(ErrorKind::InvalidState, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        EngineError::new(ErrorKind::InvalidInput, message)
    }

    /// A store failure. `message` should name whatever already committed.
    pub fn unavailable(message: impl Into<String>) -> Self {
        EngineError::new(ErrorKind::Unavailable, message)
    }

    /// Rejected configuration (bad TOML, out-of-range setting).
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::new(ErrorKind::InvalidInput, format!("configuration: {}", message.into()))
    }

    /// Version conflict that outlived the retry budget.
    pub fn retries_exhausted(entity: &str, id: &str, attempts: u32) -> Self {
        EngineError::conflict(format!(
            "{} {} kept changing; gave up after {} attempts",
            entity, id, attempts
        ))
    }
}

/// Converts store errors to engine errors.
impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { collection, key } => {
                EngineError::conflict(format!("{} already holds {}", collection, key))
            }
            StoreError::ConnectionFailed(e) => {
                tracing::error!("Store connection failed: {}", e);
                EngineError::unavailable("Store connection failed")
            }
            StoreError::MigrationFailed(e) => {
                tracing::error!("Store migration failed: {}", e);
                EngineError::unavailable("Store migration failed")
            }
            StoreError::QueryFailed(e) => {
                // Log the actual error but return a generic message
                tracing::error!("Store query failed: {}", e);
                EngineError::unavailable("Store operation failed")
            }
            StoreError::TransactionFailed(e) => {
                tracing::error!("Store transaction failed: {}", e);
                EngineError::unavailable("Store transaction failed")
            }
            StoreError::PoolExhausted => EngineError::unavailable("Store pool exhausted"),
            StoreError::InvalidDocument(e) => {
                tracing::error!("Stored document rejected: {}", e);
                EngineError::unavailable("Stored document is unreadable")
            }
            StoreError::InvalidFilter(e) => {
                tracing::error!("Store filter rejected: {}", e);
                EngineError::unavailable("Store operation failed")
            }
            StoreError::PartialMove { from, to, id, reason } => {
                tracing::error!(%id, %from, %to, %reason, "Partial move");
                EngineError::unavailable(format!(
                    "{} was written to {} but is still in {}; reconciliation will remove the {} copy",
                    id, to, from, from
                ))
            }
            StoreError::Internal(e) => {
                tracing::error!("Internal store error: {}", e);
                EngineError::unavailable("Store operation failed")
            }
        }
    }
}

/// Converts core errors to engine errors.
impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { entity, id } => EngineError::not_found(&entity, &id),
            CoreError::Conflict(msg) => EngineError::conflict(msg),
            CoreError::InvalidState(msg) => EngineError::invalid_state(msg),
            CoreError::InvalidInput(msg) => EngineError::invalid_input(msg),
            CoreError::NoActiveSession => {
                EngineError::new(ErrorKind::NoActiveSession, "No cash session is open")
            }
            e @ CoreError::Forbidden { .. } => EngineError::new(ErrorKind::Forbidden, e.to_string()),
            CoreError::Validation(e) => e.into(),
        }
    }
}

/// Converts validation errors to engine errors.
impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        EngineError::invalid_input(err.to_string())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use comanda_core::{Action, Role};

    #[test]
    fn test_core_errors_keep_their_kind() {
        let cases = [
            (CoreError::not_found("Order", "o-1"), ErrorKind::NotFound),
            (CoreError::Conflict("x".into()), ErrorKind::Conflict),
            (CoreError::InvalidState("x".into()), ErrorKind::InvalidState),
            (CoreError::InvalidInput("x".into()), ErrorKind::InvalidInput),
            (CoreError::NoActiveSession, ErrorKind::NoActiveSession),
            (
                CoreError::Forbidden {
                    role: Role::Waiter,
                    action: Action::ForceCloseOrder,
                },
                ErrorKind::Forbidden,
            ),
            (
                CoreError::Validation(ValidationError::Required {
                    field: "reason".into(),
                }),
                ErrorKind::InvalidInput,
            ),
        ];

        for (core, kind) in cases {
            assert_eq!(EngineError::from(core).kind(), kind);
        }
    }

    #[test]
    fn test_store_errors_are_translated() {
        let dup = EngineError::from(StoreError::duplicate("orders", "o-1"));
        assert_eq!(dup.kind(), ErrorKind::Conflict);

        let down = EngineError::from(StoreError::QueryFailed("disk I/O error".into()));
        assert_eq!(down.kind(), ErrorKind::Unavailable);
        assert!(!down.message.contains("disk"));
    }

    #[test]
    fn test_partial_move_names_committed_side() {
        let err = EngineError::from(StoreError::PartialMove {
            from: "orders".into(),
            to: "order_archive".into(),
            id: "o-1".into(),
            reason: "connection reset".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.message.contains("written to order_archive"));
    }

    #[test]
    fn test_serializes_kind_and_message() {
        let err = EngineError::not_found("Table", "07");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "NOT_FOUND");
        assert_eq!(json["message"], "Table not found: 07");
    }
}
