//! # Store Error Types
//!
//! Error types for entity store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)     serde_json::Error                       │
//! │       │                               │                                 │
//! │       ▼                               ▼                                 │
//! │  StoreError (this module) ← Adds context and categorization             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  EngineError (comanda-engine) ← Unavailable / Conflict for callers      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Entity store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A document with the same key (or unique index value) exists.
    ///
    /// ## When This Occurs
    /// - `insert_one` with an id already present in the collection
    /// - Any partial UNIQUE index violation (open order per table, ...)
    #[error("Duplicate in {collection}: {key}")]
    Duplicate { collection: String, key: String },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed to begin or commit.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// A stored body is not valid JSON or doesn't match the expected shape.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// A filter or sort can't be expressed against this backend.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// The two-phase move inserted the destination copy but could not
    /// remove the source. Both copies exist until reconciliation runs.
    ///
    /// ## When This Occurs
    /// - Backend without transactions loses its connection between the
    ///   archive insert and the active delete
    #[error("Move of {id} from {from} to {to} left a duplicate: {reason}")]
    PartialMove {
        from: String,
        to: String,
        id: String,
        reason: String,
    },

    /// Internal store error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Creates a Duplicate error.
    pub fn duplicate(collection: impl Into<String>, key: impl Into<String>) -> Self {
        StoreError::Duplicate {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

/// Convert sqlx errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::Database       → UNIQUE → Duplicate, else QueryFailed
/// sqlx::Error::PoolTimedOut   → StoreError::PoolExhausted
/// sqlx::Error::PoolClosed     → StoreError::ConnectionFailed
/// Other                       → StoreError::Internal
/// ```
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <index or table.column>"
                if msg.contains("UNIQUE constraint failed") {
                    let key = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    StoreError::Duplicate {
                        collection: "documents".to_string(),
                        key,
                    }
                } else {
                    StoreError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => StoreError::PoolExhausted,

            sqlx::Error::PoolClosed => StoreError::ConnectionFailed("Pool is closed".to_string()),

            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidDocument(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StoreError::duplicate("orders", "abc");
        assert_eq!(err.to_string(), "Duplicate in orders: abc");
        assert!(err.is_duplicate());

        let err = StoreError::PartialMove {
            from: "orders".to_string(),
            to: "order_archive".to_string(),
            id: "o-1".to_string(),
            reason: "disk I/O error".to_string(),
        };
        assert!(err.to_string().contains("left a duplicate"));
    }

    #[test]
    fn test_json_error_is_invalid_document() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(StoreError::from(json_err), StoreError::InvalidDocument(_)));
    }
}
