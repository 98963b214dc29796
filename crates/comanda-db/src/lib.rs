//! # comanda-db: Entity Store Layer for Comanda POS
//!
//! The services never see SQL. They talk to the [`EntityStore`] contract,
//! which this crate implements twice.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Comanda POS Data Flow                            │
//! │                                                                         │
//! │  TableRegistry / OrderLedger / CashSessionManager / Settlement          │
//! │       │  Arc<S: EntityStore>                                            │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     comanda-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐   │   │
//! │  │   │  EntityStore  │    │  SqliteStore  │    │  Migrations  │   │   │
//! │  │   │ (store/mod)   │◄───│  (pool.rs +   │    │  (embedded)  │   │   │
//! │  │   │ Filter, Sort  │    │ store/sqlite) │    │ 001_docs.sql │   │   │
//! │  │   │ merge_patch   │◄───│  MemoryStore  │    │              │   │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 SQLite database (documents table)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`store`] - The contract, filters, merge patch and both backends
//! - [`pool`] - SQLite pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Store error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comanda_db::{Collection, DbConfig, EntityStore, Filter, SqliteStore};
//!
//! let store = SqliteStore::connect(DbConfig::new("comanda.db")).await?;
//! let open = store
//!     .find_many(Collection::Orders, &Filter::new().eq("status", "open"), None)
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use pool::{DbConfig, SqliteStore};
pub use store::memory::MemoryStore;
pub use store::{
    from_document, merge_patch, to_document, Collection, Document, EntityStore, Filter, Sort,
    UpdateOptions, UpdateResult,
};
