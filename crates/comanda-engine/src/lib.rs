//! # comanda-engine: Lifecycle Services for Comanda POS
//!
//! Tables, tabs, cash sessions and settlement, written once against the
//! [`EntityStore`] contract and usable over SQLite or the in-memory store.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Comanda POS Call Flow                            │
//! │                                                                         │
//! │  HTTP handler / CLI (Identity from the auth layer)                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  comanda-engine (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │  Engine ──► TableRegistry      open / close / lookup            │   │
//! │  │        ──► OrderLedger         items / close / archive          │   │
//! │  │        ──► SettlementEngine    payments ──► session mirror      │   │
//! │  │        ──► CashSessionManager  open / sale / outflow / close    │   │
//! │  │        ──► ReconciliationJob   repairs partial writes           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │  Arc<S: EntityStore>          rules from comanda-core           │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          comanda-db (SqliteStore / MemoryStore)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! Services hold nothing but the store handle and settings. Every call
//! re-reads what it needs; writes are compare-and-swap on `version`, and the
//! "only one open X" rules are conditional inserts. Two terminals hitting
//! the same table are therefore serialized by the store, not by a lock here.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comanda_engine::{Engine, EngineConfig};
//!
//! let config = EngineConfig::load(None)?;
//! comanda_engine::telemetry::init_tracing(Some(&config.logging.filter));
//!
//! let engine = Engine::connect(&config).await?;
//! let order = engine.tables().open_table("5", None, &waiter).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cash;
pub mod config;
pub mod error;
pub mod orders;
pub mod reconcile;
pub mod settlement;
pub mod tables;
pub mod telemetry;

mod docs;

#[cfg(test)]
pub(crate) mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use cash::{CashSessionManager, SaleReceipt, SaleReference};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use orders::OrderLedger;
pub use reconcile::{ReconciliationJob, ReconciliationReport};
pub use settlement::{MirrorStatus, SettledEntry, SettlementEngine, SettlementOutcome};
pub use tables::TableRegistry;

use std::sync::Arc;

use comanda_core::DEFAULT_TABLE_CAPACITY;
use comanda_db::{EntityStore, SqliteStore};
use tracing::info;

// =============================================================================
// Engine Settings
// =============================================================================

/// The runtime knobs every service needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Compare-and-swap attempts before giving up with `Conflict`.
    pub max_write_retries: u32,

    /// Capacity for tables registered implicitly by `open_table`.
    pub default_table_capacity: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            max_write_retries: 5,
            default_table_capacity: DEFAULT_TABLE_CAPACITY,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        EngineSettings {
            max_write_retries: config.settlement.max_write_retries,
            default_table_capacity: config.tables.default_capacity,
        }
    }
}

// =============================================================================
// Engine Facade
// =============================================================================

/// Entry point handing out services that share one store.
pub struct Engine<S: ?Sized> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: ?Sized> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Engine {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

impl<S: EntityStore + ?Sized> Engine<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Engine { store, settings }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn tables(&self) -> TableRegistry<S> {
        TableRegistry::new(Arc::clone(&self.store), self.settings)
    }

    pub fn orders(&self) -> OrderLedger<S> {
        OrderLedger::new(Arc::clone(&self.store), self.settings)
    }

    pub fn cash(&self) -> CashSessionManager<S> {
        CashSessionManager::new(Arc::clone(&self.store), self.settings)
    }

    pub fn settlement(&self) -> SettlementEngine<S> {
        SettlementEngine::new(Arc::clone(&self.store), self.settings)
    }

    pub fn reconciliation(&self) -> ReconciliationJob<S> {
        ReconciliationJob::new(Arc::clone(&self.store), self.settings)
    }
}

impl Engine<SqliteStore> {
    /// Opens the SQLite store described by `config` (running migrations).
    pub async fn connect(config: &EngineConfig) -> EngineResult<Self> {
        let store = SqliteStore::connect(config.db_config()).await?;
        info!(
            in_memory = config.store.in_memory,
            max_write_retries = config.settlement.max_write_retries,
            "Engine ready"
        );
        Ok(Engine::new(Arc::new(store), EngineSettings::from(config)))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, waiter};
    use comanda_core::Money;

    #[tokio::test]
    async fn test_engine_over_sqlite_in_memory() {
        let mut config = EngineConfig::default();
        config.store.in_memory = true;

        let engine = Engine::connect(&config).await.unwrap();
        assert_eq!(engine.store().backend(), "sqlite");

        let order = engine.tables().open_table("5", Some(4), &waiter()).await.unwrap();
        assert_eq!(order.table_number, "05");

        let order = engine
            .orders()
            .add_item(&order.id, item("Feijoada", 2500, 2), &waiter())
            .await
            .unwrap();
        assert_eq!(order.total, Money::from_cents(5000));

        let second = engine.tables().open_table("05", None, &waiter()).await.unwrap_err();
        assert_eq!(second.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = EngineConfig::default();
        config.settlement.max_write_retries = 7;
        config.tables.default_capacity = 6;

        let settings = EngineSettings::from(&config);
        assert_eq!(settings.max_write_retries, 7);
        assert_eq!(settings.default_table_capacity, 6);
    }
}
