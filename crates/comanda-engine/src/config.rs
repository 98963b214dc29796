//! # Engine Configuration
//!
//! Where the store lives, how hard services retry, and what gets logged.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     COMANDA_DB_PATH=/var/lib/comanda/comanda.db                        │
//! │     COMANDA_MAX_WRITE_RETRIES=8                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/comanda/comanda.toml (Linux)                             │
//! │     ~/Library/Application Support/com.comanda.pos/comanda.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     ./comanda.db, 5 retries, capacity 4                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # comanda.toml
//! [store]
//! path = "/var/lib/comanda/comanda.db"
//! in_memory = false
//! max_connections = 5
//!
//! [settlement]
//! max_write_retries = 5
//!
//! [tables]
//! default_capacity = 4
//!
//! [logging]
//! filter = "info,comanda=debug,sqlx=warn"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use comanda_core::validation::MAX_TABLE_CAPACITY;
use comanda_core::DEFAULT_TABLE_CAPACITY;
use comanda_db::DbConfig;

use crate::error::{EngineError, EngineResult};
use crate::telemetry::DEFAULT_LOG_FILTER;

/// Upper bound for `max_write_retries`.
pub const MAX_WRITE_RETRIES_LIMIT: u32 = 100;

// =============================================================================
// Store Settings
// =============================================================================

/// Where and how the entity store is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite database file. Created if missing.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Ignore `path` and use a private in-memory database.
    #[serde(default)]
    pub in_memory: bool,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("com", "comanda", "pos")
        .map(|dirs| dirs.data_dir().join("comanda.db"))
        .unwrap_or_else(|| PathBuf::from("comanda.db"))
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            path: default_db_path(),
            in_memory: false,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Settlement / Tables / Logging
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSettings {
    /// Compare-and-swap attempts before a write gives up with `Conflict`.
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

fn default_max_write_retries() -> u32 {
    5
}

impl Default for SettlementSettings {
    fn default() -> Self {
        SettlementSettings {
            max_write_retries: default_max_write_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSettings {
    /// Capacity given to tables that `open_table` registers on the fly.
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,
}

fn default_capacity() -> u32 {
    DEFAULT_TABLE_CAPACITY
}

impl Default for TableSettings {
    fn default() -> Self {
        TableSettings {
            default_capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            filter: default_filter(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub settlement: SettlementSettings,

    #[serde(default)]
    pub tables: TableSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (comanda.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    EngineError::config(format!("cannot read {}: {}", path.display(), e))
                })?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document. Missing sections and keys take defaults.
    pub fn from_toml(contents: &str) -> EngineResult<Self> {
        toml::from_str(contents).map_err(|e| EngineError::config(e.to_string()))
    }

    /// Writes the configuration as TOML.
    pub fn save(&self, path: &std::path::Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::config(e.to_string()))?;
        }

        let contents =
            toml::to_string_pretty(self).map_err(|e| EngineError::config(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| EngineError::config(e.to_string()))?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.settlement.max_write_retries == 0
            || self.settlement.max_write_retries > MAX_WRITE_RETRIES_LIMIT
        {
            return Err(EngineError::config(format!(
                "max_write_retries must be between 1 and {}",
                MAX_WRITE_RETRIES_LIMIT
            )));
        }

        if self.tables.default_capacity == 0 || self.tables.default_capacity > MAX_TABLE_CAPACITY {
            return Err(EngineError::config(format!(
                "default_capacity must be between 1 and {}",
                MAX_TABLE_CAPACITY
            )));
        }

        if self.store.max_connections == 0 {
            return Err(EngineError::config("max_connections must be greater than 0"));
        }

        if !self.store.in_memory && self.store.path.as_os_str().is_empty() {
            return Err(EngineError::config("store path is empty"));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `COMANDA_*` overrides read through `lookup`.
    ///
    /// Unparseable numbers are logged and ignored; `validate` still runs
    /// afterwards.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("COMANDA_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.path = PathBuf::from(path);
        }

        if let Some(flag) = lookup("COMANDA_DB_IN_MEMORY") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.store.in_memory = true,
                "0" | "false" | "no" => self.store.in_memory = false,
                _ => warn!(value = %flag, "Unknown COMANDA_DB_IN_MEMORY value"),
            }
        }

        if let Some(retries) = lookup("COMANDA_MAX_WRITE_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => self.settlement.max_write_retries = n,
                Err(_) => warn!(value = %retries, "Ignoring COMANDA_MAX_WRITE_RETRIES"),
            }
        }

        if let Some(capacity) = lookup("COMANDA_DEFAULT_CAPACITY") {
            match capacity.parse::<u32>() {
                Ok(n) => self.tables.default_capacity = n,
                Err(_) => warn!(value = %capacity, "Ignoring COMANDA_DEFAULT_CAPACITY"),
            }
        }

        if let Some(filter) = lookup("COMANDA_LOG") {
            self.logging.filter = filter;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "comanda", "pos")
            .map(|dirs| dirs.config_dir().join("comanda.toml"))
    }

    /// Pool configuration for `SqliteStore::connect`.
    pub fn db_config(&self) -> DbConfig {
        if self.store.in_memory {
            DbConfig::in_memory()
        } else {
            DbConfig::new(self.store.path.clone()).max_connections(self.store.max_connections)
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
