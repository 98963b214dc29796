//! # Tracing Setup
//!
//! One place that installs the global subscriber for binaries and hosts.
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages (wins over everything)
//! - `COMANDA_LOG` / `[logging] filter` - used when `RUST_LOG` is unset
//! - Default: `info,comanda=debug,sqlx=warn`

use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_LOG_FILTER: &str = "info,comanda=debug,sqlx=warn";

/// Builds the filter: `RUST_LOG` first, then `configured`, then the default.
pub fn build_filter(configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initializes the tracing subscriber for structured logging.
///
/// Returns `false` when a global subscriber was already installed (tests,
/// or a host application that set up its own).
pub fn init_tracing(configured: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(configured))
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_tracing(Some("warn"));
        assert!(!init_tracing(None));
    }

    #[test]
    fn test_bad_directive_falls_back() {
        // Builds without panicking whatever RUST_LOG holds
        let _ = build_filter(Some("comanda=[[["));
    }
}
