//! # Reconciliation CLI
//!
//! Runs one reconciliation pass against the configured store.
//!
//! ## Usage
//! ```bash
//! # Use comanda.toml from the config dir (or defaults) plus COMANDA_* env
//! cargo run -p comanda-engine --bin comanda-reconcile
//!
//! # Explicit config file and database
//! cargo run -p comanda-engine --bin comanda-reconcile -- --config ./comanda.toml --db ./comanda.db
//!
//! # Machine-readable report, non-zero exit when discrepancies remain
//! cargo run -p comanda-engine --bin comanda-reconcile -- --json --strict
//! ```

use comanda_engine::telemetry::init_tracing;
use comanda_engine::{Engine, EngineConfig};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut db_path: Option<PathBuf> = None;
    let mut json = false;
    let mut strict = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--json" => json = true,
            "--strict" => strict = true,
            "--help" | "-h" => {
                println!("Comanda POS Reconciliation");
                println!();
                println!("Usage: comanda-reconcile [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>   Config file (default: <config dir>/comanda.toml)");
                println!("  -d, --db <PATH>       Database file, overrides the config");
                println!("      --json            Print the report as JSON");
                println!("      --strict          Exit with status 2 if discrepancies remain");
                println!("  -h, --help            Show this help message");
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown argument: {} (see --help)", other);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let mut config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = db_path {
        config.store.path = path;
        config.store.in_memory = false;
    }

    init_tracing(Some(&config.logging.filter));

    let engine = match Engine::connect(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Could not open store");
            eprintln!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = match engine.reconciliation().run().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "Reconciliation failed");
            eprintln!("✗ {}", e);
            engine.store().close().await;
            return ExitCode::FAILURE;
        }
    };
    engine.store().close().await;

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("✗ {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Comanda POS Reconciliation");
        println!("==========================");
        println!("Database: {}", config.store.path.display());
        println!();
        println!("✓ Archive duplicates removed: {}", report.duplicates_removed.len());
        for id in &report.duplicates_removed {
            println!("    {}", id);
        }
        println!("✓ Session mirrors repaired:   {}", report.mirrors_retried.len());
        println!("✓ Missing sales recorded:     {}", report.payments_remirrored.len());
        for id in &report.payments_remirrored {
            println!("    payment {}", id);
        }
        println!("✓ Table statuses corrected:   {}", report.tables_resynced.len());
        for number in &report.tables_resynced {
            println!("    table {}", number);
        }
        println!();
        if report.open_discrepancies > 0 {
            println!("! {} discrepancies need a manager", report.open_discrepancies);
        } else {
            println!("✓ No open discrepancies");
        }
    }

    if strict && report.open_discrepancies > 0 {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
