//! # Seed Data Generator
//!
//! Registers the restaurant floor into a SQLite store for development.
//!
//! ## Usage
//! ```bash
//! # Register 20 tables (default)
//! cargo run -p comanda-db --bin seed
//!
//! # Custom amount and capacity
//! cargo run -p comanda-db --bin seed -- --count 40 --capacity 6
//!
//! # Specify database path
//! cargo run -p comanda-db --bin seed -- --db ./data/comanda.db
//! ```
//!
//! Tables are numbered "01".."NN". Every fifth table is a larger
//! "Varanda" table by the window; the rest are "Mesa NN".

use comanda_core::table_number::canonical_table_number;
use comanda_core::Table;
use comanda_db::{to_document, Collection, DbConfig, EntityStore, Filter, SqliteStore};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: u32 = 20;
    let mut capacity: u32 = comanda_core::DEFAULT_TABLE_CAPACITY;
    let mut db_path = String::from("./comanda_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(20);
                    i += 1;
                }
            }
            "--capacity" => {
                if i + 1 < args.len() {
                    capacity = args[i + 1].parse().unwrap_or(capacity);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Comanda POS Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>       Number of tables to register (default: 20)");
                println!("      --capacity <N>    Seats per regular table (default: 4)");
                println!("  -d, --db <PATH>       Database file path (default: ./comanda_dev.db)");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Comanda POS Seed Data Generator");
    println!("===============================");
    println!("Database: {}", db_path);
    println!("Tables:   {}", count);
    println!();

    let store = SqliteStore::connect(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let mut registered = 0;
    let mut skipped = 0;

    for n in 1..=count {
        let number = canonical_table_number(&n.to_string())?;
        let (display_name, seats) = if n % 5 == 0 {
            (format!("Varanda {}", number), capacity + 2)
        } else {
            (format!("Mesa {}", number), capacity)
        };

        let table = Table::new(number.clone(), display_name, seats);
        let inserted = store
            .insert_one_unless(
                Collection::Tables,
                to_document(&table)?,
                &Filter::new().eq("number", number.as_str()),
            )
            .await?;

        if inserted {
            registered += 1;
        } else {
            skipped += 1;
        }
    }

    println!();
    println!("✓ Registered {} tables ({} already present)", registered, skipped);

    let all = store.find_many(Collection::Tables, &Filter::new(), None).await?;
    println!("  Floor now has {} tables", all.len());

    store.close().await;
    println!();
    println!("✓ Seed complete!");

    Ok(())
}
