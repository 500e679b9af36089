//! # metricvault-core
//!
//! Core library for metricvault - the data-lifecycle backbone of a
//! multi-tenant productivity metrics store.
//!
//! This library provides:
//! - Domain types for sessions, tool metrics, chunks and live events
//! - Database storage layer with SQLite (one schema per tenant)
//! - Partition lifecycle management (pre-create, compress, retain)
//! - Rule-based validation before and after bulk writes
//! - A checkpointed, resumable bulk importer
//! - A local-first hybrid collector with queued remote replication
//! - Configuration management and logging infrastructure
//!
//! ## Data flow
//!
//! - **Live:** event → [`collector::HybridCollector`] → local log (always) →
//!   remote sync when healthy → retry queue on failure
//! - **Historical:** legacy files → [`legacy::load_dir`] → [`validate::Validator`]
//!   → [`import::BulkImporter`] → [`validate::PostImportValidator`]
//! - **Maintenance:** [`partition::PartitionManager`] runs on its own schedule
//!
//! ## Example
//!
//! ```rust,no_run
//! use metricvault_core::partition::PartitionManager;
//! use metricvault_core::{Config, Database};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&config.database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let manager = PartitionManager::new(&db, config.partitions.clone());
//! let summary = manager.run_maintenance_cycle().expect("maintenance failed");
//! println!("compressed {} chunks", summary.compressed);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, RemoteError, Result};
pub use types::*;

// Public modules
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod legacy;
pub mod logging;
pub mod migrate;
pub mod partition;
pub mod types;
pub mod validate;
