//! Database layer for metricvault
//!
//! This module provides the destination store using SQLite with:
//! - Per-schema migrations (one schema per tenant)
//! - Bulk insert/upsert and fetch-by-id for imported records
//! - A chunk catalog backing the partition manager

mod chunks;
pub mod repo;
pub mod schema;

pub use repo::Database;
