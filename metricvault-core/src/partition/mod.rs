//! Partition lifecycle management
//!
//! Keeps the physical chunks of append-only tables aligned with three
//! windows:
//!
//! ```text
//!   dropped        compressed              uncompressed        pre-created
//! ───────────┼──────────────────────────┼────────────────────┼─────────────►
//!      now - retention           now - compress_after       now      now + precreate
//! ```
//!
//! Per-chunk operations are best-effort: one failing chunk is logged and the
//! rest are still processed. Only [`PartitionManager::run_maintenance_cycle`]
//! stops at the first stage that fails outright.

use crate::config::PartitionConfig;
use crate::error::Result;
use crate::types::{ChunkDescriptor, PartitionStats};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// A chunk newer than this many days must exist for a table to be healthy
const RECENT_CHUNK_DAYS: i64 = 2;

/// Maximum healthy share of uncompressed chunks
const MAX_UNCOMPRESSED_RATIO: f64 = 0.3;

/// Slack on the retention window before the oldest chunk is flagged
const RETENTION_SLACK: f64 = 1.1;

/// Days of chunks created ahead by the maintenance cycle
const MAINTENANCE_PRECREATE_DAYS: u32 = 7;

/// Outcome of a create-if-absent chunk call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCreation {
    Created(i64),
    AlreadyExists,
}

/// Maintenance statements the partition manager issues against a store.
///
/// Table names may be schema-qualified (`tenant_a.sessions`).
pub trait ChunkStore {
    /// List chunks, optionally restricted to one table
    fn list_chunks(&self, table: Option<&str>) -> Result<Vec<ChunkDescriptor>>;

    /// Create the chunk covering `[start, end)` unless it already exists
    fn create_chunk(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ChunkCreation>;

    /// Compress one chunk, returning its compressed size in bytes
    fn compress_chunk(&self, chunk: &ChunkDescriptor) -> Result<i64>;

    /// Drop one chunk together with its rows
    fn drop_chunk(&self, chunk: &ChunkDescriptor) -> Result<()>;
}

impl<T: ChunkStore + ?Sized> ChunkStore for &T {
    fn list_chunks(&self, table: Option<&str>) -> Result<Vec<ChunkDescriptor>> {
        (**self).list_chunks(table)
    }

    fn create_chunk(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ChunkCreation> {
        (**self).create_chunk(table, start, end)
    }

    fn compress_chunk(&self, chunk: &ChunkDescriptor) -> Result<i64> {
        (**self).compress_chunk(chunk)
    }

    fn drop_chunk(&self, chunk: &ChunkDescriptor) -> Result<()> {
        (**self).drop_chunk(chunk)
    }
}

/// Result of one full maintenance cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceSummary {
    pub compressed: usize,
    pub dropped: usize,
    pub pre_created_days: u32,
}

/// Advisory health report; never triggers corrective action itself
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub issues: Vec<String>,
    pub stats: Vec<PartitionStats>,
}

/// Orchestrates chunk creation, compression and retention for the tracked tables.
pub struct PartitionManager<S> {
    store: S,
    config: PartitionConfig,
}

impl<S: ChunkStore> PartitionManager<S> {
    pub fn new(store: S, config: PartitionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Chunks of one table, or of every tracked table.
    ///
    /// Without a filter only `config.tables` is read, so a manager scoped to
    /// one tenant never sees chunks of another schema.
    pub fn list_chunks(&self, table: Option<&str>) -> Result<Vec<ChunkDescriptor>> {
        match table {
            Some(t) => self.store.list_chunks(Some(t)),
            None => {
                let mut chunks = Vec::new();
                for t in &self.config.tables {
                    chunks.extend(self.store.list_chunks(Some(t))?);
                }
                Ok(chunks)
            }
        }
    }

    /// Per-table chunk statistics.
    ///
    /// Without a table filter, every tracked table gets an entry even if it
    /// has no chunks yet.
    pub fn chunk_stats(&self, table: Option<&str>) -> Result<Vec<PartitionStats>> {
        let chunks = self.list_chunks(table)?;

        let mut by_table: BTreeMap<String, Vec<&ChunkDescriptor>> = BTreeMap::new();
        match table {
            Some(t) => {
                by_table.entry(t.to_string()).or_default();
            }
            None => {
                for t in &self.config.tables {
                    by_table.entry(t.clone()).or_default();
                }
            }
        }
        for chunk in &chunks {
            by_table
                .entry(chunk.table_name.clone())
                .or_default()
                .push(chunk);
        }

        Ok(by_table
            .into_iter()
            .map(|(table_name, chunks)| summarize(table_name, &chunks))
            .collect())
    }

    /// Create chunks of `interval_hours` covering `[start, end)`.
    ///
    /// Chunk boundaries are aligned to multiples of the interval since the
    /// Unix epoch, so overlapping windows map onto the same chunks. Returns
    /// the number of chunks actually created; existing ones are skipped.
    pub fn create_chunks_for_window(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_hours: u32,
    ) -> Result<usize> {
        let step = i64::from(interval_hours.max(1)) * 3600;
        let first = start.timestamp() - start.timestamp().rem_euclid(step);

        let mut created = 0;
        let mut cursor = first;
        while cursor < end.timestamp() {
            let chunk_start = epoch(cursor);
            let chunk_end = epoch(cursor + step);

            match self.store.create_chunk(table, chunk_start, chunk_end)? {
                ChunkCreation::Created(chunk_id) => {
                    tracing::debug!(table, chunk_id, start = %chunk_start, "Created chunk");
                    created += 1;
                }
                ChunkCreation::AlreadyExists => {
                    tracing::debug!(table, start = %chunk_start, "Chunk already exists, skipping");
                }
            }
            cursor += step;
        }

        tracing::info!(table, created, interval_hours, "Chunk window prepared");
        Ok(created)
    }

    /// Compress uncompressed chunks whose range ended before `now - age_days`.
    ///
    /// Each chunk is compressed independently. Returns how many succeeded.
    pub fn compress_chunks_older_than(
        &self,
        table: Option<&str>,
        age_days: Option<u32>,
    ) -> Result<usize> {
        let age_days = age_days.unwrap_or(self.config.compress_after_days);
        let cutoff = Utc::now() - Duration::days(i64::from(age_days));

        let candidates: Vec<ChunkDescriptor> = self
            .list_chunks(table)?
            .into_iter()
            .filter(|c| !c.compressed && c.range_end < cutoff)
            .collect();

        let mut compressed = 0;
        for chunk in &candidates {
            match self.store.compress_chunk(chunk) {
                Ok(size_bytes) => {
                    tracing::info!(
                        table = %chunk.table_name,
                        chunk_id = chunk.chunk_id,
                        size_bytes,
                        "Compressed chunk"
                    );
                    compressed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        table = %chunk.table_name,
                        chunk_id = chunk.chunk_id,
                        error = %e,
                        "Failed to compress chunk"
                    );
                }
            }
        }

        tracing::info!(
            candidates = candidates.len(),
            compressed,
            age_days,
            "Compression pass complete"
        );
        Ok(compressed)
    }

    /// Drop chunks whose range ended before `now - age_days`.
    ///
    /// Same per-chunk isolation as compression. Returns how many were dropped.
    pub fn drop_chunks_older_than(
        &self,
        table: Option<&str>,
        age_days: Option<u32>,
    ) -> Result<usize> {
        let age_days = age_days.unwrap_or(self.config.retention_days);
        let cutoff = Utc::now() - Duration::days(i64::from(age_days));

        let expired: Vec<ChunkDescriptor> = self
            .list_chunks(table)?
            .into_iter()
            .filter(|c| c.range_end < cutoff)
            .collect();

        let mut dropped = 0;
        for chunk in &expired {
            match self.store.drop_chunk(chunk) {
                Ok(()) => {
                    tracing::info!(
                        table = %chunk.table_name,
                        chunk_id = chunk.chunk_id,
                        range_end = %chunk.range_end,
                        "Dropped chunk"
                    );
                    dropped += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        table = %chunk.table_name,
                        chunk_id = chunk.chunk_id,
                        error = %e,
                        "Failed to drop chunk"
                    );
                }
            }
        }

        tracing::info!(expired = expired.len(), dropped, age_days, "Retention pass complete");
        Ok(dropped)
    }

    /// Create chunks for `[now, now + days]` on every tracked table
    pub fn pre_create_upcoming(&self, days: u32) -> Result<usize> {
        let now = Utc::now();
        let end = now + Duration::days(i64::from(days));

        let mut created = 0;
        for table in &self.config.tables {
            created +=
                self.create_chunks_for_window(table, now, end, self.config.chunk_interval_hours)?;
        }
        Ok(created)
    }

    /// Compress, then drop, then pre-create a week ahead.
    ///
    /// A stage that fails outright aborts the remaining stages.
    pub fn run_maintenance_cycle(&self) -> Result<MaintenanceSummary> {
        tracing::info!("Starting partition maintenance cycle");

        let compressed = self.compress_chunks_older_than(None, None)?;
        let dropped = self.drop_chunks_older_than(None, None)?;
        self.pre_create_upcoming(MAINTENANCE_PRECREATE_DAYS)?;

        let summary = MaintenanceSummary {
            compressed,
            dropped,
            pre_created_days: MAINTENANCE_PRECREATE_DAYS,
        };
        tracing::info!(
            compressed = summary.compressed,
            dropped = summary.dropped,
            pre_created_days = summary.pre_created_days,
            "Partition maintenance cycle complete"
        );
        Ok(summary)
    }

    /// Check every tracked table for stale, uncompressed or over-retained chunks
    pub fn health_check(&self) -> Result<HealthReport> {
        let now = Utc::now();
        let recent_cutoff = now - Duration::days(RECENT_CHUNK_DAYS);
        let retention_hours = f64::from(self.config.retention_days) * 24.0 * RETENTION_SLACK;
        let retention_cutoff = now - Duration::hours(retention_hours.round() as i64);

        let stats = self.chunk_stats(None)?;
        let mut issues = Vec::new();

        for s in stats
            .iter()
            .filter(|s| self.config.tables.contains(&s.table_name))
        {
            match s.newest_chunk {
                None => issues.push(format!("{}: no recent partitions (no chunks)", s.table_name)),
                Some(newest) if newest < recent_cutoff => issues.push(format!(
                    "{}: no recent partitions (newest chunk starts {})",
                    s.table_name,
                    newest.format("%Y-%m-%d %H:%M")
                )),
                Some(_) => {}
            }

            if s.total_chunks > 0 {
                let ratio = s.uncompressed_chunks as f64 / s.total_chunks as f64;
                if ratio > MAX_UNCOMPRESSED_RATIO {
                    issues.push(format!(
                        "{}: {:.0}% of chunks are uncompressed",
                        s.table_name,
                        ratio * 100.0
                    ));
                }
            }

            if let Some(oldest) = s.oldest_chunk {
                if oldest < retention_cutoff {
                    issues.push(format!(
                        "{}: oldest chunk ({}) is beyond the {}-day retention window",
                        s.table_name,
                        oldest.format("%Y-%m-%d"),
                        self.config.retention_days
                    ));
                }
            }
        }

        if !issues.is_empty() {
            tracing::warn!(issues = ?issues, "Partition health check found issues");
        }

        Ok(HealthReport {
            is_healthy: issues.is_empty(),
            issues,
            stats,
        })
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn summarize(table_name: String, chunks: &[&ChunkDescriptor]) -> PartitionStats {
    let compressed_chunks = chunks.iter().filter(|c| c.compressed).count();
    PartitionStats {
        table_name,
        total_chunks: chunks.len(),
        compressed_chunks,
        uncompressed_chunks: chunks.len() - compressed_chunks,
        total_size_bytes: chunks.iter().map(|c| c.size_bytes).sum(),
        oldest_chunk: chunks.iter().map(|c| c.range_start).min(),
        newest_chunk: chunks.iter().map(|c| c.range_start).max(),
    }
}
