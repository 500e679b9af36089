//! Destination seam for the bulk importer

use crate::db::Database;
use crate::error::Result;
use crate::types::{EntityKind, Record, Session, ToolMetric};
use serde::{Deserialize, Serialize};

/// Conflict handling for bulk writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Existing ids are left untouched and counted as skipped
    Insert,
    /// Existing ids are overwritten and counted as updated
    #[default]
    Upsert,
}

/// Row counts from one write call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl WriteCounts {
    pub fn add(&mut self, other: WriteCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Store the importer writes into.
///
/// Each write call is atomic: the whole slice is applied or none of it.
pub trait ImportSink {
    fn write_sessions(&self, schema: &str, records: &[Session], mode: WriteMode)
        -> Result<WriteCounts>;

    fn write_tool_metrics(
        &self,
        schema: &str,
        records: &[ToolMetric],
        mode: WriteMode,
    ) -> Result<WriteCounts>;

    fn count_rows(&self, schema: &str, kind: EntityKind) -> Result<u64>;

    fn fetch_sessions(&self, schema: &str, ids: &[String]) -> Result<Vec<Session>>;

    fn fetch_tool_metrics(&self, schema: &str, ids: &[String]) -> Result<Vec<ToolMetric>>;
}

impl<T: ImportSink + ?Sized> ImportSink for &T {
    fn write_sessions(
        &self,
        schema: &str,
        records: &[Session],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        (**self).write_sessions(schema, records, mode)
    }

    fn write_tool_metrics(
        &self,
        schema: &str,
        records: &[ToolMetric],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        (**self).write_tool_metrics(schema, records, mode)
    }

    fn count_rows(&self, schema: &str, kind: EntityKind) -> Result<u64> {
        (**self).count_rows(schema, kind)
    }

    fn fetch_sessions(&self, schema: &str, ids: &[String]) -> Result<Vec<Session>> {
        (**self).fetch_sessions(schema, ids)
    }

    fn fetch_tool_metrics(&self, schema: &str, ids: &[String]) -> Result<Vec<ToolMetric>> {
        (**self).fetch_tool_metrics(schema, ids)
    }
}

impl ImportSink for Database {
    fn write_sessions(
        &self,
        schema: &str,
        records: &[Session],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        Database::write_sessions(self, schema, records, mode)
    }

    fn write_tool_metrics(
        &self,
        schema: &str,
        records: &[ToolMetric],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        Database::write_tool_metrics(self, schema, records, mode)
    }

    fn count_rows(&self, schema: &str, kind: EntityKind) -> Result<u64> {
        Database::count_rows(self, schema, kind)
    }

    fn fetch_sessions(&self, schema: &str, ids: &[String]) -> Result<Vec<Session>> {
        Database::fetch_sessions(self, schema, ids)
    }

    fn fetch_tool_metrics(&self, schema: &str, ids: &[String]) -> Result<Vec<ToolMetric>> {
        Database::fetch_tool_metrics(self, schema, ids)
    }
}

/// Routes a record type to its sink methods
pub trait Importable: Record + Sized {
    fn write<S: ImportSink + ?Sized>(
        sink: &S,
        schema: &str,
        records: &[Self],
        mode: WriteMode,
    ) -> Result<WriteCounts>;

    fn fetch<S: ImportSink + ?Sized>(sink: &S, schema: &str, ids: &[String]) -> Result<Vec<Self>>;
}

impl Importable for Session {
    fn write<S: ImportSink + ?Sized>(
        sink: &S,
        schema: &str,
        records: &[Self],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        sink.write_sessions(schema, records, mode)
    }

    fn fetch<S: ImportSink + ?Sized>(sink: &S, schema: &str, ids: &[String]) -> Result<Vec<Self>> {
        sink.fetch_sessions(schema, ids)
    }
}

impl Importable for ToolMetric {
    fn write<S: ImportSink + ?Sized>(
        sink: &S,
        schema: &str,
        records: &[Self],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        sink.write_tool_metrics(schema, records, mode)
    }

    fn fetch<S: ImportSink + ?Sized>(sink: &S, schema: &str, ids: &[String]) -> Result<Vec<Self>> {
        sink.fetch_tool_metrics(schema, ids)
    }
}
