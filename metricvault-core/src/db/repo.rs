//! Database repository layer
//!
//! Provides bulk write, count and fetch operations for sessions and tool
//! metrics, scoped by tenant schema.

use super::chunks::ensure_covering_chunk;
use super::schema::{self, validate_identifier};
use crate::error::{Error, Result};
use crate::import::{WriteCounts, WriteMode};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Ids per `IN (...)` clause when fetching by id
const FETCH_CHUNK: usize = 500;

/// Width of the chunks writes create when no chunk covers a row yet
const DEFAULT_CHUNK_INTERVAL_SECS: i64 = 24 * 3600;

/// Format a timestamp for storage.
///
/// Fixed-width RFC 3339 with nanoseconds, so stored values sort
/// lexicographically in time order and round-trip exactly.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_json(idx: usize, value: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Database handle (single connection, shared behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
    /// `main` plus every attached tenant schema
    schemas: Mutex<Vec<String>>,
    chunk_interval_secs: AtomicI64,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            schemas: Mutex::new(vec!["main".to_string()]),
            chunk_interval_secs: AtomicI64::new(DEFAULT_CHUNK_INTERVAL_SECS),
        }
    }

    /// Run migrations on every known schema
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        for schema in self.schemas() {
            schema::run_migrations(&conn, &schema)?;
        }
        Ok(())
    }

    /// Attach a tenant schema and bring it to the current version.
    ///
    /// `path` of `None` attaches a private in-memory database.
    pub fn attach_schema(&self, name: &str, path: Option<&Path>) -> Result<()> {
        validate_identifier(name)?;
        if self.has_schema(name) {
            return Ok(());
        }

        let target = match path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                p.to_string_lossy().to_string()
            }
            None => ":memory:".to_string(),
        };

        let conn = self.connection();
        conn.execute(&format!("ATTACH DATABASE ?1 AS {}", name), [target])?;
        schema::run_migrations(&conn, name)?;
        drop(conn);

        self.schemas_guard().push(name.to_string());
        tracing::info!(schema = name, "Attached tenant schema");
        Ok(())
    }

    /// Width of the chunks that writes create for rows no chunk covers.
    ///
    /// Should match `partitions.chunk_interval_hours`.
    pub fn set_chunk_interval_hours(&self, hours: u32) {
        self.chunk_interval_secs
            .store(i64::from(hours.max(1)) * 3600, Ordering::Relaxed);
    }

    /// Schemas known to this handle
    pub fn schemas(&self) -> Vec<String> {
        self.schemas_guard().clone()
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas_guard().iter().any(|s| s == name)
    }

    pub(crate) fn require_schema(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        if self.has_schema(name) {
            Ok(())
        } else {
            Err(Error::Config(format!("schema {:?} is not attached", name)))
        }
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schemas_guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.schemas.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn chunk_interval(&self) -> i64 {
        self.chunk_interval_secs.load(Ordering::Relaxed)
    }

    // ============================================
    // Session operations
    // ============================================

    /// Write sessions in one transaction.
    ///
    /// The whole slice commits or nothing does.
    pub fn write_sessions(
        &self,
        schema: &str,
        sessions: &[Session],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        self.require_schema(schema)?;
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let mut counts = WriteCounts::default();
        let imported_at = fmt_ts(&Utc::now());
        let mut chunks = ChunkCoverage::new(schema, "sessions", self.chunk_interval());

        for session in sessions {
            let existed = row_exists(&tx, schema, "sessions", &session.id)?;
            if existed && mode == WriteMode::Insert {
                counts.skipped += 1;
                continue;
            }

            tx.execute(
                &format!(
                    r#"
                    INSERT INTO {schema}.sessions (id, user_id, start_time, end_time, duration_ms,
                                                   tools_used, productivity_score, session_type,
                                                   project_id, tags, interruptions, focus_time_ms,
                                                   description, metadata, imported_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                    ON CONFLICT(id) DO UPDATE SET
                        user_id = excluded.user_id,
                        start_time = excluded.start_time,
                        end_time = excluded.end_time,
                        duration_ms = excluded.duration_ms,
                        tools_used = excluded.tools_used,
                        productivity_score = excluded.productivity_score,
                        session_type = excluded.session_type,
                        project_id = excluded.project_id,
                        tags = excluded.tags,
                        interruptions = excluded.interruptions,
                        focus_time_ms = excluded.focus_time_ms,
                        description = excluded.description,
                        metadata = excluded.metadata,
                        imported_at = excluded.imported_at
                    "#
                ),
                params![
                    session.id,
                    session.user_id,
                    fmt_ts(&session.start_time),
                    session.end_time.as_ref().map(fmt_ts),
                    session.duration_ms,
                    serde_json::to_string(&session.tools_used)?,
                    session.productivity_score,
                    session.session_type.as_str(),
                    session.project_id,
                    serde_json::to_string(&session.tags)?,
                    session.interruptions,
                    session.focus_time_ms,
                    session.description,
                    session.metadata.to_string(),
                    imported_at,
                ],
            )?;

            chunks.cover(&tx, &session.start_time)?;

            if existed {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }

        tx.commit()?;
        Ok(counts)
    }

    /// Fetch sessions by id, in no particular order
    pub fn fetch_sessions(&self, schema: &str, ids: &[String]) -> Result<Vec<Session>> {
        self.require_schema(schema)?;
        let conn = self.connection();
        let mut sessions = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(FETCH_CHUNK) {
            let sql = format!(
                "SELECT * FROM {}.sessions WHERE id IN ({})",
                schema,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), Self::row_to_session)?;
            for row in rows {
                sessions.push(row?);
            }
        }

        Ok(sessions)
    }

    /// Get a session by ID
    pub fn get_session(&self, schema: &str, id: &str) -> Result<Option<Session>> {
        self.require_schema(schema)?;
        let conn = self.connection();
        conn.query_row(
            &format!("SELECT * FROM {}.sessions WHERE id = ?", schema),
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let start_time: String = row.get("start_time")?;
        let end_time: Option<String> = row.get("end_time")?;
        let tools_used: String = row.get("tools_used")?;
        let session_type: String = row.get("session_type")?;
        let tags: String = row.get("tags")?;
        let metadata: String = row.get("metadata")?;

        Ok(Session {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            start_time: parse_ts(2, &start_time)?,
            end_time: end_time.map(|s| parse_ts(3, &s)).transpose()?,
            duration_ms: row.get("duration_ms")?,
            tools_used: serde_json::from_value(parse_json(5, &tools_used)?).unwrap_or_default(),
            productivity_score: row.get("productivity_score")?,
            session_type: session_type.parse().unwrap_or(SessionType::Other),
            project_id: row.get("project_id")?,
            tags: serde_json::from_value(parse_json(9, &tags)?).unwrap_or_default(),
            interruptions: row.get("interruptions")?,
            focus_time_ms: row.get("focus_time_ms")?,
            description: row.get("description")?,
            metadata: parse_json(13, &metadata)?,
        })
    }

    // ============================================
    // Tool metric operations
    // ============================================

    /// Write tool metrics in one transaction.
    ///
    /// Fails as a whole if any metric references a session that does not
    /// exist in the schema.
    pub fn write_tool_metrics(
        &self,
        schema: &str,
        metrics: &[ToolMetric],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        self.require_schema(schema)?;
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let mut counts = WriteCounts::default();
        let imported_at = fmt_ts(&Utc::now());
        let mut chunks = ChunkCoverage::new(schema, "tool_metrics", self.chunk_interval());

        for metric in metrics {
            let existed = row_exists(&tx, schema, "tool_metrics", &metric.id)?;
            if existed && mode == WriteMode::Insert {
                counts.skipped += 1;
                continue;
            }

            tx.execute(
                &format!(
                    r#"
                    INSERT INTO {schema}.tool_metrics (id, session_id, tool_name, tool_category,
                                                       recorded_at, execution_count, total_duration_ms,
                                                       average_duration_ms, success_rate, error_count,
                                                       memory_usage_mb, cpu_usage_percent, parameters,
                                                       output_size_bytes, command_line,
                                                       working_directory, imported_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                    ON CONFLICT(id) DO UPDATE SET
                        session_id = excluded.session_id,
                        tool_name = excluded.tool_name,
                        tool_category = excluded.tool_category,
                        recorded_at = excluded.recorded_at,
                        execution_count = excluded.execution_count,
                        total_duration_ms = excluded.total_duration_ms,
                        average_duration_ms = excluded.average_duration_ms,
                        success_rate = excluded.success_rate,
                        error_count = excluded.error_count,
                        memory_usage_mb = excluded.memory_usage_mb,
                        cpu_usage_percent = excluded.cpu_usage_percent,
                        parameters = excluded.parameters,
                        output_size_bytes = excluded.output_size_bytes,
                        command_line = excluded.command_line,
                        working_directory = excluded.working_directory,
                        imported_at = excluded.imported_at
                    "#
                ),
                params![
                    metric.id,
                    metric.session_id,
                    metric.tool_name,
                    metric.tool_category,
                    fmt_ts(&metric.recorded_at),
                    metric.execution_count,
                    metric.total_duration_ms,
                    metric.average_duration_ms,
                    metric.success_rate,
                    metric.error_count,
                    metric.memory_usage_mb,
                    metric.cpu_usage_percent,
                    metric.parameters.to_string(),
                    metric.output_size_bytes,
                    metric.command_line,
                    metric.working_directory,
                    imported_at,
                ],
            )?;

            chunks.cover(&tx, &metric.recorded_at)?;

            if existed {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }

        tx.commit()?;
        Ok(counts)
    }

    /// Fetch tool metrics by id, in no particular order
    pub fn fetch_tool_metrics(&self, schema: &str, ids: &[String]) -> Result<Vec<ToolMetric>> {
        self.require_schema(schema)?;
        let conn = self.connection();
        let mut metrics = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(FETCH_CHUNK) {
            let sql = format!(
                "SELECT * FROM {}.tool_metrics WHERE id IN ({})",
                schema,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), Self::row_to_tool_metric)?;
            for row in rows {
                metrics.push(row?);
            }
        }

        Ok(metrics)
    }

    fn row_to_tool_metric(row: &Row) -> rusqlite::Result<ToolMetric> {
        let recorded_at: String = row.get("recorded_at")?;
        let parameters: String = row.get("parameters")?;

        Ok(ToolMetric {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            tool_name: row.get("tool_name")?,
            tool_category: row.get("tool_category")?,
            recorded_at: parse_ts(4, &recorded_at)?,
            execution_count: row.get("execution_count")?,
            total_duration_ms: row.get("total_duration_ms")?,
            average_duration_ms: row.get("average_duration_ms")?,
            success_rate: row.get("success_rate")?,
            error_count: row.get("error_count")?,
            memory_usage_mb: row.get("memory_usage_mb")?,
            cpu_usage_percent: row.get("cpu_usage_percent")?,
            parameters: parse_json(12, &parameters)?,
            output_size_bytes: row.get("output_size_bytes")?,
            command_line: row.get("command_line")?,
            working_directory: row.get("working_directory")?,
        })
    }

    // ============================================
    // Statistics
    // ============================================

    /// Count rows of one entity type in a schema
    pub fn count_rows(&self, schema: &str, kind: EntityKind) -> Result<u64> {
        self.require_schema(schema)?;
        let conn = self.connection();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}.{}", schema, kind.table()),
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Database file path (None for in-memory databases)
    pub fn path(&self) -> Option<PathBuf> {
        let conn = self.connection();
        conn.path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

fn row_exists(tx: &Transaction<'_>, schema: &str, table: &str, id: &str) -> Result<bool> {
    let found = tx
        .query_row(
            &format!("SELECT 1 FROM {}.{} WHERE id = ?", schema, table),
            [id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Chunk ranges already known to cover rows written in one transaction
struct ChunkCoverage<'a> {
    schema: &'a str,
    table: &'static str,
    step_secs: i64,
    ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl<'a> ChunkCoverage<'a> {
    fn new(schema: &'a str, table: &'static str, step_secs: i64) -> Self {
        Self {
            schema,
            table,
            step_secs,
            ranges: Vec::new(),
        }
    }

    /// Create the chunk holding `ts` unless one already does
    fn cover(&mut self, tx: &Transaction<'_>, ts: &DateTime<Utc>) -> Result<()> {
        if self.ranges.iter().any(|(start, end)| start <= ts && ts < end) {
            return Ok(());
        }

        let (start, end, created) =
            ensure_covering_chunk(tx, self.schema, self.table, ts, self.step_secs)?;
        if created {
            tracing::debug!(
                schema = self.schema,
                table = self.table,
                start = %start,
                "Created chunk for written rows"
            );
        }
        self.ranges.push((start, end));
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
