//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via `PRAGMA user_version`.
//! Every tenant lives in its own schema (`main` or an attached database), so
//! migrations are templated on the schema name and tracked per schema.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Tables that carry a time column and can be partitioned into chunks
pub const PARTITIONED_TABLES: &[(&str, &str)] =
    &[("sessions", "start_time"), ("tool_metrics", "recorded_at")];

/// SQL migrations, indexed by version number. `{schema}` is replaced with
/// the target schema name.
const MIGRATIONS: &[&str] = &[
    // Version 1: records
    r#"
    CREATE TABLE IF NOT EXISTS {schema}.sessions (
        id                 TEXT PRIMARY KEY,
        user_id            TEXT NOT NULL,
        start_time         DATETIME NOT NULL,
        end_time           DATETIME,
        duration_ms        INTEGER NOT NULL DEFAULT 0,
        tools_used         JSON NOT NULL,
        productivity_score REAL,
        session_type       TEXT NOT NULL,
        project_id         TEXT,
        tags               JSON NOT NULL,
        interruptions      INTEGER NOT NULL DEFAULT 0,
        focus_time_ms      INTEGER NOT NULL DEFAULT 0,
        description        TEXT,
        metadata           JSON NOT NULL,
        imported_at        DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS {schema}.tool_metrics (
        id                  TEXT PRIMARY KEY,
        session_id          TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        tool_name           TEXT NOT NULL,
        tool_category       TEXT,
        recorded_at         DATETIME NOT NULL,
        execution_count     INTEGER NOT NULL DEFAULT 0,
        total_duration_ms   INTEGER NOT NULL DEFAULT 0,
        average_duration_ms REAL,
        success_rate        REAL NOT NULL,
        error_count         INTEGER NOT NULL DEFAULT 0,
        memory_usage_mb     REAL,
        cpu_usage_percent   REAL,
        parameters          JSON NOT NULL,
        output_size_bytes   INTEGER,
        command_line        TEXT,
        working_directory   TEXT,
        imported_at         DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS {schema}.idx_sessions_start ON sessions(start_time);
    CREATE INDEX IF NOT EXISTS {schema}.idx_sessions_user ON sessions(user_id);
    CREATE INDEX IF NOT EXISTS {schema}.idx_tool_metrics_session ON tool_metrics(session_id);
    CREATE INDEX IF NOT EXISTS {schema}.idx_tool_metrics_recorded ON tool_metrics(recorded_at);
    "#,
    // Version 2: chunk catalog
    r#"
    -- One row per time-bounded chunk; range is [range_start, range_end)
    CREATE TABLE IF NOT EXISTS {schema}.chunks (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name       TEXT NOT NULL,
        range_start      DATETIME NOT NULL,
        range_end        DATETIME NOT NULL,
        size_bytes       INTEGER NOT NULL DEFAULT 0,
        compressed       INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL,
        compressed_at    DATETIME,

        UNIQUE(table_name, range_start)
    );

    CREATE INDEX IF NOT EXISTS {schema}.idx_chunks_table_end ON chunks(table_name, range_end);
    "#,
];

/// Reject anything that is not a plain SQL identifier.
///
/// Schema and table names are interpolated into statements, so only
/// `[A-Za-z_][A-Za-z0-9_]*` is accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid && name.len() <= 64 {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// Time column of a partitioned table
pub fn time_column(table: &str) -> Option<&'static str> {
    PARTITIONED_TABLES
        .iter()
        .find(|(name, _)| *name == table)
        .map(|(_, column)| *column)
}

/// Run all pending migrations for `schema`
pub fn run_migrations(conn: &Connection, schema: &str) -> Result<()> {
    validate_identifier(schema)?;

    let current_version = get_schema_version(conn, schema).unwrap_or(0);

    tracing::info!(
        schema,
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(schema, version, "Running migration");
            conn.execute_batch(&migration.replace("{schema}", schema))?;
            conn.execute(&format!("PRAGMA {}.user_version = {}", schema, version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            schema,
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection, schema: &str) -> Result<i32> {
    validate_identifier(schema)?;
    let version: i32 = conn.query_row(&format!("PRAGMA {}.user_version", schema), [], |r| {
        r.get(0)
    })?;
    Ok(version)
}
