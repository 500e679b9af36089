//! Chunk catalog operations
//!
//! SQLite has no native hypertables, so each schema carries a `chunks`
//! catalog describing the time ranges of its partitioned tables. Dropping a
//! chunk deletes the rows in its range; compressing it freezes the measured
//! payload size and marks it read-mostly.

use super::repo::{fmt_ts, parse_ts, Database};
use super::schema::{time_column, validate_identifier};
use crate::error::{Error, Result};
use crate::partition::{ChunkCreation, ChunkStore};
use crate::types::ChunkDescriptor;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// Split `schema.table` into its parts; a bare table lives in `main`
fn split_table(qualified: &str) -> Result<(String, String)> {
    let (schema, table) = match qualified.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("main", qualified),
    };
    validate_identifier(schema)?;
    validate_identifier(table)?;
    if time_column(table).is_none() {
        return Err(Error::Config(format!("table {:?} is not partitioned", table)));
    }
    Ok((schema.to_string(), table.to_string()))
}

fn qualify(schema: &str, table: &str) -> String {
    if schema == "main" {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

/// Approximate on-disk payload of one row, per partitioned table
fn payload_expr(table: &str) -> &'static str {
    match table {
        "sessions" => {
            "LENGTH(id) + LENGTH(user_id) + LENGTH(tools_used) + LENGTH(tags) + LENGTH(metadata) \
             + COALESCE(LENGTH(project_id), 0) + COALESCE(LENGTH(description), 0) + 96"
        }
        _ => {
            "LENGTH(id) + LENGTH(session_id) + LENGTH(tool_name) + LENGTH(parameters) \
             + COALESCE(LENGTH(command_line), 0) + COALESCE(LENGTH(working_directory), 0) + 112"
        }
    }
}

/// Sum of row payloads inside `[start, end)`
fn measure_range(
    conn: &Connection,
    schema: &str,
    table: &str,
    start: &str,
    end: &str,
) -> Result<i64> {
    let column = time_column(table)
        .ok_or_else(|| Error::Config(format!("table {:?} is not partitioned", table)))?;
    let size: i64 = conn.query_row(
        &format!(
            "SELECT COALESCE(SUM({expr}), 0) FROM {schema}.{table} \
             WHERE {column} >= ?1 AND {column} < ?2",
            expr = payload_expr(table),
        ),
        params![start, end],
        |r| r.get(0),
    )?;
    Ok(size)
}

/// Make sure some chunk of `table` covers `ts`.
///
/// When none does, the `step_secs`-aligned chunk around `ts` is created.
/// Returns the covering range and whether it was created.
pub(crate) fn ensure_covering_chunk(
    conn: &Connection,
    schema: &str,
    table: &str,
    ts: &DateTime<Utc>,
    step_secs: i64,
) -> Result<(DateTime<Utc>, DateTime<Utc>, bool)> {
    let at = fmt_ts(ts);
    let covering: Option<(String, String)> = conn
        .query_row(
            &format!(
                "SELECT range_start, range_end FROM {}.chunks
                 WHERE table_name = ?1 AND range_start <= ?2 AND range_end > ?2
                 LIMIT 1",
                schema
            ),
            params![table, at],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((start, end)) = covering {
        return Ok((parse_ts(0, &start)?, parse_ts(1, &end)?, false));
    }

    let (start, end) = aligned_range(ts, step_secs)?;
    let changed = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {}.chunks (table_name, range_start, range_end, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            schema
        ),
        params![table, fmt_ts(&start), fmt_ts(&end), fmt_ts(&Utc::now())],
    )?;
    Ok((start, end, changed > 0))
}

/// Start (inclusive) and end (exclusive) of the epoch-aligned bucket holding `ts`
fn aligned_range(
    ts: &DateTime<Utc>,
    step_secs: i64,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let step = step_secs.max(1);
    let start = ts.timestamp() - ts.timestamp().rem_euclid(step);
    let at = |secs: i64| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::Config(format!("timestamp {} out of range", secs)))
    };
    Ok((at(start)?, at(start + step)?))
}

impl ChunkStore for Database {
    fn list_chunks(&self, table: Option<&str>) -> Result<Vec<ChunkDescriptor>> {
        let targets: Vec<(String, Option<String>)> = match table {
            Some(t) => {
                let (schema, table) = split_table(t)?;
                self.require_schema(&schema)?;
                vec![(schema, Some(table))]
            }
            None => self.schemas().into_iter().map(|s| (s, None)).collect(),
        };

        let conn = self.connection();
        let mut chunks = Vec::new();

        for (schema, table) in targets {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, table_name, range_start, range_end, size_bytes, compressed
                 FROM {}.chunks
                 WHERE (?1 IS NULL OR table_name = ?1)
                 ORDER BY table_name, range_start",
                schema
            ))?;

            let rows = stmt.query_map([table.as_deref()], |row| {
                let table_name: String = row.get(1)?;
                let range_start: String = row.get(2)?;
                let range_end: String = row.get(3)?;
                let compressed: i64 = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    table_name,
                    range_start,
                    range_end,
                    row.get::<_, i64>(4)?,
                    compressed != 0,
                ))
            })?;

            for row in rows {
                let (chunk_id, table_name, start, end, stored_size, compressed) = row?;
                // Uncompressed chunks still take writes, so their size is live.
                let size_bytes = if compressed {
                    stored_size
                } else {
                    measure_range(&conn, &schema, &table_name, &start, &end)?
                };
                chunks.push(ChunkDescriptor {
                    table_name: qualify(&schema, &table_name),
                    chunk_id,
                    range_start: parse_ts(2, &start)?,
                    range_end: parse_ts(3, &end)?,
                    size_bytes,
                    compressed,
                });
            }
        }

        Ok(chunks)
    }

    fn create_chunk(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ChunkCreation> {
        let (schema, table) = split_table(table)?;
        self.require_schema(&schema)?;

        let conn = self.connection();
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {}.chunks (table_name, range_start, range_end, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                schema
            ),
            params![table, fmt_ts(&start), fmt_ts(&end), fmt_ts(&Utc::now())],
        )?;

        if changed == 0 {
            Ok(ChunkCreation::AlreadyExists)
        } else {
            Ok(ChunkCreation::Created(conn.last_insert_rowid()))
        }
    }

    fn compress_chunk(&self, chunk: &ChunkDescriptor) -> Result<i64> {
        let (schema, table) = split_table(&chunk.table_name)?;
        self.require_schema(&schema)?;

        let conn = self.connection();
        let range: Option<(String, String)> = conn
            .query_row(
                &format!(
                    "SELECT range_start, range_end FROM {}.chunks WHERE id = ?1 AND table_name = ?2",
                    schema
                ),
                params![chunk.chunk_id, table],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let (start, end) = range.ok_or_else(|| Error::Chunk {
            table: chunk.table_name.clone(),
            chunk_id: chunk.chunk_id,
            message: "chunk not found".to_string(),
        })?;

        let size_bytes = measure_range(&conn, &schema, &table, &start, &end)?;
        let changed = conn.execute(
            &format!(
                "UPDATE {}.chunks SET compressed = 1, compressed_at = ?1, size_bytes = ?2
                 WHERE id = ?3 AND compressed = 0",
                schema
            ),
            params![fmt_ts(&Utc::now()), size_bytes, chunk.chunk_id],
        )?;

        if changed == 0 {
            return Err(Error::Chunk {
                table: chunk.table_name.clone(),
                chunk_id: chunk.chunk_id,
                message: "chunk is already compressed".to_string(),
            });
        }
        Ok(size_bytes)
    }

    fn drop_chunk(&self, chunk: &ChunkDescriptor) -> Result<()> {
        let (schema, table) = split_table(&chunk.table_name)?;
        self.require_schema(&schema)?;
        let column = time_column(&table)
            .ok_or_else(|| Error::Config(format!("table {:?} is not partitioned", table)))?;

        let mut conn = self.connection();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            &format!(
                "DELETE FROM {schema}.{table} WHERE {column} >= ?1 AND {column} < ?2"
            ),
            params![fmt_ts(&chunk.range_start), fmt_ts(&chunk.range_end)],
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM {}.chunks WHERE id = ?1", schema),
            params![chunk.chunk_id],
        )?;

        if removed == 0 {
            return Err(Error::Chunk {
                table: chunk.table_name.clone(),
                chunk_id: chunk.chunk_id,
                message: "chunk not found".to_string(),
            });
        }

        tx.commit()?;
        tracing::debug!(table = %chunk.table_name, chunk_id = chunk.chunk_id, rows, "Deleted chunk rows");
        Ok(())
    }
}
