//! Checkpointed bulk importer
//!
//! Moves an in-memory data set into an [`ImportSink`] in fixed-size
//! batches. Sessions are imported before tool metrics. For each batch the
//! importer tries one atomic bulk write and, if that fails, falls back to
//! writing records one at a time so a single bad record only costs itself.
//!
//! Progress is reported after every batch and persisted to a checkpoint
//! every `checkpoint_interval` batches, so an interrupted run resumes at
//! the first batch that was not recorded.

mod checkpoint;
pub mod checksum;
mod sink;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use checksum::ChecksumValidation;
pub use sink::{ImportSink, Importable, WriteCounts, WriteMode};

use crate::config::ImportConfig;
use crate::error::{Error, Result};
use crate::types::{EntityKind, Record, Session, ToolMetric};
use crate::validate::Validator;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Options for one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub checkpoint_enabled: bool,
    pub checkpoint_interval: usize,
    pub checkpoint_dir: PathBuf,
    pub continue_on_error: bool,
    pub validate_before_insert: bool,
    /// Sessions checked when validating before insert
    pub validation_sample: usize,
    pub mode: WriteMode,
    pub dry_run: bool,
    pub dry_run_batch_delay_ms: u64,
    /// Target tenant schema
    pub schema: String,
    /// Resume or name a specific run instead of discovering one by checksum
    pub run_id: Option<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::from_config(&ImportConfig::default(), "main")
    }
}

impl ImportOptions {
    pub fn from_config(config: &ImportConfig, schema: &str) -> Self {
        Self {
            batch_size: config.batch_size,
            checkpoint_enabled: config.checkpoint_enabled,
            checkpoint_interval: config.checkpoint_interval,
            checkpoint_dir: config.checkpoint_dir(),
            continue_on_error: config.continue_on_error,
            validate_before_insert: config.validate_before_insert,
            validation_sample: config.validation_sample,
            mode: if config.upsert {
                WriteMode::Upsert
            } else {
                WriteMode::Insert
            },
            dry_run: false,
            dry_run_batch_delay_ms: config.dry_run_batch_delay_ms,
            schema: schema.to_string(),
            run_id: None,
        }
    }
}

/// Where an import error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Session,
    ToolMetric,
    /// Store-level failure not attributable to one record
    Database,
    Validation,
}

impl ErrorOrigin {
    fn for_record(kind: EntityKind, err: &Error) -> Self {
        let record_fault = match err {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            Error::Json(_) => true,
            _ => false,
        };

        match (record_fault, kind) {
            (true, EntityKind::Session) => ErrorOrigin::Session,
            (true, EntityKind::ToolMetric) => ErrorOrigin::ToolMetric,
            (false, _) => ErrorOrigin::Database,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportError {
    pub origin: ErrorOrigin,
    pub batch_index: Option<usize>,
    pub record_id: Option<String>,
    pub message: String,
    /// Retrying the same record later may succeed
    pub retryable: bool,
}

/// Cumulative progress of one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    /// First batch not yet applied
    pub next_batch: usize,
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Emitted after every batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportProgress {
    pub entity: EntityKind,
    pub processed: usize,
    pub total: usize,
    pub elapsed_ms: u64,
    /// Records per second in this run
    pub throughput: f64,
    pub eta_ms: Option<u64>,
    pub batch_index: usize,
    pub total_batches: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub run_id: String,
    pub success: bool,
    pub total_processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub sessions: EntityCounts,
    pub tool_metrics: EntityCounts,
    pub errors: Vec<ImportError>,
    /// None for dry runs and aborted runs
    pub checksum_validation: Option<ChecksumValidation>,
    /// Whether this run continued from a checkpoint
    pub resumed: bool,
    pub dry_run: bool,
    pub duration_ms: u64,
}

/// Mutable state of one run
struct RunState {
    run_id: String,
    source_checksum: String,
    sessions: EntityCounts,
    tool_metrics: EntityCounts,
    errors: Vec<ImportError>,
    started: Instant,
    /// Records written by this process (excludes checkpointed work)
    processed_this_run: usize,
}

impl RunState {
    fn counts_mut(&mut self, kind: EntityKind) -> &mut EntityCounts {
        match kind {
            EntityKind::Session => &mut self.sessions,
            EntityKind::ToolMetric => &mut self.tool_metrics,
        }
    }

    fn checkpoint(&self, options: &ImportOptions) -> Checkpoint {
        Checkpoint {
            run_id: self.run_id.clone(),
            source_checksum: self.source_checksum.clone(),
            sessions: self.sessions,
            tool_metrics: self.tool_metrics,
            errors: self.errors.clone(),
            options: options.clone(),
            updated_at: Utc::now(),
        }
    }
}

enum Flow {
    Completed,
    Aborted,
}

/// Writes sessions and tool metrics into a sink in checkpointed batches.
pub struct BulkImporter<S> {
    sink: S,
    options: ImportOptions,
    validator: Validator,
    checkpoints: CheckpointStore,
}

impl<S: ImportSink> BulkImporter<S> {
    pub fn new(sink: S, options: ImportOptions) -> Self {
        let checkpoints = CheckpointStore::new(options.checkpoint_dir.clone());
        Self {
            sink,
            options,
            validator: Validator::new(),
            checkpoints,
        }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn import(&self, sessions: &[Session], tool_metrics: &[ToolMetric]) -> Result<ImportResult> {
        self.import_with_progress(sessions, tool_metrics, |_| {})
    }

    /// Import with a callback invoked after every batch.
    ///
    /// Expected failures end up in [`ImportResult::errors`]; only failures
    /// of the surrounding machinery (checkpoint IO, checksum reads) return
    /// `Err`.
    pub fn import_with_progress<F>(
        &self,
        sessions: &[Session],
        tool_metrics: &[ToolMetric],
        mut on_progress: F,
    ) -> Result<ImportResult>
    where
        F: FnMut(&ImportProgress),
    {
        if self.options.batch_size == 0 {
            return Err(Error::Config("import batch_size must be at least 1".to_string()));
        }

        let source_checksum = checksum::dataset_checksum(sessions, tool_metrics)?;
        let resumed = self.load_checkpoint(&source_checksum)?;
        let is_resumed = resumed.is_some();

        let mut state = match resumed {
            Some(cp) => {
                tracing::info!(
                    run_id = %cp.run_id,
                    sessions_next_batch = cp.sessions.next_batch,
                    tool_metrics_next_batch = cp.tool_metrics.next_batch,
                    "Resuming import from checkpoint"
                );
                RunState {
                    run_id: cp.run_id,
                    source_checksum,
                    sessions: cp.sessions,
                    tool_metrics: cp.tool_metrics,
                    errors: cp.errors,
                    started: Instant::now(),
                    processed_this_run: 0,
                }
            }
            None => RunState {
                run_id: self
                    .options
                    .run_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                source_checksum,
                sessions: EntityCounts::default(),
                tool_metrics: EntityCounts::default(),
                errors: Vec::new(),
                started: Instant::now(),
                processed_this_run: 0,
            },
        };

        tracing::info!(
            run_id = %state.run_id,
            sessions = sessions.len(),
            tool_metrics = tool_metrics.len(),
            batch_size = self.options.batch_size,
            dry_run = self.options.dry_run,
            schema = %self.options.schema,
            "Starting import"
        );

        if self.options.validate_before_insert && !self.validate_sample(sessions, tool_metrics, &mut state) {
            return Ok(self.finish(state, false, None, is_resumed));
        }

        let flow = match self.import_entity(sessions, &mut state, &mut on_progress)? {
            Flow::Completed => self.import_entity(tool_metrics, &mut state, &mut on_progress)?,
            Flow::Aborted => Flow::Aborted,
        };
        let completed = matches!(flow, Flow::Completed);

        let checksum_validation = if completed && !self.options.dry_run {
            Some(self.destination_checksum(sessions, tool_metrics, &state.source_checksum)?)
        } else {
            None
        };

        Ok(self.finish(state, completed, checksum_validation, is_resumed))
    }

    fn load_checkpoint(&self, source_checksum: &str) -> Result<Option<Checkpoint>> {
        if !self.options.checkpoint_enabled || self.options.dry_run {
            return Ok(None);
        }

        let found = match &self.options.run_id {
            Some(run_id) => self.checkpoints.load(run_id)?,
            None => self.checkpoints.find_matching(source_checksum)?,
        };

        Ok(found.filter(|cp| {
            let matches = cp.source_checksum == source_checksum;
            if !matches {
                tracing::warn!(
                    run_id = %cp.run_id,
                    "Checkpoint belongs to different input, starting over"
                );
            }
            matches
        }))
    }

    /// Validate the first sessions plus their metrics (and any true orphans).
    ///
    /// Returns false and records the errors when validation fails.
    fn validate_sample(
        &self,
        sessions: &[Session],
        tool_metrics: &[ToolMetric],
        state: &mut RunState,
    ) -> bool {
        let sampled: Vec<Session> = sessions
            .iter()
            .take(self.options.validation_sample)
            .cloned()
            .collect();
        let sampled_ids: HashSet<&str> = sampled.iter().map(|s| s.id.as_str()).collect();
        let all_ids: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        let sampled_metrics: Vec<ToolMetric> = tool_metrics
            .iter()
            .filter(|m| {
                sampled_ids.contains(m.session_id.as_str())
                    || !all_ids.contains(m.session_id.as_str())
            })
            .cloned()
            .collect();

        let report = self.validator.validate(&sampled, &sampled_metrics);
        if report.is_valid {
            if !report.warnings.is_empty() {
                tracing::warn!(warnings = report.warnings.len(), "Pre-import validation warnings");
            }
            return true;
        }

        tracing::error!(
            errors = report.errors.len(),
            "Pre-import validation failed, aborting import"
        );
        state
            .errors
            .extend(report.errors.into_iter().map(|issue| ImportError {
                origin: ErrorOrigin::Validation,
                batch_index: None,
                record_id: issue.record_id,
                message: format!("{}: {}", issue.rule, issue.message),
                retryable: false,
            }));
        false
    }

    fn import_entity<R, F>(
        &self,
        records: &[R],
        state: &mut RunState,
        on_progress: &mut F,
    ) -> Result<Flow>
    where
        R: Importable,
        F: FnMut(&ImportProgress),
    {
        let kind = R::KIND;
        let batch_size = self.options.batch_size;
        let total_batches = records.len().div_ceil(batch_size);
        let first = state.counts_mut(kind).next_batch;

        for batch_index in first..total_batches {
            let start = batch_index * batch_size;
            let batch = &records[start..(start + batch_size).min(records.len())];

            let before = *state.counts_mut(kind);
            let errors_before = state.errors.len();

            let (written, errors) = if self.options.dry_run {
                std::thread::sleep(Duration::from_millis(self.options.dry_run_batch_delay_ms));
                let simulated = WriteCounts {
                    inserted: batch.len(),
                    ..Default::default()
                };
                (simulated, Vec::new())
            } else {
                self.write_batch(batch, batch_index)
            };
            let batch_failed = !errors.is_empty();

            {
                let counts = state.counts_mut(kind);
                counts.next_batch = batch_index + 1;
                counts.processed += batch.len();
                counts.inserted += written.inserted;
                counts.updated += written.updated;
                counts.skipped += written.skipped;
            }
            state.errors.extend(errors);
            state.processed_this_run += batch.len();

            on_progress(&self.progress(kind, records.len(), batch_index, total_batches, state));

            if batch_failed && !self.options.continue_on_error {
                tracing::error!(
                    entity = %kind,
                    batch_index,
                    "Batch had unrecoverable records, aborting import"
                );
                if self.checkpointing() {
                    // Resume retries this batch, so record the state before it.
                    let mut cp = state.checkpoint(&self.options);
                    match kind {
                        EntityKind::Session => cp.sessions = before,
                        EntityKind::ToolMetric => cp.tool_metrics = before,
                    }
                    cp.errors.truncate(errors_before);
                    self.checkpoints.save(&cp)?;
                }
                return Ok(Flow::Aborted);
            }

            if self.checkpointing() && (batch_index + 1) % self.options.checkpoint_interval.max(1) == 0
            {
                self.checkpoints.save(&state.checkpoint(&self.options))?;
            }
        }

        Ok(Flow::Completed)
    }

    fn checkpointing(&self) -> bool {
        self.options.checkpoint_enabled && !self.options.dry_run
    }

    /// One bulk write, falling back to per-record writes on failure
    fn write_batch<R: Importable>(&self, batch: &[R], batch_index: usize) -> (WriteCounts, Vec<ImportError>) {
        let schema = self.options.schema.as_str();
        let mode = self.options.mode;

        let bulk_err = match R::write(&self.sink, schema, batch, mode) {
            Ok(counts) => return (counts, Vec::new()),
            Err(e) => e,
        };

        tracing::warn!(
            entity = %R::KIND,
            batch_index,
            error = %bulk_err,
            "Bulk write failed, retrying records individually"
        );

        let mut counts = WriteCounts::default();
        let mut errors = Vec::new();
        for record in batch {
            match R::write(&self.sink, schema, std::slice::from_ref(record), mode) {
                Ok(c) => counts.add(c),
                Err(e) => {
                    tracing::warn!(
                        entity = %R::KIND,
                        batch_index,
                        record_id = record.id(),
                        error = %e,
                        "Record write failed"
                    );
                    errors.push(ImportError {
                        origin: ErrorOrigin::for_record(R::KIND, &e),
                        batch_index: Some(batch_index),
                        record_id: Some(record.id().to_string()),
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
        (counts, errors)
    }

    fn progress(
        &self,
        entity: EntityKind,
        total: usize,
        batch_index: usize,
        total_batches: usize,
        state: &RunState,
    ) -> ImportProgress {
        let processed = match entity {
            EntityKind::Session => state.sessions.processed,
            EntityKind::ToolMetric => state.tool_metrics.processed,
        };
        let elapsed = state.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            state.processed_this_run as f64 / secs
        } else {
            0.0
        };
        let remaining = total.saturating_sub(processed);
        let eta_ms = (throughput > 0.0).then(|| (remaining as f64 / throughput * 1000.0) as u64);

        ImportProgress {
            entity,
            processed,
            total,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput,
            eta_ms,
            batch_index,
            total_batches,
            dry_run: self.options.dry_run,
        }
    }

    /// Re-read imported rows by id and checksum them like the source
    fn destination_checksum(
        &self,
        sessions: &[Session],
        tool_metrics: &[ToolMetric],
        source: &str,
    ) -> Result<ChecksumValidation> {
        let schema = self.options.schema.as_str();
        let session_ids = unique_ids(sessions);
        let metric_ids = unique_ids(tool_metrics);

        let stored_sessions = Session::fetch(&self.sink, schema, &session_ids)?;
        let stored_metrics = ToolMetric::fetch(&self.sink, schema, &metric_ids)?;
        let missing_rows = (session_ids.len() - stored_sessions.len().min(session_ids.len()))
            + (metric_ids.len() - stored_metrics.len().min(metric_ids.len()));

        let destination = checksum::dataset_checksum(&stored_sessions, &stored_metrics)?;
        let matches = destination == source;
        if !matches {
            tracing::warn!(missing_rows, "Destination checksum does not match source");
        }

        Ok(ChecksumValidation {
            source: source.to_string(),
            destination,
            matches,
            missing_rows,
        })
    }

    fn finish(
        &self,
        state: RunState,
        completed: bool,
        checksum_validation: Option<ChecksumValidation>,
        resumed: bool,
    ) -> ImportResult {
        let inserted = state.sessions.inserted + state.tool_metrics.inserted;
        let updated = state.sessions.updated + state.tool_metrics.updated;
        let skipped = state.sessions.skipped + state.tool_metrics.skipped;
        let success = state.errors.is_empty()
            || (completed && self.options.continue_on_error && inserted + updated > 0);

        if completed && state.errors.is_empty() && self.checkpointing() {
            if let Err(e) = self.checkpoints.delete(&state.run_id) {
                tracing::warn!(run_id = %state.run_id, error = %e, "Failed to delete checkpoint");
            }
        }

        let result = ImportResult {
            run_id: state.run_id,
            success,
            total_processed: state.sessions.processed + state.tool_metrics.processed,
            inserted,
            updated,
            skipped,
            sessions: state.sessions,
            tool_metrics: state.tool_metrics,
            errors: state.errors,
            checksum_validation,
            resumed,
            dry_run: self.options.dry_run,
            duration_ms: state.started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            run_id = %result.run_id,
            success = result.success,
            processed = result.total_processed,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "Import finished"
        );
        result
    }
}

fn unique_ids<R: Record>(records: &[R]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|r| r.id())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}
