//! Legacy migration runner
//!
//! Sequences one migration: full validation of the source data, the bulk
//! import, and a sampled post-import verification. Each stage's report is
//! kept in the final [`MigrationReport`].

use std::time::Instant;

use serde::Serialize;

use crate::error::Result;
use crate::import::{BulkImporter, ImportOptions, ImportProgress, ImportResult, ImportSink};
use crate::legacy::LegacyDataset;
use crate::validate::{PostImportReport, PostImportValidator, ValidationReport, Validator};

/// Overall outcome of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Completed,
    /// Imported, but with record errors or verification findings
    CompletedWithErrors,
    ValidationFailed,
    ImportFailed,
}

impl MigrationStatus {
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::CompletedWithErrors
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    /// Problems found while reading the legacy files
    pub source_warnings: Vec<String>,
    pub validation: Option<ValidationReport>,
    pub import: Option<ImportResult>,
    pub post_import: Option<PostImportReport>,
    pub duration_ms: u64,
}

/// Runs validate → import → verify against one sink
pub struct MigrationRunner<S> {
    sink: S,
    options: ImportOptions,
    validator: Validator,
    post_import_sample: usize,
}

impl<S: ImportSink> MigrationRunner<S> {
    pub fn new(sink: S, options: ImportOptions) -> Self {
        Self {
            sink,
            options,
            validator: Validator::new(),
            post_import_sample: 10,
        }
    }

    pub fn with_post_import_sample(mut self, sample: usize) -> Self {
        self.post_import_sample = sample;
        self
    }

    pub fn run(&self, data: &LegacyDataset) -> Result<MigrationReport> {
        self.run_with_progress(data, |_| {})
    }

    pub fn run_with_progress<F>(&self, data: &LegacyDataset, on_progress: F) -> Result<MigrationReport>
    where
        F: FnMut(&ImportProgress),
    {
        let started = Instant::now();
        let mut report = MigrationReport {
            status: MigrationStatus::Completed,
            source_warnings: data.warnings.clone(),
            validation: None,
            import: None,
            post_import: None,
            duration_ms: 0,
        };

        let mut import_options = self.options.clone();
        if self.options.validate_before_insert {
            let validation = self.validator.validate(&data.sessions, &data.tool_metrics);
            let valid = validation.is_valid;
            tracing::info!(
                valid,
                errors = validation.errors.len(),
                warnings = validation.warnings.len(),
                "Pre-migration validation complete"
            );
            report.validation = Some(validation);

            if !valid {
                report.status = MigrationStatus::ValidationFailed;
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(report);
            }
            // The whole set has been checked; skip the importer's sample pass
            import_options.validate_before_insert = false;
        }

        let importer = BulkImporter::new(&self.sink, import_options);
        let result = importer.import_with_progress(&data.sessions, &data.tool_metrics, on_progress)?;

        if !result.success {
            report.status = MigrationStatus::ImportFailed;
        } else if !result.errors.is_empty() {
            report.status = MigrationStatus::CompletedWithErrors;
        }

        if result.success && !result.dry_run {
            let verification = PostImportValidator::new(&self.sink, &self.options.schema)
                .with_sample_size(self.post_import_sample)
                .verify(&data.sessions, &data.tool_metrics)?;
            if !verification.is_valid && report.status == MigrationStatus::Completed {
                report.status = MigrationStatus::CompletedWithErrors;
            }
            report.post_import = Some(verification);
        }

        report.import = Some(result);
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            status = ?report.status,
            duration_ms = report.duration_ms,
            "Migration finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::test_data::{metric, session};
    use crate::{Database, EntityKind};
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database, ImportOptions) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let options = ImportOptions {
            batch_size: 2,
            checkpoint_dir: dir.path().join("checkpoints"),
            dry_run_batch_delay_ms: 0,
            ..Default::default()
        };
        (dir, db, options)
    }

    fn dataset() -> LegacyDataset {
        LegacyDataset {
            sessions: vec![session("s-1"), session("s-2"), session("s-3")],
            tool_metrics: vec![metric("m-1", "s-1"), metric("m-2", "s-2")],
            warnings: vec!["sessions.jsonl:4: expected value".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_migration_completes() {
        let (_dir, db, options) = setup();
        let runner = MigrationRunner::new(&db, options);

        let report = runner.run(&dataset()).unwrap();
        assert_eq!(report.status, MigrationStatus::Completed);
        assert_eq!(report.source_warnings.len(), 1);
        assert_eq!(report.import.as_ref().unwrap().inserted, 5);
        assert!(report.post_import.as_ref().unwrap().is_valid);
        assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 3);
    }

    #[test]
    fn test_invalid_source_is_not_imported() {
        let (_dir, db, options) = setup();
        let mut data = dataset();
        data.sessions[1].end_time = Some(data.sessions[1].start_time - Duration::minutes(5));

        let report = MigrationRunner::new(&db, options).run(&data).unwrap();
        assert_eq!(report.status, MigrationStatus::ValidationFailed);
        assert!(!report.status.succeeded());
        assert!(report.import.is_none());
        assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 0);
    }

    #[test]
    fn test_dry_run_skips_verification() {
        let (_dir, db, mut options) = setup();
        options.dry_run = true;

        let mut batches = 0;
        let report = MigrationRunner::new(&db, options)
            .run_with_progress(&dataset(), |_| batches += 1)
            .unwrap();
        assert_eq!(report.status, MigrationStatus::Completed);
        assert!(report.post_import.is_none());
        assert_eq!(batches, 3);
        assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 0);
    }
}
