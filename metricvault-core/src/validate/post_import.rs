//! Post-import verification
//!
//! Re-reads the destination after an import: row counts for each entity,
//! plus a small evenly spaced sample of records compared field by field
//! against the source payload. Sampled, never exhaustive.

use crate::error::Result;
use crate::import::ImportSink;
use crate::types::{EntityKind, Record, Session, ToolMetric};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Expected vs actual row count for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountCheck {
    pub entity: EntityKind,
    pub expected: u64,
    pub actual: u64,
}

/// A sampled field whose stored value differs from the source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMismatch {
    pub entity: EntityKind,
    pub record_id: String,
    pub field: String,
    pub expected: Value,
    pub actual: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PostImportReport {
    pub is_valid: bool,
    pub count_checks: Vec<CountCheck>,
    pub sampled: usize,
    /// Sampled ids that were not found in the destination
    pub missing: Vec<String>,
    pub mismatches: Vec<FieldMismatch>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Verifies a finished import against its source records.
pub struct PostImportValidator<'a, S: ?Sized> {
    sink: &'a S,
    schema: &'a str,
    sample_size: usize,
}

impl<'a, S: ImportSink + ?Sized> PostImportValidator<'a, S> {
    pub fn new(sink: &'a S, schema: &'a str) -> Self {
        Self {
            sink,
            schema,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn verify(&self, sessions: &[Session], tool_metrics: &[ToolMetric]) -> Result<PostImportReport> {
        let mut report = PostImportReport::default();

        self.check_count(&mut report, EntityKind::Session, sessions)?;
        self.check_count(&mut report, EntityKind::ToolMetric, tool_metrics)?;

        let sampled_sessions = sample(sessions, self.sample_size);
        let stored: Vec<Session> = self.sink.fetch_sessions(self.schema, &ids(&sampled_sessions))?;
        compare(&mut report, &sampled_sessions, &stored, session_fields);

        let sampled_metrics = sample(tool_metrics, self.sample_size);
        let stored: Vec<ToolMetric> =
            self.sink.fetch_tool_metrics(self.schema, &ids(&sampled_metrics))?;
        compare(&mut report, &sampled_metrics, &stored, tool_metric_fields);

        for id in &report.missing {
            report.errors.push(format!("sampled record {} was not found", id));
        }
        for m in &report.mismatches {
            report.errors.push(format!(
                "{} {}: field `{}` stored as {} but source has {}",
                m.entity, m.record_id, m.field, m.actual, m.expected
            ));
        }

        report.is_valid = report.errors.is_empty();
        tracing::info!(
            schema = self.schema,
            sampled = report.sampled,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Post-import verification complete"
        );
        Ok(report)
    }

    fn check_count<R: Record>(
        &self,
        report: &mut PostImportReport,
        entity: EntityKind,
        records: &[R],
    ) -> Result<()> {
        let expected = records.iter().map(|r| r.id()).collect::<HashSet<_>>().len() as u64;
        let actual = self.sink.count_rows(self.schema, entity)?;

        if actual < expected {
            report.errors.push(format!(
                "{}: expected at least {} rows, found {}",
                entity.table(),
                expected,
                actual
            ));
        } else if actual > expected {
            report.warnings.push(format!(
                "{}: found {} rows, {} more than imported (pre-existing data?)",
                entity.table(),
                actual,
                actual - expected
            ));
        }

        report.count_checks.push(CountCheck {
            entity,
            expected,
            actual,
        });
        Ok(())
    }
}

/// Up to `n` records, evenly spaced across the input
fn sample<R: Clone>(records: &[R], n: usize) -> Vec<R> {
    if n == 0 || records.is_empty() {
        return Vec::new();
    }
    if records.len() <= n {
        return records.to_vec();
    }
    (0..n).map(|i| records[i * records.len() / n].clone()).collect()
}

fn ids<R: Record>(records: &[R]) -> Vec<String> {
    records.iter().map(|r| r.id().to_string()).collect()
}

fn compare<R: Record>(
    report: &mut PostImportReport,
    expected: &[R],
    stored: &[R],
    fields: fn(&R) -> Vec<(&'static str, Value)>,
) {
    let stored: HashMap<&str, &R> = stored.iter().map(|r| (r.id(), r)).collect();
    report.sampled += expected.len();

    for source in expected {
        let Some(actual) = stored.get(source.id()) else {
            report.missing.push(source.id().to_string());
            continue;
        };

        for ((field, want), (_, got)) in fields(source).into_iter().zip(fields(actual)) {
            if want != got {
                report.mismatches.push(FieldMismatch {
                    entity: R::KIND,
                    record_id: source.id().to_string(),
                    field: field.to_string(),
                    expected: want,
                    actual: got,
                });
            }
        }
    }
}

fn session_fields(s: &Session) -> Vec<(&'static str, Value)> {
    vec![
        ("user_id", json!(s.user_id)),
        ("start_time", json!(s.start_time)),
        ("end_time", json!(s.end_time)),
        ("duration_ms", json!(s.duration_ms)),
        ("productivity_score", json!(s.productivity_score)),
        ("session_type", json!(s.session_type)),
    ]
}

fn tool_metric_fields(m: &ToolMetric) -> Vec<(&'static str, Value)> {
    vec![
        ("session_id", json!(m.session_id)),
        ("tool_name", json!(m.tool_name)),
        ("execution_count", json!(m.execution_count)),
        ("total_duration_ms", json!(m.total_duration_ms)),
        ("success_rate", json!(m.success_rate)),
    ]
}

#[cfg(test)]
mod tests {
    use super::super::test_data::*;
    use super::*;
    use crate::import::WriteMode;
    use crate::Database;

    fn seeded(sessions: &[Session], metrics: &[ToolMetric]) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.write_sessions("main", sessions, WriteMode::Upsert).unwrap();
        db.write_tool_metrics("main", metrics, WriteMode::Upsert)
            .unwrap();
        db
    }

    #[test]
    fn test_clean_import_verifies() {
        let sessions: Vec<_> = (0..25).map(|i| session(&format!("s-{}", i))).collect();
        let metrics: Vec<_> = (0..25)
            .map(|i| metric(&format!("m-{}", i), &format!("s-{}", i)))
            .collect();
        let db = seeded(&sessions, &metrics);

        let report = PostImportValidator::new(&db, "main")
            .verify(&sessions, &metrics)
            .unwrap();
        assert!(report.is_valid, "errors: {:?}", report.errors);
        assert_eq!(report.sampled, 20);
        assert_eq!(report.count_checks[0].actual, 25);
    }

    #[test]
    fn test_missing_rows_and_mismatches() {
        let sessions = vec![session("s-1"), session("s-2")];
        let db = seeded(&sessions[..1], &[]);

        let mut source = sessions.clone();
        source[0].user_id = "someone-else".to_string();

        let report = PostImportValidator::new(&db, "main")
            .verify(&source, &[])
            .unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.missing, vec!["s-2"]);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].field, "user_id");
        assert!(report.errors.iter().any(|e| e.contains("expected at least 2")));
    }

    #[test]
    fn test_extra_rows_only_warn() {
        let sessions = vec![session("s-1"), session("s-2")];
        let db = seeded(&sessions, &[]);

        let report = PostImportValidator::new(&db, "main")
            .with_sample_size(1)
            .verify(&sessions[..1], &[])
            .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.sampled, 1);
    }

    #[test]
    fn test_sample_is_evenly_spaced() {
        let data: Vec<usize> = (0..100).collect();
        assert_eq!(sample(&data, 4), vec![0, 25, 50, 75]);
        assert_eq!(sample(&data[..3], 10), vec![0, 1, 2]);
        assert!(sample(&data, 0).is_empty());
    }
}
