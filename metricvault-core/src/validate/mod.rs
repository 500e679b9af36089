//! Rule-based data validation
//!
//! Three rule families are evaluated against an in-memory data set:
//! per-session rules, per-tool-metric rules, and business rules over the
//! whole set. Rules are plain `(name, severity, check)` entries (see
//! [`rules`]), so adding one never touches the evaluation loop.
//!
//! Validation always produces a report. A rule that returns an error or
//! panics is reported as an error attributed to that rule.

mod post_import;
pub mod rules;

pub use post_import::{CountCheck, FieldMismatch, PostImportReport, PostImportValidator};

use crate::types::{Session, ToolMetric};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

/// How much a failed rule matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks the write when pre-import validation is enabled
    Error,
    /// Reported only
    Warning,
}

/// One problem found by a rule, before severity is attached
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Finding {
    pub message: String,
    pub record_id: Option<String>,
    pub field: Option<String>,
    pub value: Option<serde_json::Value>,
    pub suggestion: Option<String>,
}

impl Finding {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Outcome of one rule check
pub type CheckResult = std::result::Result<Vec<Finding>, String>;

/// Data visible to every rule
pub struct RuleContext<'a> {
    /// Reference time for "in the future" checks
    pub now: DateTime<Utc>,
    pub sessions: &'a [Session],
    pub tool_metrics: &'a [ToolMetric],
}

/// A rule evaluated once per record of type `T`
pub struct Rule<T> {
    pub name: &'static str,
    pub severity: Severity,
    pub check: fn(&T, &RuleContext<'_>) -> CheckResult,
}

/// A rule evaluated once over the whole data set
pub struct BusinessRule {
    pub name: &'static str,
    pub severity: Severity,
    pub check: fn(&RuleContext<'_>) -> CheckResult,
}

/// Result of one rule evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Cross-record integrity figures for the validated set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityChecks {
    pub orphaned_tool_metrics: usize,
    pub duplicate_session_ids: usize,
    pub duplicate_tool_metric_ids: usize,
    pub sessions_without_metrics: usize,
    pub mean_productivity: Option<f64>,
    pub avg_metrics_per_session: f64,
}

impl IntegrityChecks {
    pub fn compute(sessions: &[Session], tool_metrics: &[ToolMetric]) -> Self {
        let session_ids: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();

        let mut metrics_per_session: HashMap<&str, usize> = HashMap::new();
        let mut orphaned = 0;
        for m in tool_metrics {
            if session_ids.contains(m.session_id.as_str()) {
                *metrics_per_session.entry(m.session_id.as_str()).or_default() += 1;
            } else {
                orphaned += 1;
            }
        }

        let scores: Vec<f64> = sessions.iter().filter_map(|s| s.productivity_score).collect();
        let mean_productivity = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        Self {
            orphaned_tool_metrics: orphaned,
            duplicate_session_ids: duplicates(sessions.iter().map(|s| s.id.as_str())).len(),
            duplicate_tool_metric_ids: duplicates(tool_metrics.iter().map(|m| m.id.as_str())).len(),
            sessions_without_metrics: session_ids
                .iter()
                .filter(|id| !metrics_per_session.contains_key(*id))
                .count(),
            mean_productivity,
            avg_metrics_per_session: if sessions.is_empty() {
                0.0
            } else {
                (tool_metrics.len() - orphaned) as f64 / session_ids.len() as f64
            },
        }
    }
}

/// Ids that occur more than once, in first-seen order
pub(crate) fn duplicates<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut dups = Vec::new();
    for id in ids {
        if !seen.insert(id) && reported.insert(id) {
            dups.push(id);
        }
    }
    dups
}

/// Bookkeeping for one validation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationStatistics {
    pub sessions_checked: usize,
    pub tool_metrics_checked: usize,
    pub rules_evaluated: usize,
    /// Rules that errored or panicked
    pub rule_failures: usize,
    pub duration_ms: u64,
}

/// Full validation result. `is_valid` iff there are no errors.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub integrity: IntegrityChecks,
    pub statistics: ValidationStatistics,
}

impl ValidationReport {
    /// Issues of both severities attributed to one rule
    pub fn issues_for(&self, rule: &str) -> impl Iterator<Item = &ValidationIssue> {
        let rule = rule.to_string();
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .filter(move |i| i.rule == rule)
    }
}

/// Evaluates the rule tables over sessions and tool metrics.
pub struct Validator {
    session_rules: Vec<Rule<Session>>,
    tool_metric_rules: Vec<Rule<ToolMetric>>,
    business_rules: Vec<BusinessRule>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    /// Validator with the built-in rule set
    pub fn new() -> Self {
        Self {
            session_rules: rules::session_rules(),
            tool_metric_rules: rules::tool_metric_rules(),
            business_rules: rules::business_rules(),
        }
    }

    pub fn with_session_rule(mut self, rule: Rule<Session>) -> Self {
        self.session_rules.push(rule);
        self
    }

    pub fn with_tool_metric_rule(mut self, rule: Rule<ToolMetric>) -> Self {
        self.tool_metric_rules.push(rule);
        self
    }

    pub fn with_business_rule(mut self, rule: BusinessRule) -> Self {
        self.business_rules.push(rule);
        self
    }

    pub fn validate(&self, sessions: &[Session], tool_metrics: &[ToolMetric]) -> ValidationReport {
        self.validate_at(sessions, tool_metrics, Utc::now())
    }

    /// Validate against an explicit reference time
    pub fn validate_at(
        &self,
        sessions: &[Session],
        tool_metrics: &[ToolMetric],
        now: DateTime<Utc>,
    ) -> ValidationReport {
        let started = Instant::now();
        let ctx = RuleContext {
            now,
            sessions,
            tool_metrics,
        };
        let mut acc = Accumulator::default();

        for session in sessions {
            for rule in &self.session_rules {
                acc.apply(rule.name, rule.severity, Some(&session.id), || {
                    (rule.check)(session, &ctx)
                });
            }
        }

        for metric in tool_metrics {
            for rule in &self.tool_metric_rules {
                acc.apply(rule.name, rule.severity, Some(&metric.id), || {
                    (rule.check)(metric, &ctx)
                });
            }
        }

        for rule in &self.business_rules {
            acc.apply(rule.name, rule.severity, None, || (rule.check)(&ctx));
        }

        let report = ValidationReport {
            is_valid: acc.errors.is_empty(),
            integrity: IntegrityChecks::compute(sessions, tool_metrics),
            statistics: ValidationStatistics {
                sessions_checked: sessions.len(),
                tool_metrics_checked: tool_metrics.len(),
                rules_evaluated: acc.evaluated,
                rule_failures: acc.failures,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            errors: acc.errors,
            warnings: acc.warnings,
        };

        tracing::debug!(
            sessions = sessions.len(),
            tool_metrics = tool_metrics.len(),
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Validation pass complete"
        );
        report
    }
}

#[derive(Default)]
struct Accumulator {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    evaluated: usize,
    failures: usize,
}

impl Accumulator {
    fn apply(
        &mut self,
        rule: &'static str,
        severity: Severity,
        record_id: Option<&str>,
        check: impl FnOnce() -> CheckResult,
    ) {
        self.evaluated += 1;

        let outcome = match catch_unwind(AssertUnwindSafe(check)) {
            Ok(outcome) => outcome,
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match outcome {
            Ok(findings) => {
                for finding in findings {
                    let issue = ValidationIssue {
                        rule: rule.to_string(),
                        severity,
                        message: finding.message,
                        record_id: finding.record_id.or_else(|| record_id.map(str::to_string)),
                        field: finding.field,
                        value: finding.value,
                        suggestion: finding.suggestion,
                    };
                    match severity {
                        Severity::Error => self.errors.push(issue),
                        Severity::Warning => self.warnings.push(issue),
                    }
                }
            }
            Err(message) => {
                self.failures += 1;
                tracing::warn!(rule, record_id, error = %message, "Validation rule failed");
                self.errors.push(ValidationIssue {
                    rule: rule.to_string(),
                    severity: Severity::Error,
                    message: format!("rule failed: {}", message),
                    record_id: record_id.map(str::to_string),
                    field: None,
                    value: None,
                    suggestion: None,
                });
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "rule panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_data {
    use crate::types::{Session, SessionType, ToolMetric};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub fn reference_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    pub fn session(id: &str) -> Session {
        let start = reference_time() - Duration::days(1);
        Session {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            start_time: start,
            end_time: Some(start + Duration::hours(1)),
            duration_ms: 3_600_000,
            tools_used: vec!["Bash".to_string()],
            productivity_score: Some(70.0),
            session_type: SessionType::Development,
            project_id: None,
            tags: vec![],
            interruptions: 1,
            focus_time_ms: 1_800_000,
            description: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn metric(id: &str, session_id: &str) -> ToolMetric {
        ToolMetric {
            id: id.to_string(),
            session_id: session_id.to_string(),
            tool_name: "Bash".to_string(),
            tool_category: None,
            recorded_at: reference_time() - Duration::hours(23),
            execution_count: 4,
            total_duration_ms: 400,
            average_duration_ms: Some(100.0),
            success_rate: 1.0,
            error_count: 0,
            memory_usage_mb: None,
            cpu_usage_percent: None,
            parameters: serde_json::json!({}),
            output_size_bytes: None,
            command_line: None,
            working_directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_data::*;
    use super::*;

    #[test]
    fn test_clean_data_is_valid() {
        let sessions = vec![session("s-1"), session("s-2")];
        let metrics = vec![metric("m-1", "s-1"), metric("m-2", "s-2")];

        let report = Validator::new().validate_at(&sessions, &metrics, reference_time());
        assert!(report.is_valid, "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
        assert_eq!(report.statistics.sessions_checked, 2);
        assert_eq!(report.statistics.tool_metrics_checked, 2);
        assert_eq!(report.integrity.avg_metrics_per_session, 1.0);
    }

    #[test]
    fn test_orphan_metric_is_error() {
        let sessions = vec![session("s-1")];
        let metrics = vec![metric("m-1", "s-1"), metric("m-2", "ghost")];

        let report = Validator::new().validate_at(&sessions, &metrics, reference_time());
        assert!(!report.is_valid);
        let orphan: Vec<_> = report.issues_for("orphan_tool_metrics").collect();
        assert_eq!(orphan.len(), 1);
        assert_eq!(orphan[0].record_id.as_deref(), Some("m-2"));
        assert_eq!(report.integrity.orphaned_tool_metrics, 1);
    }

    #[test]
    fn test_end_not_after_start_is_error() {
        let mut equal = session("s-1");
        equal.end_time = Some(equal.start_time);
        let mut before = session("s-2");
        before.end_time = Some(before.start_time - chrono::Duration::minutes(5));

        let report = Validator::new().validate_at(&[equal, before], &[], reference_time());
        assert!(!report.is_valid);
        let ids: Vec<_> = report
            .issues_for("end_after_start")
            .map(|i| i.record_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["s-1", "s-2"]);
    }

    #[test]
    fn test_warnings_do_not_invalidate() {
        let mut busy = session("s-1");
        busy.interruptions = 150;
        let report = Validator::new().validate_at(&[busy], &[metric("m-1", "s-1")], reference_time());

        assert!(report.is_valid);
        assert_eq!(report.issues_for("interruption_sanity").count(), 1);
        assert_eq!(report.warnings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_panicking_rule_is_reported_not_propagated() {
        fn explode(_: &Session, _: &RuleContext<'_>) -> CheckResult {
            panic!("boom");
        }
        fn refuse(_: &RuleContext<'_>) -> CheckResult {
            Err("lookup table unavailable".to_string())
        }

        let validator = Validator::new()
            .with_session_rule(Rule {
                name: "explosive",
                severity: Severity::Warning,
                check: explode,
            })
            .with_business_rule(BusinessRule {
                name: "refusing",
                severity: Severity::Warning,
                check: refuse,
            });

        let report = validator.validate_at(&[session("s-1")], &[metric("m-1", "s-1")], reference_time());
        assert!(!report.is_valid);
        assert_eq!(report.statistics.rule_failures, 2);

        let exploded: Vec<_> = report.issues_for("explosive").collect();
        assert_eq!(exploded.len(), 1);
        assert_eq!(exploded[0].severity, Severity::Error);
        assert!(exploded[0].message.contains("boom"));
        assert_eq!(exploded[0].record_id.as_deref(), Some("s-1"));

        assert!(report
            .issues_for("refusing")
            .any(|i| i.message.contains("lookup table unavailable")));
    }

    #[test]
    fn test_duplicates_helper() {
        let ids = ["a", "b", "a", "c", "a", "b"];
        assert_eq!(duplicates(ids.iter().copied()), vec!["a", "b"]);
    }
}
