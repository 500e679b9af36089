//! Built-in validation rules
//!
//! Each family is a table of `(name, severity, check)` entries. Checks
//! return findings; severity is applied by the validator.

use super::{duplicates, BusinessRule, CheckResult, Finding, Rule, RuleContext, Severity};
use crate::types::{Session, ToolMetric};
use std::collections::{HashMap, HashSet};

const MAX_SESSION_HOURS: i64 = 24;
const MAX_INTERRUPTIONS: i64 = 100;
/// Allowed relative drift between the recorded and computed average duration
const AVERAGE_TOLERANCE: f64 = 0.10;
/// Share of sessions without tool metrics that triggers a warning
const MAX_EMPTY_SESSION_RATIO: f64 = 0.5;
const PRODUCTIVITY_MEAN_RANGE: (f64, f64) = (10.0, 90.0);
const MAX_METRICS_PER_SESSION: f64 = 50.0;

pub fn session_rules() -> Vec<Rule<Session>> {
    vec![
        Rule {
            name: "session_required_fields",
            severity: Severity::Error,
            check: session_required_fields,
        },
        Rule {
            name: "end_after_start",
            severity: Severity::Error,
            check: end_after_start,
        },
        Rule {
            name: "start_not_in_future",
            severity: Severity::Error,
            check: start_not_in_future,
        },
        Rule {
            name: "productivity_range",
            severity: Severity::Error,
            check: productivity_range,
        },
        Rule {
            name: "session_non_negative",
            severity: Severity::Error,
            check: session_non_negative,
        },
        Rule {
            name: "duration_sanity",
            severity: Severity::Warning,
            check: duration_sanity,
        },
        Rule {
            name: "interruption_sanity",
            severity: Severity::Warning,
            check: interruption_sanity,
        },
    ]
}

pub fn tool_metric_rules() -> Vec<Rule<ToolMetric>> {
    vec![
        Rule {
            name: "tool_metric_required_fields",
            severity: Severity::Error,
            check: tool_metric_required_fields,
        },
        Rule {
            name: "tool_metric_non_negative",
            severity: Severity::Error,
            check: tool_metric_non_negative,
        },
        Rule {
            name: "success_rate_range",
            severity: Severity::Error,
            check: success_rate_range,
        },
        Rule {
            name: "duration_consistency",
            severity: Severity::Warning,
            check: duration_consistency,
        },
        Rule {
            name: "error_count_consistency",
            severity: Severity::Warning,
            check: error_count_consistency,
        },
    ]
}

pub fn business_rules() -> Vec<BusinessRule> {
    vec![
        BusinessRule {
            name: "orphan_tool_metrics",
            severity: Severity::Error,
            check: orphan_tool_metrics,
        },
        BusinessRule {
            name: "unique_ids",
            severity: Severity::Error,
            check: unique_ids,
        },
        BusinessRule {
            name: "sessions_without_metrics",
            severity: Severity::Warning,
            check: sessions_without_metrics,
        },
        BusinessRule {
            name: "productivity_mean",
            severity: Severity::Warning,
            check: productivity_mean,
        },
        BusinessRule {
            name: "metrics_per_session",
            severity: Severity::Warning,
            check: metrics_per_session,
        },
    ]
}

fn missing(field: &str) -> Finding {
    Finding::new(format!("required field `{}` is empty", field)).field(field)
}

// ============================================
// Session rules
// ============================================

fn session_required_fields(s: &Session, _: &RuleContext<'_>) -> CheckResult {
    let mut findings = Vec::new();
    if s.id.trim().is_empty() {
        findings.push(missing("id"));
    }
    if s.user_id.trim().is_empty() {
        findings.push(missing("user_id"));
    }
    Ok(findings)
}

fn end_after_start(s: &Session, _: &RuleContext<'_>) -> CheckResult {
    Ok(match s.end_time {
        Some(end) if end <= s.start_time => vec![Finding::new(format!(
            "session ends at {} which is not after its start {}",
            end.to_rfc3339(),
            s.start_time.to_rfc3339()
        ))
        .field("end_time")
        .value(end.to_rfc3339())],
        _ => vec![],
    })
}

fn start_not_in_future(s: &Session, ctx: &RuleContext<'_>) -> CheckResult {
    if s.start_time > ctx.now {
        Ok(vec![Finding::new("session starts in the future")
            .field("start_time")
            .value(s.start_time.to_rfc3339())
            .suggest("check the clock of the machine that produced this session")])
    } else {
        Ok(vec![])
    }
}

fn productivity_range(s: &Session, _: &RuleContext<'_>) -> CheckResult {
    match s.productivity_score {
        Some(score) if !(0.0..=100.0).contains(&score) || score.is_nan() => {
            Ok(vec![Finding::new("productivity score must be within 0-100")
                .field("productivity_score")
                .value(score)])
        }
        _ => Ok(vec![]),
    }
}

fn session_non_negative(s: &Session, _: &RuleContext<'_>) -> CheckResult {
    let fields = [
        ("duration_ms", s.duration_ms),
        ("interruptions", s.interruptions),
        ("focus_time_ms", s.focus_time_ms),
    ];
    Ok(fields
        .into_iter()
        .filter(|(_, v)| *v < 0)
        .map(|(name, v)| {
            Finding::new(format!("`{}` must not be negative", name))
                .field(name)
                .value(v)
        })
        .collect())
}

fn duration_sanity(s: &Session, _: &RuleContext<'_>) -> CheckResult {
    let span_ms = s
        .end_time
        .map(|end| (end - s.start_time).num_milliseconds())
        .unwrap_or(0);
    let longest = s.duration_ms.max(span_ms);

    if longest > MAX_SESSION_HOURS * 3_600_000 {
        Ok(vec![Finding::new(format!(
            "session lasts {:.1}h, longer than {}h",
            longest as f64 / 3_600_000.0,
            MAX_SESSION_HOURS
        ))
        .field("duration_ms")
        .value(longest)
        .suggest("sessions left open overnight are usually missing an end event")])
    } else {
        Ok(vec![])
    }
}

fn interruption_sanity(s: &Session, _: &RuleContext<'_>) -> CheckResult {
    if s.interruptions > MAX_INTERRUPTIONS {
        Ok(vec![Finding::new(format!(
            "{} interruptions in one session",
            s.interruptions
        ))
        .field("interruptions")
        .value(s.interruptions)])
    } else {
        Ok(vec![])
    }
}

// ============================================
// Tool metric rules
// ============================================

fn tool_metric_required_fields(m: &ToolMetric, _: &RuleContext<'_>) -> CheckResult {
    let mut findings = Vec::new();
    if m.id.trim().is_empty() {
        findings.push(missing("id"));
    }
    if m.session_id.trim().is_empty() {
        findings.push(missing("session_id"));
    }
    if m.tool_name.trim().is_empty() {
        findings.push(missing("tool_name"));
    }
    Ok(findings)
}

fn tool_metric_non_negative(m: &ToolMetric, _: &RuleContext<'_>) -> CheckResult {
    let mut findings: Vec<Finding> = [
        ("execution_count", m.execution_count),
        ("total_duration_ms", m.total_duration_ms),
        ("error_count", m.error_count),
    ]
    .into_iter()
    .filter(|(_, v)| *v < 0)
    .map(|(name, v)| {
        Finding::new(format!("`{}` must not be negative", name))
            .field(name)
            .value(v)
    })
    .collect();

    if let Some(avg) = m.average_duration_ms.filter(|avg| *avg < 0.0) {
        findings.push(
            Finding::new("`average_duration_ms` must not be negative")
                .field("average_duration_ms")
                .value(avg),
        );
    }
    Ok(findings)
}

fn success_rate_range(m: &ToolMetric, _: &RuleContext<'_>) -> CheckResult {
    if (0.0..=1.0).contains(&m.success_rate) {
        Ok(vec![])
    } else {
        Ok(vec![Finding::new("success rate must be within 0-1")
            .field("success_rate")
            .value(m.success_rate)
            .suggest("percentages should be divided by 100")])
    }
}

fn duration_consistency(m: &ToolMetric, _: &RuleContext<'_>) -> CheckResult {
    let Some(avg) = m.average_duration_ms else {
        return Ok(vec![]);
    };
    if m.execution_count <= 0 {
        return Ok(vec![]);
    }

    let expected = m.total_duration_ms as f64 / m.execution_count as f64;
    if (avg - expected).abs() > expected.abs() * AVERAGE_TOLERANCE {
        Ok(vec![Finding::new(format!(
            "average duration {:.1}ms differs from total/count {:.1}ms by more than {:.0}%",
            avg,
            expected,
            AVERAGE_TOLERANCE * 100.0
        ))
        .field("average_duration_ms")
        .value(avg)])
    } else {
        Ok(vec![])
    }
}

fn error_count_consistency(m: &ToolMetric, _: &RuleContext<'_>) -> CheckResult {
    if m.error_count > m.execution_count && m.execution_count >= 0 {
        Ok(vec![Finding::new(format!(
            "{} errors recorded for {} executions",
            m.error_count, m.execution_count
        ))
        .field("error_count")
        .value(m.error_count)])
    } else {
        Ok(vec![])
    }
}

// ============================================
// Business rules
// ============================================

fn orphan_tool_metrics(ctx: &RuleContext<'_>) -> CheckResult {
    let session_ids: HashSet<&str> = ctx.sessions.iter().map(|s| s.id.as_str()).collect();
    Ok(ctx
        .tool_metrics
        .iter()
        .filter(|m| !session_ids.contains(m.session_id.as_str()))
        .map(|m| {
            Finding::new(format!(
                "tool metric references unknown session {}",
                m.session_id
            ))
            .record(&m.id)
            .field("session_id")
            .value(m.session_id.as_str())
            .suggest("import the owning session first or drop the metric")
        })
        .collect())
}

fn unique_ids(ctx: &RuleContext<'_>) -> CheckResult {
    let sessions = duplicates(ctx.sessions.iter().map(|s| s.id.as_str()))
        .into_iter()
        .map(|id| Finding::new("duplicate session id").record(id).field("id"));
    let metrics = duplicates(ctx.tool_metrics.iter().map(|m| m.id.as_str()))
        .into_iter()
        .map(|id| Finding::new("duplicate tool metric id").record(id).field("id"));
    Ok(sessions.chain(metrics).collect())
}

fn sessions_without_metrics(ctx: &RuleContext<'_>) -> CheckResult {
    if ctx.sessions.is_empty() {
        return Ok(vec![]);
    }

    let with_metrics: HashSet<&str> = ctx
        .tool_metrics
        .iter()
        .map(|m| m.session_id.as_str())
        .collect();
    let empty = ctx
        .sessions
        .iter()
        .filter(|s| !with_metrics.contains(s.id.as_str()))
        .count();
    let ratio = empty as f64 / ctx.sessions.len() as f64;

    if ratio > MAX_EMPTY_SESSION_RATIO {
        Ok(vec![Finding::new(format!(
            "{} of {} sessions ({:.0}%) have no tool metrics",
            empty,
            ctx.sessions.len(),
            ratio * 100.0
        ))])
    } else {
        Ok(vec![])
    }
}

fn productivity_mean(ctx: &RuleContext<'_>) -> CheckResult {
    let scores: Vec<f64> = ctx
        .sessions
        .iter()
        .filter_map(|s| s.productivity_score)
        .collect();
    if scores.is_empty() {
        return Ok(vec![]);
    }

    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let (low, high) = PRODUCTIVITY_MEAN_RANGE;
    if mean < low || mean > high {
        Ok(vec![Finding::new(format!(
            "mean productivity score {:.1} is outside {}-{}",
            mean, low, high
        ))
        .field("productivity_score")
        .value(mean)
        .suggest("check that scores were not imported on a different scale")])
    } else {
        Ok(vec![])
    }
}

fn metrics_per_session(ctx: &RuleContext<'_>) -> CheckResult {
    if ctx.sessions.is_empty() {
        return Ok(vec![]);
    }

    let mut per_session: HashMap<&str, usize> = HashMap::new();
    for m in ctx.tool_metrics {
        *per_session.entry(m.session_id.as_str()).or_default() += 1;
    }
    let avg = ctx.tool_metrics.len() as f64 / ctx.sessions.len() as f64;

    if avg > MAX_METRICS_PER_SESSION {
        let busiest = per_session
            .iter()
            .max_by_key(|(_, n)| **n)
            .map(|(id, n)| format!(" (busiest: {} with {})", id, n))
            .unwrap_or_default();
        Ok(vec![Finding::new(format!(
            "{:.1} tool metrics per session on average{}",
            avg, busiest
        ))])
    } else {
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_data::*;
    use super::super::{ValidationReport, Validator};
    use chrono::Duration;

    fn run(
        sessions: &[crate::types::Session],
        metrics: &[crate::types::ToolMetric],
    ) -> ValidationReport {
        Validator::new().validate_at(sessions, metrics, reference_time())
    }

    #[test]
    fn test_required_fields() {
        let mut s = session("s-1");
        s.user_id = " ".to_string();
        let mut m = metric("m-1", "s-1");
        m.tool_name.clear();

        let report = run(&[s], &[m]);
        assert_eq!(report.issues_for("session_required_fields").count(), 1);
        let issue = report.issues_for("tool_metric_required_fields").next().unwrap();
        assert_eq!(issue.field.as_deref(), Some("tool_name"));
    }

    #[test]
    fn test_future_start() {
        let mut s = session("s-1");
        s.start_time = reference_time() + Duration::hours(1);
        s.end_time = Some(s.start_time + Duration::hours(1));

        let report = run(&[s], &[metric("m-1", "s-1")]);
        assert!(!report.is_valid);
        assert_eq!(report.issues_for("start_not_in_future").count(), 1);
    }

    #[test]
    fn test_productivity_out_of_range() {
        let mut s = session("s-1");
        s.productivity_score = Some(140.0);
        let report = run(&[s], &[metric("m-1", "s-1")]);
        assert_eq!(report.issues_for("productivity_range").count(), 1);
    }

    #[test]
    fn test_long_session_warns() {
        let mut s = session("s-1");
        s.start_time = reference_time() - Duration::hours(30);
        s.end_time = Some(reference_time() - Duration::hours(2));

        let report = run(&[s], &[metric("m-1", "s-1")]);
        assert!(report.is_valid);
        assert_eq!(report.issues_for("duration_sanity").count(), 1);
    }

    #[test]
    fn test_tool_metric_ranges() {
        let mut negative = metric("m-1", "s-1");
        negative.execution_count = -1;
        let mut rate = metric("m-2", "s-1");
        rate.success_rate = 95.0;

        let report = run(&[session("s-1")], &[negative, rate]);
        assert_eq!(report.issues_for("tool_metric_non_negative").count(), 1);
        assert_eq!(report.issues_for("success_rate_range").count(), 1);
    }

    #[test]
    fn test_average_tolerance() {
        let mut within = metric("m-1", "s-1");
        within.average_duration_ms = Some(109.0);
        let mut outside = metric("m-2", "s-1");
        outside.average_duration_ms = Some(111.0);

        let report = run(&[session("s-1")], &[within, outside]);
        assert!(report.is_valid);
        let drift: Vec<_> = report.issues_for("duration_consistency").collect();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].record_id.as_deref(), Some("m-2"));
    }

    #[test]
    fn test_duplicate_ids() {
        let sessions = vec![session("s-1"), session("s-1")];
        let metrics = vec![metric("m-1", "s-1"), metric("m-1", "s-1")];

        let report = run(&sessions, &metrics);
        assert!(!report.is_valid);
        assert_eq!(report.issues_for("unique_ids").count(), 2);
        assert_eq!(report.integrity.duplicate_session_ids, 1);
        assert_eq!(report.integrity.duplicate_tool_metric_ids, 1);
    }

    #[test]
    fn test_mostly_empty_sessions_warn() {
        let sessions = vec![session("s-1"), session("s-2"), session("s-3")];
        let report = run(&sessions, &[metric("m-1", "s-1")]);

        assert!(report.is_valid);
        assert_eq!(report.issues_for("sessions_without_metrics").count(), 1);
        assert_eq!(report.integrity.sessions_without_metrics, 2);
    }

    #[test]
    fn test_productivity_mean_warns() {
        let mut a = session("s-1");
        a.productivity_score = Some(5.0);
        let mut b = session("s-2");
        b.productivity_score = Some(7.0);

        let report = run(&[a, b], &[metric("m-1", "s-1"), metric("m-2", "s-2")]);
        assert!(report.is_valid);
        assert_eq!(report.issues_for("productivity_mean").count(), 1);
        assert_eq!(report.integrity.mean_productivity, Some(6.0));
    }

    #[test]
    fn test_metric_volume_warns() {
        let metrics: Vec<_> = (0..51).map(|i| metric(&format!("m-{}", i), "s-1")).collect();
        let report = run(&[session("s-1")], &metrics);
        assert_eq!(report.issues_for("metrics_per_session").count(), 1);
    }
}
