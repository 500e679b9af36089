//! Remote availability tracking

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RemoteError;

/// Weight of the newest sample in the rolling latency average
const LATENCY_WEIGHT: f64 = 0.2;

/// What the collector currently believes about the remote
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteHealth {
    Reachable,
    /// Recent failures, but below the failure threshold
    Degraded { reason: String },
    Unreachable { since: DateTime<Utc> },
}

/// Serializable view of the tracker
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub health: RemoteHealth,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<f64>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Single owner of every health transition.
#[derive(Debug)]
pub struct HealthTracker {
    health: RemoteHealth,
    consecutive_failures: u32,
    failure_threshold: u32,
    avg_latency_ms: Option<f64>,
    last_success: Option<DateTime<Utc>>,
    last_probe: Option<Instant>,
    probe_interval: Duration,
    total_successes: u64,
    total_failures: u64,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, probe_interval: Duration) -> Self {
        Self {
            health: RemoteHealth::Reachable,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            avg_latency_ms: None,
            last_success: None,
            last_probe: None,
            probe_interval,
            total_successes: 0,
            total_failures: 0,
        }
    }

    pub fn health(&self) -> &RemoteHealth {
        &self.health
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self.health, RemoteHealth::Reachable)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        self.avg_latency_ms
    }

    /// Whether a replication attempt should be made at all.
    ///
    /// True unless the remote is unreachable and has failed at least
    /// `failure_threshold` times in a row.
    pub fn should_attempt(&self) -> bool {
        !matches!(self.health, RemoteHealth::Unreachable { .. })
            || self.consecutive_failures < self.failure_threshold
    }

    pub fn record_success(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => avg * (1.0 - LATENCY_WEIGHT) + sample * LATENCY_WEIGHT,
            None => sample,
        });

        if !self.is_reachable() {
            tracing::info!(
                previous_failures = self.consecutive_failures,
                "Remote is reachable again"
            );
        }
        self.health = RemoteHealth::Reachable;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        self.total_successes += 1;
    }

    pub fn record_failure(&mut self, err: &RemoteError) {
        self.consecutive_failures += 1;
        self.total_failures += 1;

        if self.consecutive_failures >= self.failure_threshold {
            self.mark_unreachable();
        } else if !matches!(self.health, RemoteHealth::Unreachable { .. }) {
            self.health = RemoteHealth::Degraded {
                reason: err.to_string(),
            };
        }
    }

    /// Flip to unreachable, keeping the original `since` if already there
    pub fn mark_unreachable(&mut self) {
        if !matches!(self.health, RemoteHealth::Unreachable { .. }) {
            tracing::warn!(
                consecutive_failures = self.consecutive_failures,
                "Remote marked unreachable"
            );
            self.health = RemoteHealth::Unreachable { since: Utc::now() };
        }
    }

    /// Probes are rate limited to one per `probe_interval`
    pub fn probe_due(&self) -> bool {
        self.last_probe
            .map_or(true, |at| at.elapsed() >= self.probe_interval)
    }

    pub fn record_probe(&mut self, outcome: std::result::Result<Duration, RemoteError>) {
        self.last_probe = Some(Instant::now());
        match outcome {
            Ok(latency) => self.record_success(latency),
            Err(e) => self.record_failure(&e),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            health: self.health.clone(),
            consecutive_failures: self.consecutive_failures,
            avg_latency_ms: self.avg_latency_ms,
            last_success: self.last_success,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_error() -> RemoteError {
        RemoteError::Connect("refused".to_string())
    }

    #[test]
    fn test_failures_degrade_then_break() {
        let mut tracker = HealthTracker::new(3, Duration::from_secs(60));

        tracker.record_failure(&connect_error());
        assert!(matches!(tracker.health(), RemoteHealth::Degraded { .. }));
        assert!(tracker.should_attempt());

        tracker.record_failure(&connect_error());
        tracker.record_failure(&connect_error());
        assert!(matches!(tracker.health(), RemoteHealth::Unreachable { .. }));
        assert!(!tracker.should_attempt());
    }

    #[test]
    fn test_success_resets() {
        let mut tracker = HealthTracker::new(2, Duration::from_secs(60));
        tracker.record_failure(&connect_error());
        tracker.record_failure(&connect_error());

        tracker.record_success(Duration::from_millis(40));
        assert!(tracker.is_reachable());
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.avg_latency_ms(), Some(40.0));

        tracker.record_success(Duration::from_millis(140));
        let avg = tracker.avg_latency_ms().unwrap();
        assert!((avg - 60.0).abs() < 1e-9, "avg was {}", avg);
    }

    #[test]
    fn test_latency_break_still_allows_attempts_below_threshold() {
        let mut tracker = HealthTracker::new(5, Duration::from_secs(60));
        tracker.record_failure(&RemoteError::Timeout { elapsed_ms: 150 });
        tracker.mark_unreachable();

        assert!(!tracker.is_reachable());
        assert!(tracker.should_attempt());
    }

    #[test]
    fn test_unreachable_since_is_stable() {
        let mut tracker = HealthTracker::new(1, Duration::from_secs(60));
        tracker.record_failure(&connect_error());
        let first = tracker.health().clone();
        tracker.record_failure(&connect_error());
        assert_eq!(tracker.health(), &first);
    }

    #[test]
    fn test_probe_rate_limit() {
        let mut tracker = HealthTracker::new(5, Duration::from_secs(60));
        assert!(tracker.probe_due());
        tracker.record_probe(Ok(Duration::from_millis(5)));
        assert!(!tracker.probe_due());

        let mut eager = HealthTracker::new(5, Duration::ZERO);
        eager.record_probe(Err(connect_error()));
        assert!(eager.probe_due());
    }
}
