//! Hybrid metrics collector
//!
//! Live events are written to local append-only logs first and replicated
//! to a remote store second. Replication never blocks or fails local
//! collection:
//!
//! - a failed or slow replication leaves the event in a durable retry queue
//! - a background loop retries the queue, probes the remote and attempts
//!   failover recovery
//! - only a failed local write makes [`HybridCollector::collect`] report
//!   failure
//!
//! ## Usage
//!
//! Enable replication in `~/.config/metricvault/config.toml`:
//!
//! ```toml
//! [collector]
//! enabled = true
//! endpoint = "https://metrics.example.com/api"
//! api_key = "mv_live_xxxxxxxxxxxx"
//! tenant_id = "tenant-a"
//! ```

mod client;
mod failover;
mod health;
mod local;
mod queue;

pub use client::{RemoteClient, RemoteSink, SOURCE_TAG};
pub use failover::{
    transition, Effect, FailoverEvent, FailoverHandler, FailoverMode, RecoveryAttempt,
    TransitionRecord,
};
pub use health::{HealthSnapshot, HealthTracker, RemoteHealth};
pub use local::LocalStore;
pub use queue::{DurableQueue, FileQueue};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::config::CollectorConfig;
use crate::error::{RemoteError, Result};
use crate::types::{MetricsEvent, QueuedMetric};

const QUEUE_FILE: &str = "sync_queue.json";
const STATUS_FILE: &str = "collector_status.json";

/// Floor for background timers; a zero period would spin
const MIN_TICK: Duration = Duration::from_millis(100);

/// Outcome of collecting one event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectResult {
    /// False only when the local write failed
    pub success: bool,
    pub local_saved: bool,
    pub remote_synced: bool,
    /// Replication exceeded the fallback threshold
    pub fallback_activated: bool,
    /// Event was left in the retry queue
    pub queued: bool,
    pub response_time_ms: u64,
}

/// Running totals since the collector was opened
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStats {
    pub events_collected: u64,
    pub local_failures: u64,
    pub remote_synced: u64,
    pub remote_failures: u64,
    pub fallbacks: u64,
    pub queued: u64,
    pub retry_synced: u64,
    pub retry_dropped: u64,
}

/// Result of one pass over the retry queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryCycleReport {
    /// The cycle did not contact the remote
    pub skipped: bool,
    pub attempted: usize,
    pub synced: usize,
    pub requeued: usize,
    /// Dropped after exhausting their attempts or being rejected
    pub dropped: usize,
    /// Queue writes that failed; those items stay as they were on disk
    pub queue_errors: usize,
    pub remaining: usize,
}

/// Contents of `collector_status.json`
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub mode: FailoverMode,
    pub remote_configured: bool,
    pub recovery_pending: bool,
    pub health: HealthSnapshot,
    pub queue_depth: usize,
    pub stats: CollectorStats,
    pub recent_transitions: Vec<TransitionRecord>,
    pub updated_at: DateTime<Utc>,
}

enum Replication {
    Synced,
    Failed,
    /// Took at least the fallback threshold
    Fallback,
}

/// Local-first collector with remote replication and failover
pub struct HybridCollector {
    config: CollectorConfig,
    local: LocalStore,
    remote: Option<Arc<dyn RemoteSink>>,
    queue: Arc<dyn DurableQueue>,
    health: Mutex<HealthTracker>,
    failover: FailoverHandler,
    stats: Mutex<CollectorStats>,
    status_path: PathBuf,
}

impl HybridCollector {
    /// Open a collector over the configured data directory.
    ///
    /// The remote client is only created when replication is enabled and
    /// fully configured; otherwise the collector runs local-only.
    pub async fn open(config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.data_dir();

        let remote: Option<Arc<dyn RemoteSink>> = if config.is_ready() {
            let client = RemoteClient::new(&config)?;
            tracing::info!(endpoint = client.base_url(), "Remote replication enabled");
            Some(Arc::new(client))
        } else {
            None
        };
        let queue = FileQueue::open(
            dir.join(QUEUE_FILE),
            config.queue_capacity,
            config.queue_trim_to,
        )
        .await?;

        Ok(Self::with_parts(
            config,
            LocalStore::new(dir),
            remote,
            Arc::new(queue),
        ))
    }

    /// Assemble a collector from explicit parts
    pub fn with_parts(
        config: CollectorConfig,
        local: LocalStore,
        remote: Option<Arc<dyn RemoteSink>>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        let initial = if remote.is_some() {
            FailoverMode::from(config.mode)
        } else {
            FailoverMode::LocalOnly
        };
        let health = HealthTracker::new(config.failure_threshold, config.health_probe_interval());
        let status_path = local.dir().join(STATUS_FILE);

        tracing::info!(
            mode = %initial,
            data_dir = %local.dir().display(),
            "Collector opened"
        );

        Self {
            config,
            local,
            remote,
            queue,
            health: Mutex::new(health),
            failover: FailoverHandler::new(initial),
            stats: Mutex::new(CollectorStats::default()),
            status_path,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn failover(&self) -> &FailoverHandler {
        &self.failover
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    pub fn stats(&self) -> CollectorStats {
        self.lock_stats().clone()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.lock_health().snapshot()
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthTracker> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, CollectorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Collect one event: local write, then replication or queueing
    pub async fn collect(&self, event: MetricsEvent) -> CollectResult {
        let started = Instant::now();
        self.lock_stats().events_collected += 1;
        let mut result = CollectResult::default();

        if let Err(e) = self.local.append(&event).await {
            tracing::error!(event_id = %event.id, error = %e, "Failed to write event locally");
            self.lock_stats().local_failures += 1;
            result.response_time_ms = started.elapsed().as_millis() as u64;
            return result;
        }
        result.local_saved = true;
        result.success = true;

        if let Some(remote) = self.remote.clone() {
            let attempt = self.failover.allows_remote() && self.lock_health().should_attempt();
            let outcome = if attempt {
                self.replicate(remote.as_ref(), &event).await
            } else {
                Replication::Failed
            };

            match outcome {
                Replication::Synced => result.remote_synced = true,
                Replication::Failed => result.queued = self.enqueue(event).await,
                Replication::Fallback => {
                    result.fallback_activated = true;
                    result.queued = self.enqueue(event).await;
                }
            }
        }

        result.response_time_ms = started.elapsed().as_millis() as u64;
        self.write_status_logged().await;
        result
    }

    /// One replication attempt bounded by the fallback threshold
    async fn replicate(&self, remote: &dyn RemoteSink, event: &MetricsEvent) -> Replication {
        let threshold = self.config.fallback_threshold();
        let deadline = threshold.min(self.config.sync_timeout());

        let started = Instant::now();
        let outcome = tokio::time::timeout(deadline, remote.send(event)).await;
        let elapsed = started.elapsed();

        let err = match outcome {
            Ok(Ok(())) => {
                self.lock_health().record_success(elapsed);
                self.lock_stats().remote_synced += 1;
                if self.failover.mode() == FailoverMode::Degraded {
                    self.failover.handle(FailoverEvent::RecoverySucceeded);
                }
                return Replication::Synced;
            }
            Ok(Err(e)) => e,
            Err(_) => RemoteError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
            },
        };

        self.lock_stats().remote_failures += 1;

        if elapsed >= threshold {
            {
                let mut health = self.lock_health();
                health.record_failure(&err);
                health.mark_unreachable();
            }
            self.lock_stats().fallbacks += 1;
            tracing::warn!(
                event_id = %event.id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Replication exceeded fallback threshold"
            );
            self.failover.handle_connection_failure(format!(
                "replication took {}ms, threshold is {}ms",
                elapsed.as_millis(),
                threshold.as_millis()
            ));
            return Replication::Fallback;
        }

        let unreachable = {
            let mut health = self.lock_health();
            health.record_failure(&err);
            matches!(health.health(), RemoteHealth::Unreachable { .. })
        };
        tracing::warn!(event_id = %event.id, error = %err, "Replication failed, event queued");
        if unreachable {
            self.failover.handle_connection_failure(err.to_string());
        } else {
            self.failover.handle_service_degradation(err.to_string());
        }
        Replication::Failed
    }

    async fn enqueue(&self, event: MetricsEvent) -> bool {
        let event_id = event.id.clone();
        match self.queue.enqueue(QueuedMetric::new(event)).await {
            Ok(()) => {
                self.lock_stats().queued += 1;
                true
            }
            Err(e) => {
                tracing::warn!(event_id = %event_id, error = %e, "Failed to queue event for retry");
                false
            }
        }
    }

    /// Probe the remote and record the outcome; true if it answered
    async fn probe(&self, remote: &dyn RemoteSink) -> bool {
        let started = Instant::now();
        let outcome = remote.health().await.map(|()| started.elapsed());
        let ok = outcome.is_ok();
        self.lock_health().record_probe(outcome);
        ok
    }

    /// Rate-limited health probe; `None` when no probe was due
    pub async fn check_health(&self) -> Option<bool> {
        let remote = self.remote.clone()?;
        if !self.lock_health().probe_due() {
            return None;
        }
        Some(self.probe(remote.as_ref()).await)
    }

    /// Retry up to one batch of queued events
    pub async fn process_retry_queue(&self) -> Result<RetryCycleReport> {
        let mut report = RetryCycleReport::default();

        let Some(remote) = self.remote.clone() else {
            report.skipped = true;
            report.remaining = self.queue.len().await;
            return Ok(report);
        };

        // Forced local-only: hold everything until an operator switches back
        if self.failover.mode() == FailoverMode::LocalOnly && !self.failover.recovery_pending() {
            report.skipped = true;
            report.remaining = self.queue.len().await;
            return Ok(report);
        }

        if self.queue.is_empty().await {
            return Ok(report);
        }

        let reachable = self.lock_health().is_reachable();
        if !reachable {
            if !self.probe(remote.as_ref()).await {
                tracing::debug!("Remote still unavailable, skipping retry cycle");
                report.skipped = true;
                report.remaining = self.queue.len().await;
                return Ok(report);
            }
            if self.failover.recovery_pending() {
                self.failover.handle(FailoverEvent::RecoverySucceeded);
            }
        }

        // Items leave the queue only once their outcome is known
        let batch = self.queue.peek_batch(self.config.retry_batch_size).await?;
        for mut item in batch {
            report.attempted += 1;
            item.attempts += 1;
            item.last_attempt_at = Some(Utc::now());
            if let Err(e) = self.queue.update(&item).await {
                tracing::warn!(
                    event_id = %item.event.id,
                    error = %e,
                    "Failed to record retry attempt"
                );
                report.queue_errors += 1;
            }

            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.config.sync_timeout(),
                remote.send(&item.event),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(RemoteError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            };

            let settled = match outcome {
                Ok(()) => {
                    self.lock_health().record_success(started.elapsed());
                    report.synced += 1;
                    true
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(
                        event_id = %item.event.id,
                        attempts = item.attempts,
                        error = %e,
                        "Queued event rejected by remote, dropping"
                    );
                    report.dropped += 1;
                    true
                }
                Err(e) => {
                    self.lock_health().record_failure(&e);
                    if item.attempts < self.config.max_retry_attempts {
                        report.requeued += 1;
                        false
                    } else {
                        tracing::warn!(
                            event_id = %item.event.id,
                            attempts = item.attempts,
                            age_secs = (Utc::now() - item.created_at).num_seconds(),
                            error = %e,
                            "Dropping queued event after max attempts"
                        );
                        report.dropped += 1;
                        true
                    }
                }
            };

            if settled {
                if let Err(e) = self.queue.remove(&item.id).await {
                    tracing::warn!(
                        event_id = %item.event.id,
                        error = %e,
                        "Failed to remove settled event from queue"
                    );
                    report.queue_errors += 1;
                }
            }
        }

        {
            let mut stats = self.lock_stats();
            stats.retry_synced += report.synced as u64;
            stats.retry_dropped += report.dropped as u64;
        }
        report.remaining = self.queue.len().await;

        tracing::info!(
            synced = report.synced,
            requeued = report.requeued,
            dropped = report.dropped,
            queue_errors = report.queue_errors,
            remaining = report.remaining,
            "Retry cycle complete"
        );
        self.write_status_logged().await;
        Ok(report)
    }

    /// Attempt failover recovery if one is scheduled
    pub async fn attempt_recovery(&self) -> Option<TransitionRecord> {
        let remote = self.remote.clone()?;
        match self.failover.attempt_recovery(remote.as_ref()).await {
            RecoveryAttempt::NotNeeded => None,
            RecoveryAttempt::Recovered {
                latency,
                transition,
            } => {
                self.lock_health().record_probe(Ok(latency));
                transition
            }
            RecoveryAttempt::Failed(e) => {
                self.lock_health().record_probe(Err(e));
                None
            }
        }
    }

    /// Manual mode switch, accepted from any mode
    pub fn force_mode(&self, mode: FailoverMode, reason: &str) -> Option<TransitionRecord> {
        self.failover.force_failover(mode, reason)
    }

    pub async fn status(&self) -> CollectorStatus {
        CollectorStatus {
            mode: self.failover.mode(),
            remote_configured: self.remote.is_some(),
            recovery_pending: self.failover.recovery_pending(),
            health: self.health_snapshot(),
            queue_depth: self.queue.len().await,
            stats: self.stats(),
            recent_transitions: self.failover.history(),
            updated_at: Utc::now(),
        }
    }

    /// Write `collector_status.json` atomically
    pub async fn write_status(&self) -> Result<()> {
        let status = self.status().await;
        if let Some(parent) = self.status_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.status_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&status)?).await?;
        tokio::fs::rename(&tmp, &self.status_path).await?;
        Ok(())
    }

    async fn write_status_logged(&self) {
        if let Err(e) = self.write_status().await {
            tracing::warn!(path = %self.status_path.display(), error = %e, "Failed to write collector status");
        }
    }

    async fn run_retry_cycle(&self) {
        if let Err(e) = self.process_retry_queue().await {
            tracing::warn!(error = %e, "Retry cycle failed");
        }
    }

    /// Run retry, probe and recovery timers until `shutdown` turns true.
    ///
    /// Transitions that request a queue drain trigger an immediate retry
    /// cycle. The queue and status file are flushed on exit.
    pub async fn run_background(&self, mut shutdown: watch::Receiver<bool>) {
        let mut transitions = self.failover.subscribe();
        let mut retry = ticker(self.config.retry_interval());
        let mut probe = ticker(self.config.health_probe_interval());
        let mut recovery = ticker(self.config.recovery_interval());

        tracing::info!(mode = %self.failover.mode(), "Collector background tasks started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = retry.tick() => self.run_retry_cycle().await,
                _ = probe.tick() => {
                    self.check_health().await;
                }
                _ = recovery.tick() => {
                    self.attempt_recovery().await;
                }
                received = transitions.recv() => match received {
                    Ok(record) if record.requests(Effect::DrainQueue) => self.run_retry_cycle().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Transition stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.queue.persist().await {
            tracing::warn!(error = %e, "Failed to persist retry queue on shutdown");
        }
        self.write_status_logged().await;
        tracing::info!("Collector background tasks stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(MIN_TICK));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeRemote {
        delay_ms: AtomicUsize,
        failing: AtomicBool,
        reject: AtomicBool,
        down: AtomicBool,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSink for FakeRemote {
        async fn send(&self, _: &MetricsEvent) -> std::result::Result<(), RemoteError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst) as u64;
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.reject.load(Ordering::SeqCst) {
                Err(RemoteError::Status {
                    status: 400,
                    body: "malformed event".to_string(),
                })
            } else if self.failing.load(Ordering::SeqCst) {
                Err(RemoteError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn health(&self) -> std::result::Result<(), RemoteError> {
            if self.down.load(Ordering::SeqCst) {
                Err(RemoteError::Connect("refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn config(dir: &Path) -> CollectorConfig {
        CollectorConfig {
            enabled: true,
            endpoint: Some("http://remote.invalid".to_string()),
            api_key: Some("key".to_string()),
            tenant_id: Some("tenant".to_string()),
            data_dir: Some(dir.to_path_buf()),
            sync_timeout_ms: 1000,
            fallback_threshold_ms: 100,
            failure_threshold: 3,
            max_retry_attempts: 3,
            health_probe_interval_secs: 0,
            ..Default::default()
        }
    }

    async fn collector(dir: &Path, remote: Option<Arc<FakeRemote>>) -> HybridCollector {
        let queue = FileQueue::open(dir.join(QUEUE_FILE), 1000, 900).await.unwrap();
        HybridCollector::with_parts(
            config(dir),
            LocalStore::new(dir),
            remote.map(|r| r as Arc<dyn RemoteSink>),
            Arc::new(queue),
        )
    }

    fn event(id: &str) -> MetricsEvent {
        MetricsEvent {
            id: id.to_string(),
            session_id: "s-1".to_string(),
            user_id: None,
            event_type: "tool_use".to_string(),
            tool_name: Some("Read".to_string()),
            duration_ms: Some(12),
            success: Some(true),
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_fast_remote_syncs() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let collector = collector(dir.path(), Some(remote.clone())).await;

        let result = collector.collect(event("evt-1")).await;
        assert!(result.success);
        assert!(result.local_saved);
        assert!(result.remote_synced);
        assert!(!result.fallback_activated);
        assert_eq!(collector.queue_len().await, 0);
        assert_eq!(remote.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_remote_triggers_fallback() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.delay_ms.store(150, Ordering::SeqCst);
        let collector = collector(dir.path(), Some(remote)).await;

        let result = collector.collect(event("evt-1")).await;
        assert!(result.success);
        assert!(result.local_saved);
        assert!(!result.remote_synced);
        assert!(result.fallback_activated);
        assert!(result.queued);
        assert_eq!(collector.queue_len().await, 1);
        assert_eq!(collector.failover().mode(), FailoverMode::LocalOnly);
        assert!(matches!(
            collector.health_snapshot().health,
            RemoteHealth::Unreachable { .. }
        ));
    }

    #[tokio::test]
    async fn test_remote_error_degrades_and_queues() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.failing.store(true, Ordering::SeqCst);
        let collector = collector(dir.path(), Some(remote)).await;

        let result = collector.collect(event("evt-1")).await;
        assert!(result.success);
        assert!(result.queued);
        assert!(!result.fallback_activated);
        assert_eq!(collector.failover().mode(), FailoverMode::Degraded);
        assert_eq!(collector.stats().remote_failures, 1);
    }

    #[tokio::test]
    async fn test_local_failure_is_the_only_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let remote = Arc::new(FakeRemote::default());
        let queue = FileQueue::open(dir.path().join(QUEUE_FILE), 10, 9).await.unwrap();
        let collector = HybridCollector::with_parts(
            config(dir.path()),
            LocalStore::new(blocker.join("nested")),
            Some(remote.clone() as Arc<dyn RemoteSink>),
            Arc::new(queue),
        );

        let result = collector.collect(event("evt-1")).await;
        assert!(!result.success);
        assert!(!result.local_saved);
        assert_eq!(remote.sends.load(Ordering::SeqCst), 0);
        assert_eq!(collector.stats().local_failures, 1);
    }

    #[tokio::test]
    async fn test_without_remote_nothing_is_queued() {
        let dir = TempDir::new().unwrap();
        let collector = collector(dir.path(), None).await;
        assert_eq!(collector.failover().mode(), FailoverMode::LocalOnly);

        let result = collector.collect(event("evt-1")).await;
        assert!(result.success);
        assert!(!result.queued);
        assert_eq!(collector.queue_len().await, 0);

        let report = collector.process_retry_queue().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_retry_drops_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.failing.store(true, Ordering::SeqCst);
        let collector = collector(dir.path(), Some(remote)).await;
        collector.collect(event("evt-1")).await;

        let first = collector.process_retry_queue().await.unwrap();
        assert_eq!(first.attempted, 1);
        assert_eq!(first.requeued, 1);

        let second = collector.process_retry_queue().await.unwrap();
        assert_eq!(second.requeued, 1);

        let third = collector.process_retry_queue().await.unwrap();
        assert_eq!(third.dropped, 1);
        assert_eq!(third.remaining, 0);
        assert_eq!(collector.stats().retry_dropped, 1);
    }

    #[tokio::test]
    async fn test_rejected_event_is_not_requeued() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.failing.store(true, Ordering::SeqCst);
        let collector = collector(dir.path(), Some(remote.clone())).await;
        assert!(collector.collect(event("evt-1")).await.queued);

        remote.failing.store(false, Ordering::SeqCst);
        remote.reject.store(true, Ordering::SeqCst);
        let report = collector.process_retry_queue().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(report.remaining, 0);
        assert_eq!(collector.stats().retry_dropped, 1);

        // Nothing left to send on the next cycle
        let sends = remote.sends.load(Ordering::SeqCst);
        let next = collector.process_retry_queue().await.unwrap();
        assert_eq!(next.attempted, 0);
        assert_eq!(remote.sends.load(Ordering::SeqCst), sends);
    }

    #[tokio::test]
    async fn test_cancelled_retry_cycle_keeps_queue_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(QUEUE_FILE);
        let queue = FileQueue::open(&path, 1000, 900).await.unwrap();
        for n in 0..5 {
            queue
                .enqueue(QueuedMetric::new(event(&format!("evt-{}", n))))
                .await
                .unwrap();
        }

        let remote = Arc::new(FakeRemote::default());
        remote.delay_ms.store(30_000, Ordering::SeqCst);
        let collector = HybridCollector::with_parts(
            config(dir.path()),
            LocalStore::new(dir.path()),
            Some(remote.clone() as Arc<dyn RemoteSink>),
            Arc::new(queue),
        );

        // Shutdown lands while the first send is in flight
        let cycle =
            tokio::time::timeout(Duration::from_millis(200), collector.process_retry_queue()).await;
        assert!(cycle.is_err());
        assert_eq!(remote.sends.load(Ordering::SeqCst), 1);

        let reopened = FileQueue::open(&path, 1000, 900).await.unwrap();
        let items = reopened.peek_batch(10).await.unwrap();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].event.id, "evt-0");
        assert_eq!(items[0].attempts, 1);
        assert!(items[0].last_attempt_at.is_some());
        assert_eq!(items[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_skipped_while_probe_fails() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.failing.store(true, Ordering::SeqCst);
        remote.down.store(true, Ordering::SeqCst);
        let collector = collector(dir.path(), Some(remote.clone())).await;
        collector.collect(event("evt-1")).await;
        let sends_before = remote.sends.load(Ordering::SeqCst);

        let report = collector.process_retry_queue().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.remaining, 1);
        assert_eq!(remote.sends.load(Ordering::SeqCst), sends_before);
    }

    #[tokio::test]
    async fn test_recovery_then_drain() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.delay_ms.store(150, Ordering::SeqCst);
        let collector = collector(dir.path(), Some(remote.clone())).await;
        collector.collect(event("evt-1")).await;
        assert_eq!(collector.failover().mode(), FailoverMode::LocalOnly);

        remote.delay_ms.store(0, Ordering::SeqCst);
        let record = collector.attempt_recovery().await.unwrap();
        assert_eq!(record.to, FailoverMode::Hybrid);
        assert!(record.requests(Effect::DrainQueue));

        let report = collector.process_retry_queue().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.remaining, 0);

        let status: serde_json::Value =
            serde_json::from_slice(&std::fs::read(collector.status_path()).unwrap()).unwrap();
        assert_eq!(status["mode"], "hybrid");
        assert_eq!(status["queue_depth"], 0);
    }

    #[tokio::test]
    async fn test_forced_local_only_holds_queue() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let collector = collector(dir.path(), Some(remote.clone())).await;

        collector.force_mode(FailoverMode::LocalOnly, "maintenance");
        let result = collector.collect(event("evt-1")).await;
        assert!(result.queued);
        assert_eq!(remote.sends.load(Ordering::SeqCst), 0);

        let report = collector.process_retry_queue().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(collector(dir.path(), Some(Arc::new(FakeRemote::default()))).await);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let collector = collector.clone();
            async move { collector.run_background(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(collector.status_path().exists());
    }
}
