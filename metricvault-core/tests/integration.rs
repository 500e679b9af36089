//! Integration tests for the import, partition and collector pipelines
//!
//! These run against a real SQLite store (in memory) and real files in
//! temporary directories; only the remote API is faked.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use metricvault_core::collector::{
    DurableQueue, FileQueue, HybridCollector, LocalStore, RemoteSink,
};
use metricvault_core::config::{CollectorConfig, PartitionConfig};
use metricvault_core::import::{
    BulkImporter, ErrorOrigin, ImportOptions, ImportSink, WriteCounts, WriteMode,
};
use metricvault_core::partition::PartitionManager;
use metricvault_core::{
    Database, EntityKind, Error, MetricsEvent, QueuedMetric, RemoteError, Result, Session,
    SessionType, ToolMetric,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================
// Fixtures
// ============================================

fn db() -> Database {
    metricvault_core::logging::init_test();
    let db = Database::open_in_memory().expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    db
}

fn session(n: usize) -> Session {
    let start = Utc::now() - Duration::days(2) + Duration::minutes(n as i64 * 10);
    Session {
        id: format!("s-{:03}", n),
        user_id: "user-1".to_string(),
        start_time: start,
        end_time: Some(start + Duration::minutes(5)),
        duration_ms: 300_000,
        tools_used: vec!["Bash".to_string()],
        productivity_score: Some(60.0),
        session_type: SessionType::Development,
        project_id: Some("proj-1".to_string()),
        tags: vec![],
        interruptions: 0,
        focus_time_ms: 120_000,
        description: None,
        metadata: serde_json::json!({ "source": "legacy" }),
    }
}

fn metric(n: usize, session_id: &str) -> ToolMetric {
    ToolMetric {
        id: format!("m-{:03}", n),
        session_id: session_id.to_string(),
        tool_name: "Bash".to_string(),
        tool_category: Some("shell".to_string()),
        recorded_at: Utc::now() - Duration::days(1),
        execution_count: 2,
        total_duration_ms: 40,
        average_duration_ms: Some(20.0),
        success_rate: 1.0,
        error_count: 0,
        memory_usage_mb: None,
        cpu_usage_percent: None,
        parameters: serde_json::json!({}),
        output_size_bytes: Some(128),
        command_line: Some("cargo test".to_string()),
        working_directory: None,
    }
}

fn dataset(n: usize) -> (Vec<Session>, Vec<ToolMetric>) {
    let sessions: Vec<Session> = (0..n).map(session).collect();
    let metrics = sessions
        .iter()
        .enumerate()
        .map(|(i, s)| metric(i, &s.id))
        .collect();
    (sessions, metrics)
}

fn options(dir: &TempDir, name: &str) -> ImportOptions {
    ImportOptions {
        batch_size: 2,
        checkpoint_interval: 1,
        checkpoint_dir: dir.path().join(name),
        dry_run_batch_delay_ms: 0,
        ..Default::default()
    }
}

/// Sink that rejects any session write touching one of `fail_ids`
struct FailingSink<'a> {
    inner: &'a Database,
    fail_ids: HashSet<String>,
}

impl<'a> FailingSink<'a> {
    fn new(inner: &'a Database, fail_ids: &[&str]) -> Self {
        Self {
            inner,
            fail_ids: fail_ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ImportSink for FailingSink<'_> {
    fn write_sessions(&self, schema: &str, records: &[Session], mode: WriteMode) -> Result<WriteCounts> {
        if records.iter().any(|r| self.fail_ids.contains(&r.id)) {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.write_sessions(schema, records, mode)
    }

    fn write_tool_metrics(
        &self,
        schema: &str,
        records: &[ToolMetric],
        mode: WriteMode,
    ) -> Result<WriteCounts> {
        self.inner.write_tool_metrics(schema, records, mode)
    }

    fn count_rows(&self, schema: &str, kind: EntityKind) -> Result<u64> {
        self.inner.count_rows(schema, kind)
    }

    fn fetch_sessions(&self, schema: &str, ids: &[String]) -> Result<Vec<Session>> {
        self.inner.fetch_sessions(schema, ids)
    }

    fn fetch_tool_metrics(&self, schema: &str, ids: &[String]) -> Result<Vec<ToolMetric>> {
        self.inner.fetch_tool_metrics(schema, ids)
    }
}

// ============================================
// Bulk import
// ============================================

#[test]
fn test_resume_matches_uninterrupted_run() {
    let dir = TempDir::new().unwrap();
    let (sessions, metrics) = dataset(20);

    let reference_db = db();
    let reference = BulkImporter::new(&reference_db, options(&dir, "reference"))
        .import(&sessions, &metrics)
        .unwrap();
    assert!(reference.success);

    // Batch 3 of 10 (s-006, s-007) fails on the first attempt
    let db = db();
    let failing = FailingSink::new(&db, &["s-006", "s-007"]);
    let interrupted = BulkImporter::new(&failing, options(&dir, "checkpoints"));
    let first = interrupted.import(&sessions, &metrics).unwrap();
    assert!(!first.success);

    let checkpoint = interrupted
        .checkpoints()
        .load(&first.run_id)
        .unwrap()
        .expect("aborted run should leave a checkpoint");
    assert_eq!(checkpoint.sessions.next_batch, 3);
    assert_eq!(checkpoint.sessions.processed, 6);
    assert_eq!(checkpoint.tool_metrics.next_batch, 0);

    let resumed_importer = BulkImporter::new(&db, options(&dir, "checkpoints"));
    let resumed = resumed_importer.import(&sessions, &metrics).unwrap();
    assert!(resumed.success);
    assert!(resumed.resumed);
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(resumed.total_processed, reference.total_processed);
    assert_eq!(resumed.inserted, reference.inserted);
    assert_eq!(resumed.updated, reference.updated);
    assert!(resumed.errors.is_empty());
    assert!(resumed.checksum_validation.unwrap().matches);

    assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 20);
    assert_eq!(db.count_rows("main", EntityKind::ToolMetric).unwrap(), 20);
    assert!(resumed_importer
        .checkpoints()
        .load(&first.run_id)
        .unwrap()
        .is_none());
}

#[test]
fn test_dry_run_leaves_store_and_checkpoints_untouched() {
    let dir = TempDir::new().unwrap();
    let (sessions, metrics) = dataset(5);
    let db = db();

    let mut opts = options(&dir, "checkpoints");
    opts.dry_run = true;
    let mut events = Vec::new();
    let result = BulkImporter::new(&db, opts)
        .import_with_progress(&sessions, &metrics, |p| events.push(p.clone()))
        .unwrap();

    assert!(result.success);
    assert!(result.dry_run);
    assert_eq!(result.total_processed, 10);
    assert!(result.checksum_validation.is_none());
    assert!(events.iter().all(|p| p.dry_run));
    assert_eq!(events.len(), 6);

    assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 0);
    let checkpoint_dir = dir.path().join("checkpoints");
    assert!(
        !checkpoint_dir.exists() || std::fs::read_dir(&checkpoint_dir).unwrap().next().is_none()
    );
}

#[test]
fn test_orphan_metric_costs_only_itself() {
    let dir = TempDir::new().unwrap();
    let (sessions, mut metrics) = dataset(2);
    metrics.push(metric(99, "s-missing"));
    let db = db();

    let mut opts = options(&dir, "checkpoints");
    opts.batch_size = 10;
    opts.continue_on_error = true;
    opts.validate_before_insert = false;
    let result = BulkImporter::new(&db, opts).import(&sessions, &metrics).unwrap();

    assert!(result.success);
    assert_eq!(result.inserted, 4);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].origin, ErrorOrigin::ToolMetric);
    assert_eq!(result.errors[0].record_id.as_deref(), Some("m-099"));

    let checksum = result.checksum_validation.unwrap();
    assert!(!checksum.matches);
    assert_eq!(checksum.missing_rows, 1);
}

#[test]
fn test_tenant_schemas_are_isolated() {
    let dir = TempDir::new().unwrap();
    let (sessions, metrics) = dataset(3);
    let db = db();
    db.attach_schema("tenant_a", Some(&dir.path().join("tenant_a.db")))
        .unwrap();

    let mut opts = options(&dir, "checkpoints");
    opts.schema = "tenant_a".to_string();
    let result = BulkImporter::new(&db, opts).import(&sessions, &metrics).unwrap();

    assert!(result.success);
    assert_eq!(db.count_rows("tenant_a", EntityKind::Session).unwrap(), 3);
    assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 0);
}

// ============================================
// Partitions
// ============================================

#[test]
fn test_health_flags_stale_partitions() {
    let db = db();
    let manager = PartitionManager::new(&db, PartitionConfig::default());

    let end = Utc::now() - Duration::days(4);
    for table in ["sessions", "tool_metrics"] {
        manager
            .create_chunks_for_window(table, end - Duration::days(2), end, 24)
            .unwrap();
    }

    let report = manager.health_check().unwrap();
    assert!(!report.is_healthy);
    assert!(report
        .issues
        .iter()
        .any(|i| i.starts_with("sessions: no recent partitions")));
    assert!(report
        .issues
        .iter()
        .any(|i| i.starts_with("tool_metrics: no recent partitions")));

    manager.pre_create_upcoming(1).unwrap();
    let report = manager.health_check().unwrap();
    assert!(!report
        .issues
        .iter()
        .any(|i| i.contains("no recent partitions")));
}

#[test]
fn test_retention_drops_imported_history() {
    let dir = TempDir::new().unwrap();
    let db = db();

    let mut ancient = session(0);
    ancient.id = "s-ancient".to_string();
    ancient.start_time = Utc::now() - Duration::days(200);
    ancient.end_time = Some(ancient.start_time + Duration::minutes(5));
    let old_metric = ToolMetric {
        recorded_at: ancient.start_time + Duration::minutes(1),
        ..metric(0, "s-ancient")
    };
    let recent = session(1);

    let result = BulkImporter::new(&db, options(&dir, "checkpoints"))
        .import(&[ancient, recent], &[old_metric])
        .unwrap();
    assert!(result.success);

    let manager = PartitionManager::new(&db, PartitionConfig::default());
    let summary = manager.run_maintenance_cycle().unwrap();

    assert_eq!(summary.dropped, 2);
    assert_eq!(db.count_rows("main", EntityKind::Session).unwrap(), 1);
    assert_eq!(db.count_rows("main", EntityKind::ToolMetric).unwrap(), 0);
}

// ============================================
// Collector
// ============================================

struct SlowRemote {
    delay: std::time::Duration,
}

#[async_trait]
impl RemoteSink for SlowRemote {
    async fn send(&self, _: &MetricsEvent) -> std::result::Result<(), RemoteError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn health(&self) -> std::result::Result<(), RemoteError> {
        Ok(())
    }
}

fn live_event(id: &str) -> MetricsEvent {
    MetricsEvent {
        id: id.to_string(),
        session_id: "s-live".to_string(),
        user_id: Some("user-1".to_string()),
        event_type: "tool_use".to_string(),
        tool_name: Some("Edit".to_string()),
        duration_ms: Some(30),
        success: Some(true),
        timestamp: Utc::now(),
        payload: serde_json::json!({ "file": "src/lib.rs" }),
    }
}

#[tokio::test]
async fn test_slow_remote_falls_back_to_queue() {
    let dir = TempDir::new().unwrap();
    let config = CollectorConfig {
        enabled: true,
        endpoint: Some("http://remote.invalid".to_string()),
        api_key: Some("key".to_string()),
        tenant_id: Some("tenant-a".to_string()),
        data_dir: Some(dir.path().to_path_buf()),
        fallback_threshold_ms: 100,
        ..Default::default()
    };
    let queue = FileQueue::open(dir.path().join("sync_queue.json"), 1000, 900)
        .await
        .unwrap();
    let collector = HybridCollector::with_parts(
        config,
        LocalStore::new(dir.path()),
        Some(Arc::new(SlowRemote {
            delay: std::time::Duration::from_millis(150),
        })),
        Arc::new(queue),
    );

    let result = collector.collect(live_event("evt-slow")).await;
    assert!(result.success);
    assert!(result.local_saved);
    assert!(result.fallback_activated);
    assert!(!result.remote_synced);
    assert_eq!(collector.queue_len().await, 1);

    let tools = std::fs::read_to_string(collector.local().tool_log_path()).unwrap();
    assert!(tools.contains("evt-slow"));

    // The queued item survives a restart
    let reopened = FileQueue::open(dir.path().join("sync_queue.json"), 1000, 900)
        .await
        .unwrap();
    let queued = reopened.peek_batch(10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].event.id, "evt-slow");
}

#[tokio::test]
async fn test_queue_overflow_keeps_most_recent() {
    let dir = TempDir::new().unwrap();
    let queue = FileQueue::open(dir.path().join("sync_queue.json"), 1000, 900)
        .await
        .unwrap();

    for n in 0..1001 {
        queue
            .enqueue(QueuedMetric::new(live_event(&format!("evt-{}", n))))
            .await
            .unwrap();
    }

    assert_eq!(queue.len().await, 900);
    let head = queue.peek_batch(1).await.unwrap();
    assert_eq!(head[0].event.id, "evt-101");
}
