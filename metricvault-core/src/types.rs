//! Core domain types for metricvault
//!
//! These types describe the records that flow through the store: work
//! sessions, per-tool usage aggregates, live collector events, and the
//! physical chunks that the partition manager maintains.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One user work session, owned by a user within a tenant |
//! | **ToolMetric** | Aggregated usage of one tool within one session |
//! | **Chunk** | A physical, time-bounded segment of an append-only table |
//! | **MetricsEvent** | One live event accepted by the hybrid collector |
//! | **QueuedMetric** | A replication work item waiting for retry |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Sessions
// ============================================

/// Kind of work session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Development,
    Review,
    Debugging,
    Research,
    Meeting,
    Other,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Development => "development",
            SessionType::Review => "review",
            SessionType::Debugging => "debugging",
            SessionType::Research => "research",
            SessionType::Meeting => "meeting",
            SessionType::Other => "other",
        }
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(SessionType::Development),
            "review" => Ok(SessionType::Review),
            "debugging" => Ok(SessionType::Debugging),
            "research" => Ok(SessionType::Research),
            "meeting" => Ok(SessionType::Meeting),
            "other" => Ok(SessionType::Other),
            _ => Err(format!("unknown session type: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One user work session.
///
/// Sessions are immutable once imported, except through an upsert that
/// replaces the whole row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier (UUID)
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// When the session began
    pub start_time: DateTime<Utc>,
    /// When the session was finalized (None while still open)
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Total duration in milliseconds
    #[serde(default)]
    pub duration_ms: i64,
    /// Distinct tools used during the session
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Productivity score, 0-100
    #[serde(default)]
    pub productivity_score: Option<f64>,
    #[serde(default)]
    pub session_type: SessionType,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub interruptions: i64,
    /// Uninterrupted focus time in milliseconds
    #[serde(default)]
    pub focus_time_ms: i64,
    #[serde(default)]
    pub description: Option<String>,
    /// Extensible metadata
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

// ============================================
// Tool metrics
// ============================================

/// Aggregated usage of one tool within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetric {
    /// Unique identifier
    pub id: String,
    /// Owning session; must reference an existing session
    pub session_id: String,
    /// Tool name (Read, Bash, Edit, ...)
    pub tool_name: String,
    #[serde(default)]
    pub tool_category: Option<String>,
    /// When the aggregate was recorded; the partitioning time column
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub execution_count: i64,
    #[serde(default)]
    pub total_duration_ms: i64,
    #[serde(default)]
    pub average_duration_ms: Option<f64>,
    /// Fraction of successful executions, 0.0-1.0
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default)]
    pub memory_usage_mb: Option<f64>,
    #[serde(default)]
    pub cpu_usage_percent: Option<f64>,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub output_size_bytes: Option<i64>,
    #[serde(default)]
    pub command_line: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_success_rate() -> f64 {
    1.0
}

/// The two importable entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    ToolMetric,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::ToolMetric => "tool_metric",
        }
    }

    /// Destination table holding this entity
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Session => "sessions",
            EntityKind::ToolMetric => "tool_metrics",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A record the bulk importer can move and checksum.
pub trait Record: Serialize + Clone + Send + Sync {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

impl Record for Session {
    const KIND: EntityKind = EntityKind::Session;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for ToolMetric {
    const KIND: EntityKind = EntityKind::ToolMetric;

    fn id(&self) -> &str {
        &self.id
    }
}

// ============================================
// Partitions
// ============================================

/// One physical time-bounded segment of an append-only table.
///
/// The range is half-open: `[range_start, range_end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub table_name: String,
    pub chunk_id: i64,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub size_bytes: i64,
    pub compressed: bool,
}

/// Aggregated chunk statistics for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub table_name: String,
    pub total_chunks: usize,
    pub compressed_chunks: usize,
    pub uncompressed_chunks: usize,
    pub total_size_bytes: i64,
    /// Start of the oldest chunk
    pub oldest_chunk: Option<DateTime<Utc>>,
    /// Start of the newest chunk
    pub newest_chunk: Option<DateTime<Utc>>,
}

// ============================================
// Live collection
// ============================================

/// One live metrics event accepted by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    /// Event identifier, used by the remote to deduplicate retries
    #[serde(default = "generate_id")]
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Event kind (tool_use, session_start, session_end, ...)
    pub event_type: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A unit of replication work waiting in the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMetric {
    pub id: String,
    pub event: MetricsEvent,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueuedMetric {
    pub fn new(event: MetricsEvent) -> Self {
        Self {
            id: generate_id(),
            event,
            attempts: 0,
            last_attempt_at: None,
            created_at: Utc::now(),
        }
    }
}
