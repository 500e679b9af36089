//! Local append-only storage
//!
//! Every collected event lands here before anything else:
//!
//! ```text
//! <data_dir>/
//!   tool-metrics.jsonl       events that carry a tool name
//!   session-metrics.jsonl    every event, keyed by session
//!   realtime/activity.log    one compact line per event, for tailing
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::types::MetricsEvent;

const TOOL_LOG: &str = "tool-metrics.jsonl";
const SESSION_LOG: &str = "session-metrics.jsonl";
const ACTIVITY_LOG: &str = "realtime/activity.log";

#[derive(Serialize)]
struct SessionLine<'a> {
    session_id: &'a str,
    event_id: &'a str,
    event_type: &'a str,
    timestamp: String,
    event: &'a MetricsEvent,
}

/// Writer for the local logs of one collector instance
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tool_log_path(&self) -> PathBuf {
        self.dir.join(TOOL_LOG)
    }

    pub fn session_log_path(&self) -> PathBuf {
        self.dir.join(SESSION_LOG)
    }

    pub fn activity_log_path(&self) -> PathBuf {
        self.dir.join(ACTIVITY_LOG)
    }

    /// Append one event to every applicable log
    pub async fn append(&self, event: &MetricsEvent) -> Result<()> {
        if event.tool_name.is_some() {
            let mut line = serde_json::to_vec(event)?;
            line.push(b'\n');
            append_line(&self.tool_log_path(), &line).await?;
        }

        let mut line = serde_json::to_vec(&SessionLine {
            session_id: &event.session_id,
            event_id: &event.id,
            event_type: &event.event_type,
            timestamp: event.timestamp.to_rfc3339(),
            event,
        })?;
        line.push(b'\n');
        append_line(&self.session_log_path(), &line).await?;

        append_line(&self.activity_log_path(), activity_line(event).as_bytes()).await
    }
}

/// `<time> <session> <event_type> [tool] [duration] [ok|fail]`
fn activity_line(event: &MetricsEvent) -> String {
    let mut line = format!(
        "{} {} {}",
        event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        event.session_id,
        event.event_type
    );
    if let Some(tool) = &event.tool_name {
        line.push(' ');
        line.push_str(tool);
    }
    if let Some(ms) = event.duration_ms {
        line.push_str(&format!(" {}ms", ms));
    }
    match event.success {
        Some(true) => line.push_str(" ok"),
        Some(false) => line.push_str(" fail"),
        None => {}
    }
    line.push('\n');
    line
}

async fn append_line(path: &Path, line: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn event(tool: Option<&str>) -> MetricsEvent {
        MetricsEvent {
            id: "evt-1".to_string(),
            session_id: "s-1".to_string(),
            user_id: Some("u-1".to_string()),
            event_type: "tool_use".to_string(),
            tool_name: tool.map(str::to_string),
            duration_ms: Some(120),
            success: Some(true),
            timestamp: chrono::Utc.with_ymd_and_hms(2026, 4, 1, 8, 30, 0).unwrap(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_append_writes_all_logs() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        store.append(&event(Some("Bash"))).await.unwrap();
        store.append(&event(None)).await.unwrap();

        let tools = std::fs::read_to_string(store.tool_log_path()).unwrap();
        assert_eq!(tools.lines().count(), 1);
        let parsed: MetricsEvent = serde_json::from_str(tools.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.tool_name.as_deref(), Some("Bash"));

        let sessions = std::fs::read_to_string(store.session_log_path()).unwrap();
        assert_eq!(sessions.lines().count(), 2);

        let activity = std::fs::read_to_string(store.activity_log_path()).unwrap();
        assert_eq!(
            activity.lines().next().unwrap(),
            "2026-04-01T08:30:00.000Z s-1 tool_use Bash 120ms ok"
        );
    }

    #[tokio::test]
    async fn test_unwritable_dir_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let store = LocalStore::new(blocker.join("nested"));
        assert!(store.append(&event(Some("Bash"))).await.is_err());
    }
}
