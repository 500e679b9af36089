//! Durable retry queue
//!
//! Events that could not be replicated wait here until a retry cycle picks
//! them up. [`FileQueue`] keeps the queue in memory and mirrors it to a
//! single JSON file after every change.
//!
//! A retry cycle peeks at its batch and only removes an item once its
//! outcome is known, so a cycle cut short leaves every item on disk.
//!
//! The file is single-writer: two collectors must never share a data dir.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::QueuedMetric;

/// Queue of replication work
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, item: QueuedMetric) -> Result<()>;

    /// Remove and return up to `max` of the oldest items
    async fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedMetric>>;

    /// Return up to `max` of the oldest items without removing them
    async fn peek_batch(&self, max: usize) -> Result<Vec<QueuedMetric>>;

    /// Overwrite the stored item with the same id, in place.
    ///
    /// Returns false if the item is no longer queued.
    async fn update(&self, item: &QueuedMetric) -> Result<bool>;

    /// Remove the item with this id; false if it was not queued
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Flush the current contents to durable storage
    async fn persist(&self) -> Result<()>;
}

/// File-backed queue bounded to the most recently created items
pub struct FileQueue {
    path: PathBuf,
    items: Mutex<VecDeque<QueuedMetric>>,
    capacity: usize,
    trim_to: usize,
}

impl FileQueue {
    /// Open the queue at `path`, loading any items persisted earlier.
    ///
    /// An unreadable file is logged and replaced by an empty queue.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize, trim_to: usize) -> Result<Self> {
        let path = path.into();
        let items = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<VecDeque<QueuedMetric>>(&content) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable retry queue");
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };

        if !items.is_empty() {
            tracing::info!(path = %path.display(), items = items.len(), "Loaded retry queue");
        }

        Ok(Self {
            path,
            items: Mutex::new(items),
            capacity,
            trim_to: trim_to.min(capacity),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, items: &VecDeque<QueuedMetric>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(items)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableQueue for FileQueue {
    async fn enqueue(&self, item: QueuedMetric) -> Result<()> {
        let mut items = self.items.lock().await;
        items.push_back(item);

        if items.len() > self.capacity {
            // Oldest by creation, not by position: retried items keep their age.
            items.make_contiguous().sort_by_key(|q| q.created_at);
            let excess = items.len() - self.trim_to;
            items.drain(..excess);
            tracing::warn!(
                dropped = excess,
                kept = items.len(),
                "Retry queue over capacity, dropped oldest items"
            );
        }

        self.write(&items).await
    }

    async fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedMetric>> {
        let mut items = self.items.lock().await;
        let n = max.min(items.len());
        let batch: Vec<QueuedMetric> = items.drain(..n).collect();
        if !batch.is_empty() {
            self.write(&items).await?;
        }
        Ok(batch)
    }

    async fn peek_batch(&self, max: usize) -> Result<Vec<QueuedMetric>> {
        let items = self.items.lock().await;
        Ok(items.iter().take(max).cloned().collect())
    }

    async fn update(&self, item: &QueuedMetric) -> Result<bool> {
        let mut items = self.items.lock().await;
        let Some(slot) = items.iter_mut().find(|q| q.id == item.id) else {
            return Ok(false);
        };
        *slot = item.clone();
        self.write(&items).await?;
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut items = self.items.lock().await;
        let Some(pos) = items.iter().position(|q| q.id == id) else {
            return Ok(false);
        };
        items.remove(pos);
        self.write(&items).await?;
        Ok(true)
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    async fn persist(&self) -> Result<()> {
        let items = self.items.lock().await;
        self.write(&items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricsEvent;
    use tempfile::TempDir;

    fn item(n: usize) -> QueuedMetric {
        QueuedMetric::new(MetricsEvent {
            id: format!("evt-{}", n),
            session_id: "s-1".to_string(),
            user_id: None,
            event_type: "tool_use".to_string(),
            tool_name: Some("Bash".to_string()),
            duration_ms: Some(10),
            success: Some(true),
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
        })
    }

    #[tokio::test]
    async fn test_overflow_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path().join("sync_queue.json"), 1000, 900)
            .await
            .unwrap();

        for n in 0..1001 {
            queue.enqueue(item(n)).await.unwrap();
        }

        assert_eq!(queue.len().await, 900);
        let head = queue.peek_batch(1).await.unwrap();
        assert_eq!(head[0].event.id, "evt-101");
    }

    #[tokio::test]
    async fn test_overflow_trims_by_creation_time() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path().join("sync_queue.json"), 1000, 900)
            .await
            .unwrap();

        // An old event that keeps failing is updated in place, not re-appended
        let mut stubborn = item(0);
        stubborn.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        queue.enqueue(stubborn.clone()).await.unwrap();
        stubborn.attempts = 2;
        assert!(queue.update(&stubborn).await.unwrap());

        for n in 1..1001 {
            queue.enqueue(item(n)).await.unwrap();
        }

        let ids: Vec<String> = queue
            .peek_batch(1000)
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.event.id)
            .collect();
        assert_eq!(ids.len(), 900);
        assert!(!ids.contains(&"evt-0".to_string()));
        assert_eq!(ids[0], "evt-101");
    }

    #[tokio::test]
    async fn test_late_old_item_is_trimmed_first() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path().join("sync_queue.json"), 3, 2)
            .await
            .unwrap();
        for n in 1..4 {
            queue.enqueue(item(n)).await.unwrap();
        }

        let mut old = item(0);
        old.created_at = chrono::Utc::now() - chrono::Duration::days(1);
        queue.enqueue(old).await.unwrap();

        let ids: Vec<String> = queue
            .peek_batch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.event.id)
            .collect();
        assert_eq!(ids, vec!["evt-2", "evt-3"]);
    }

    #[tokio::test]
    async fn test_update_and_remove_by_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync_queue.json");
        let queue = FileQueue::open(&path, 10, 9).await.unwrap();
        let first = item(1);
        let second = item(2);
        let third = item(3);
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();
        queue.enqueue(third).await.unwrap();

        let mut retried = first.clone();
        retried.attempts = 1;
        assert!(queue.update(&retried).await.unwrap());
        assert!(queue.remove(&second.id).await.unwrap());
        assert!(!queue.remove("missing").await.unwrap());

        let reopened = FileQueue::open(&path, 10, 9).await.unwrap();
        let items = reopened.peek_batch(10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].event.id, "evt-1");
        assert_eq!(items[0].attempts, 1);

        assert!(reopened.remove(&first.id).await.unwrap());
        assert!(!reopened.update(&retried).await.unwrap());
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync_queue.json");

        {
            let queue = FileQueue::open(&path, 10, 9).await.unwrap();
            for n in 0..3 {
                queue.enqueue(item(n)).await.unwrap();
            }
            let taken = queue.dequeue_batch(1).await.unwrap();
            assert_eq!(taken[0].event.id, "evt-0");
        }

        let reopened = FileQueue::open(&path, 10, 9).await.unwrap();
        let ids: Vec<String> = reopened
            .peek_batch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.event.id)
            .collect();
        assert_eq!(ids, vec!["evt-1", "evt-2"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync_queue.json");
        std::fs::write(&path, "[{broken").unwrap();

        let queue = FileQueue::open(&path, 10, 9).await.unwrap();
        assert!(queue.is_empty().await);
        assert!(queue.dequeue_batch(5).await.unwrap().is_empty());
    }
}
