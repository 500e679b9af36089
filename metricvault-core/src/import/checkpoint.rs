//! Import checkpoints
//!
//! One JSON document per run, `<run_id>.checkpoint.json`, written
//! atomically (temp file + rename). A checkpoint is only resumed when its
//! source checksum matches the data being imported.

use super::{EntityCounts, ImportError, ImportOptions};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SUFFIX: &str = ".checkpoint.json";

/// Resumability marker for one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Dataset checksum of the input this checkpoint belongs to
    pub source_checksum: String,
    pub sessions: EntityCounts,
    pub tool_metrics: EntityCounts,
    pub errors: Vec<ImportError>,
    pub options: ImportOptions,
    pub updated_at: DateTime<Utc>,
}

/// Directory of checkpoint files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", run_id, SUFFIX))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&checkpoint.run_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            sessions_next_batch = checkpoint.sessions.next_batch,
            tool_metrics_next_batch = checkpoint.tool_metrics.next_batch,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint of a specific run, if one exists
    pub fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        read(&path).map(Some)
    }

    /// Newest checkpoint recorded for the given source checksum.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn find_matching(&self, source_checksum: &str) -> Result<Option<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            SUFFIX
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Checkpoint(format!("invalid checkpoint pattern: {}", e)))?;

        let mut newest: Option<Checkpoint> = None;
        for entry in entries.flatten() {
            match read(&entry) {
                Ok(cp) if cp.source_checksum == source_checksum => {
                    if newest.as_ref().map_or(true, |n| cp.updated_at > n.updated_at) {
                        newest = Some(cp);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %entry.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        Ok(newest)
    }

    pub fn delete(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(run_id, "Checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read(path: &Path) -> Result<Checkpoint> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(run_id: &str, checksum: &str, minutes_ago: i64) -> Checkpoint {
        Checkpoint {
            run_id: run_id.to_string(),
            source_checksum: checksum.to_string(),
            sessions: EntityCounts {
                next_batch: 3,
                processed: 300,
                ..Default::default()
            },
            tool_metrics: EntityCounts::default(),
            errors: vec![],
            options: ImportOptions::default(),
            updated_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn test_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let cp = checkpoint("run-1", "abc", 0);

        store.save(&cp).unwrap();
        assert!(store.path_for("run-1").exists());
        assert_eq!(store.load("run-1").unwrap(), Some(cp));

        store.delete("run-1").unwrap();
        assert_eq!(store.load("run-1").unwrap(), None);
        store.delete("run-1").unwrap();
    }

    #[test]
    fn test_find_matching_prefers_newest() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.save(&checkpoint("old", "abc", 30)).unwrap();
        store.save(&checkpoint("new", "abc", 1)).unwrap();
        store.save(&checkpoint("other", "xyz", 0)).unwrap();
        std::fs::write(dir.path().join("broken.checkpoint.json"), "{not json").unwrap();

        let found = store.find_matching("abc").unwrap().unwrap();
        assert_eq!(found.run_id, "new");
        assert!(store.find_matching("nope").unwrap().is_none());
    }

    #[test]
    fn test_missing_dir_finds_nothing() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"));
        assert!(store.find_matching("abc").unwrap().is_none());
    }
}
