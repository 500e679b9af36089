//! Reader for legacy file-based telemetry
//!
//! A legacy export directory holds two JSON-lines files:
//!
//! ```text
//! <dir>/sessions.jsonl
//! <dir>/tool_metrics.jsonl
//! ```
//!
//! ## Error Handling
//!
//! - **Missing directory**: returns an IO error.
//! - **Missing file**: recorded as a warning, the entity set is empty.
//! - **Malformed lines**: recorded in [`LegacyDataset::warnings`] with file
//!   and line number, line skipped, reading continues.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::types::{Session, ToolMetric};

pub const SESSIONS_FILE: &str = "sessions.jsonl";
pub const TOOL_METRICS_FILE: &str = "tool_metrics.jsonl";

/// Everything read from one legacy directory
#[derive(Debug, Default)]
pub struct LegacyDataset {
    pub source_dir: PathBuf,
    pub sessions: Vec<Session>,
    pub tool_metrics: Vec<ToolMetric>,
    pub warnings: Vec<String>,
}

impl LegacyDataset {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.tool_metrics.is_empty()
    }
}

/// Read both entity files from `dir`
pub fn load_dir(dir: &Path) -> Result<LegacyDataset> {
    if !dir.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("legacy directory not found: {}", dir.display()),
        )));
    }

    let mut dataset = LegacyDataset {
        source_dir: dir.to_path_buf(),
        ..Default::default()
    };
    dataset.sessions = read_jsonl(&dir.join(SESSIONS_FILE), &mut dataset.warnings)?;
    dataset.tool_metrics = read_jsonl(&dir.join(TOOL_METRICS_FILE), &mut dataset.warnings)?;

    tracing::info!(
        dir = %dir.display(),
        sessions = dataset.sessions.len(),
        tool_metrics = dataset.tool_metrics.len(),
        warnings = dataset.warnings.len(),
        "Loaded legacy data"
    );
    Ok(dataset)
}

fn read_jsonl<T: DeserializeOwned>(path: &Path, warnings: &mut Vec<String>) -> Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warnings.push(format!("{}: file not found", path.display()));
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open {}: {}", path.display(), e),
            )))
        }
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut records = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_number = index + 1;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warnings.push(format!("{}:{}: read error: {}", name, line_number, e));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(file = %name, line = line_number, error = %e, "Skipping malformed legacy record");
                warnings.push(format!("{}:{}: {}", name, line_number, e));
            }
        }
    }

    Ok(records)
}
