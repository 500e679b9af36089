//! Content checksums for import reconciliation
//!
//! A checksum is SHA-256 over the canonical JSON of each record, one per
//! line, with records sorted by id. Sessions and tool metrics are hashed
//! separately and then combined, so the same rows always produce the same
//! digest regardless of input order.

use crate::error::Result;
use crate::types::{Record, Session, ToolMetric};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Source vs destination checksum for one import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValidation {
    pub source: String,
    pub destination: String,
    pub matches: bool,
    /// Input ids with no row in the destination
    pub missing_rows: usize,
}

/// Checksum of one entity collection
pub fn entity_checksum<R: Record>(records: &[R]) -> Result<String> {
    let mut sorted: Vec<&R> = records.iter().collect();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));

    let mut hasher = Sha256::new();
    for record in sorted {
        hasher.update(serde_json::to_vec(record)?);
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Combined checksum of a full data set
pub fn dataset_checksum(sessions: &[Session], tool_metrics: &[ToolMetric]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(b"sessions:");
    hasher.update(entity_checksum(sessions)?);
    hasher.update(b"\ntool_metrics:");
    hasher.update(entity_checksum(tool_metrics)?);
    Ok(hex::encode(hasher.finalize()))
}
