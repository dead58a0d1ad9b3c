use crate::models::BackupType;
use serde::{Deserialize, Serialize};

/// One backup request for one (context, disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub context_id: String,
    pub disk_ordinal: i32,
    pub repository_id: String,
    pub backup_type: BackupType,
    #[serde(default)]
    pub policy: BackupPolicy,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Caller's size estimate, used for admission when enumeration has not
    /// run yet.
    #[serde(default)]
    pub total_bytes_hint: Option<u64>,
    /// Stable id for idempotent retries; minted by the engine when absent.
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Per-job policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Ask the hypervisor for a quiesced (filesystem-consistent) snapshot
    /// instead of a crash-consistent one.
    #[serde(default)]
    pub quiesce: bool,
}

/// Outcome of one backup execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub job_id: String,
    pub status: String,
    pub image_path: Option<String>,
    pub bytes_transferred: i64,
    pub change_marker: Option<String>,
    pub error: Option<String>,
}
