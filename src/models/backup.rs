use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One backup attempt for one disk.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub context_id: String,
    pub disk_ordinal: i32,
    pub backup_type: String, // enum: 'full', 'incremental'
    pub status: String,      // enum: 'pending', 'running', 'completed', 'failed', 'cancelled'
    pub repository_id: String,
    pub image_path: Option<String>,
    pub parent_backup_id: Option<String>,
    pub change_marker: Option<String>,
    pub bytes_transferred: i64,
    pub total_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub retention_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The chain of copy-on-write images rooted at one completed full backup
/// for one (context, disk, repository).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupChain {
    pub id: String,
    pub context_id: String,
    pub disk_ordinal: i32,
    pub repository_id: String,
    pub full_backup_id: String,
    pub latest_backup_id: String,
    pub backup_count: i32,
    pub total_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a backup copies the whole disk or only changed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }

    /// Short tag used in export names: "full" or "incr".
    pub fn export_tag(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incr",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(format!("unknown backup type '{}'", other)),
        }
    }
}

/// Lifecycle state of a backup job. Transitions are monotonic:
/// pending → running → {completed, failed, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupStatus::Completed | BackupStatus::Failed | BackupStatus::Cancelled
        )
    }

    /// True if `next` is a legal successor of `self` along the status DAG.
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        match (self, next) {
            (BackupStatus::Pending, BackupStatus::Running) => true,
            (BackupStatus::Pending, BackupStatus::Failed) => true,
            (BackupStatus::Pending, BackupStatus::Cancelled) => true,
            (BackupStatus::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            "cancelled" => Ok(BackupStatus::Cancelled),
            other => Err(format!("unknown backup status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(BackupStatus::Pending.can_transition_to(BackupStatus::Running));
        assert!(BackupStatus::Running.can_transition_to(BackupStatus::Completed));
        assert!(BackupStatus::Running.can_transition_to(BackupStatus::Failed));
        assert!(BackupStatus::Running.can_transition_to(BackupStatus::Cancelled));
        assert!(!BackupStatus::Completed.can_transition_to(BackupStatus::Running));
        assert!(!BackupStatus::Failed.can_transition_to(BackupStatus::Pending));
        assert!(!BackupStatus::Cancelled.can_transition_to(BackupStatus::Completed));
    }

    #[test]
    fn export_tag_is_short_form() {
        assert_eq!(BackupType::Full.export_tag(), "full");
        assert_eq!(BackupType::Incremental.export_tag(), "incr");
        assert_eq!(BackupType::Incremental.as_str(), "incremental");
    }
}
