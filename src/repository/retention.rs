// repository/retention.rs
//
// Immutability policy: while a backup is inside its repository's retention
// window it cannot be deleted. A background sweeper advances the frontier.

use crate::cancel::CancelSignal;
use crate::db::queries;
use crate::models::{BackupJob, Repository};
use crate::repository::error::RepositoryError;
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use sqlx::{MySql, Pool};
use tokio::task::JoinHandle;

/// Computes the retention horizon a new backup gets in this repository, or
/// None when the repository is mutable.
pub fn retention_until(repository: &Repository) -> Option<chrono::DateTime<Utc>> {
    if !repository.immutable || repository.retention_days <= 0 {
        return None;
    }
    Some(Utc::now() + Duration::days(repository.retention_days as i64))
}

/// Checks the immutability policy for a delete request.
pub fn check_deletable(backup: &BackupJob) -> Result<(), RepositoryError> {
    if let Some(until) = backup.retention_until {
        if until > Utc::now() {
            return Err(RepositoryError::Immutable(until.to_rfc3339()));
        }
    }
    Ok(())
}

/// Periodic sweeper unlocking backups whose retention has elapsed.
///
/// The lock itself is the `retention_until` timestamp; the sweep clears
/// elapsed horizons so immutability checks stay a single column read and
/// operators can see the frontier move.
pub struct RetentionSweeper {
    pool: Pool<MySql>,
    interval: std::time::Duration,
    stop: CancelSignal,
}

impl RetentionSweeper {
    pub fn new(pool: Pool<MySql>, interval: std::time::Duration) -> Self {
        Self {
            pool,
            interval,
            stop: CancelSignal::new(),
        }
    }

    pub fn stop_signal(&self) -> CancelSignal {
        self.stop.clone()
    }

    /// Spawns the sweep loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = self.stop.cancelled() => return,
                }
                if let Err(e) = sweep_once(&self.pool).await {
                    warn!("retention sweep failed: {}", e);
                }
            }
        })
    }
}

/// One sweep pass over every immutable repository.
pub async fn sweep_once(pool: &Pool<MySql>) -> Result<u64, RepositoryError> {
    let repositories = queries::repository::list_immutable_repositories(pool).await?;
    let mut unlocked = 0u64;

    for repository in &repositories {
        let result = sqlx::query(
            "UPDATE backup_job SET retention_until = NULL
             WHERE repository_id = ? AND retention_until IS NOT NULL
               AND retention_until <= CURRENT_TIMESTAMP",
        )
        .bind(&repository.id)
        .execute(pool)
        .await
        .map_err(|e| RepositoryError::Database(e.into()))?;

        let rows = result.rows_affected();
        if rows > 0 {
            info!(
                "retention frontier advanced in repository {}: {} backup(s) unlocked",
                repository.id, rows
            );
        } else {
            debug!(
                "retention sweep of repository {}: nothing to unlock",
                repository.id
            );
        }
        unlocked += rows;
    }

    Ok(unlocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backup_with_retention(until: Option<chrono::DateTime<Utc>>) -> BackupJob {
        BackupJob {
            id: "bk-1".to_string(),
            context_id: "ctx-1".to_string(),
            disk_ordinal: 0,
            backup_type: "full".to_string(),
            status: "completed".to_string(),
            repository_id: "repo-1".to_string(),
            image_path: None,
            parent_backup_id: None,
            change_marker: None,
            bytes_transferred: 0,
            total_bytes: None,
            error_message: None,
            retention_until: until,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn in_retention_backup_is_immutable() {
        let backup = backup_with_retention(Some(Utc::now() + Duration::days(5)));
        assert!(matches!(
            check_deletable(&backup),
            Err(RepositoryError::Immutable(_))
        ));
    }

    #[test]
    fn elapsed_retention_allows_delete() {
        let backup =
            backup_with_retention(Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));
        assert!(check_deletable(&backup).is_ok());

        let backup = backup_with_retention(None);
        assert!(check_deletable(&backup).is_ok());
    }

    #[test]
    fn mutable_repository_has_no_horizon() {
        let repository = Repository {
            id: "repo-1".to_string(),
            name: "main".to_string(),
            kind: "local".to_string(),
            config: serde_json::json!({"path": "/srv/backups"}),
            enabled: true,
            immutable: false,
            retention_days: 7,
            total_bytes: 0,
            used_bytes: 0,
            available_bytes: 0,
            created_at: Utc::now(),
        };
        assert!(retention_until(&repository).is_none());

        let immutable = Repository {
            immutable: true,
            ..repository
        };
        let horizon = retention_until(&immutable).unwrap();
        assert!(horizon > Utc::now() + Duration::days(6));
    }
}
