use crate::models::BackupJob;
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

/// Filter for [`list_backups`]. All fields are optional and ANDed together.
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub context_id: Option<String>,
    pub repository_id: Option<String>,
    pub status: Option<String>,
    pub backup_type: Option<String>,
}

/// Creates a new backup job row in `pending` state.
pub async fn create_backup_job(
    pool: &Pool<MySql>,
    id: &str,
    context_id: &str,
    disk_ordinal: i32,
    backup_type: &str,
    repository_id: &str,
    parent_backup_id: Option<&str>,
) -> anyhow::Result<BackupJob> {
    tracing::info!(
        backup_id = id,
        context_id = context_id,
        disk_ordinal = disk_ordinal,
        "Creating backup job record"
    );

    sqlx::query(
        r#"INSERT INTO backup_job (
            id, context_id, disk_ordinal, backup_type, status,
            repository_id, parent_backup_id
        ) VALUES (?, ?, ?, ?, 'pending', ?, ?)"#,
    )
    .bind(id)
    .bind(context_id)
    .bind(disk_ordinal)
    .bind(backup_type)
    .bind(repository_id)
    .bind(parent_backup_id)
    .execute(pool)
    .await
    .context("Failed to create backup job")?;

    let job = sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_job WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("Failed to read back created backup job")?;

    Ok(job)
}

/// Gets a backup job by id.
pub async fn get_backup_job(pool: &Pool<MySql>, id: &str) -> anyhow::Result<Option<BackupJob>> {
    let job = sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_job WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch backup job")?;

    Ok(job)
}

/// Lists backup jobs matching a filter, newest first.
pub async fn list_backups(
    pool: &Pool<MySql>,
    filter: &BackupFilter,
    page: i64,
    page_size: i64,
) -> anyhow::Result<Vec<BackupJob>> {
    let mut sql = String::from("SELECT * FROM backup_job WHERE 1 = 1");
    if filter.context_id.is_some() {
        sql.push_str(" AND context_id = ?");
    }
    if filter.repository_id.is_some() {
        sql.push_str(" AND repository_id = ?");
    }
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.backup_type.is_some() {
        sql.push_str(" AND backup_type = ?");
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, BackupJob>(&sql);
    if let Some(context_id) = &filter.context_id {
        query = query.bind(context_id);
    }
    if let Some(repository_id) = &filter.repository_id {
        query = query.bind(repository_id);
    }
    if let Some(status) = &filter.status {
        query = query.bind(status);
    }
    if let Some(backup_type) = &filter.backup_type {
        query = query.bind(backup_type);
    }

    let jobs = query
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(pool)
        .await
        .context("Failed to list backup jobs")?;

    Ok(jobs)
}

/// Marks a backup job running and stamps started_at.
pub async fn mark_running(pool: &Pool<MySql>, id: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE backup_job SET status = 'running', started_at = CURRENT_TIMESTAMP
         WHERE id = ? AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark backup job running")?;

    Ok(())
}

/// Records the target image path once the repository created it.
pub async fn set_image_path(pool: &Pool<MySql>, id: &str, image_path: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE backup_job SET image_path = ? WHERE id = ?")
        .bind(image_path)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to set backup image path")?;

    Ok(())
}

/// Records total bytes once enumeration finished.
pub async fn set_total_bytes(pool: &Pool<MySql>, id: &str, total_bytes: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE backup_job SET total_bytes = ? WHERE id = ?")
        .bind(total_bytes)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to set backup total bytes")?;

    Ok(())
}

/// Updates the running byte counter from a progress emission.
pub async fn set_bytes_transferred(
    pool: &Pool<MySql>,
    id: &str,
    bytes_transferred: i64,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE backup_job SET bytes_transferred = ? WHERE id = ?")
        .bind(bytes_transferred)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to update bytes transferred")?;

    Ok(())
}

/// Completes a backup job: terminal status, transfer stats, the change
/// marker captured at the end of the job, and the retention horizon if the
/// repository is immutable.
pub async fn complete_backup_job(
    pool: &Pool<MySql>,
    id: &str,
    bytes_transferred: i64,
    change_marker: &str,
    retention_until: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE backup_job SET
            status = 'completed',
            bytes_transferred = ?,
            change_marker = ?,
            retention_until = ?,
            completed_at = CURRENT_TIMESTAMP
        WHERE id = ? AND status = 'running'"#,
    )
    .bind(bytes_transferred)
    .bind(change_marker)
    .bind(retention_until)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to complete backup job")?;

    Ok(())
}

/// Marks a backup job failed or cancelled with an optional error message.
pub async fn finish_backup_job(
    pool: &Pool<MySql>,
    id: &str,
    status: &str,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE backup_job SET
            status = ?,
            error_message = ?,
            completed_at = CURRENT_TIMESTAMP
        WHERE id = ? AND status IN ('pending', 'running')"#,
    )
    .bind(status)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to finish backup job")?;

    Ok(())
}

/// Deletes a backup job row.
pub async fn delete_backup_job(pool: &Pool<MySql>, id: &str) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM backup_job WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete backup job")?;

    tx.commit().await?;
    Ok(())
}

/// Counts completed children backing onto the given backup.
pub async fn count_children(pool: &Pool<MySql>, id: &str) -> anyhow::Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM backup_job WHERE parent_backup_id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .context("Failed to count backup children")?;

    Ok(count.0)
}
