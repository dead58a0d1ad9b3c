use crate::models::{BackupChain, BackupJob};
use anyhow::Context;
use sqlx::{MySql, Pool};

/// Gets the chain for a (context, disk, repository) triple, if one is open.
pub async fn get_chain(
    pool: &Pool<MySql>,
    context_id: &str,
    disk_ordinal: i32,
    repository_id: &str,
) -> anyhow::Result<Option<BackupChain>> {
    let chain = sqlx::query_as::<_, BackupChain>(
        "SELECT * FROM backup_chain
         WHERE context_id = ? AND disk_ordinal = ? AND repository_id = ?",
    )
    .bind(context_id)
    .bind(disk_ordinal)
    .bind(repository_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch backup chain")?;

    Ok(chain)
}

/// Gets a chain by id.
pub async fn get_chain_by_id(pool: &Pool<MySql>, id: &str) -> anyhow::Result<Option<BackupChain>> {
    let chain = sqlx::query_as::<_, BackupChain>("SELECT * FROM backup_chain WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch backup chain by id")?;

    Ok(chain)
}

/// Registers the chain rooted at a new completed full backup.
///
/// A triple has at most one open chain; taking a new full closes the old
/// chain by replacing the row under the (context, disk, repository)
/// uniqueness key.
pub async fn register_chain(
    pool: &Pool<MySql>,
    id: &str,
    context_id: &str,
    disk_ordinal: i32,
    repository_id: &str,
    full_backup_id: &str,
    image_size: i64,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM backup_chain
         WHERE context_id = ? AND disk_ordinal = ? AND repository_id = ?",
    )
    .bind(context_id)
    .bind(disk_ordinal)
    .bind(repository_id)
    .execute(&mut *tx)
    .await
    .context("Failed to close previous chain")?;

    sqlx::query(
        r#"INSERT INTO backup_chain (
            id, context_id, disk_ordinal, repository_id,
            full_backup_id, latest_backup_id, backup_count, total_size_bytes
        ) VALUES (?, ?, ?, ?, ?, ?, 1, ?)"#,
    )
    .bind(id)
    .bind(context_id)
    .bind(disk_ordinal)
    .bind(repository_id)
    .bind(full_backup_id)
    .bind(full_backup_id)
    .bind(image_size)
    .execute(&mut *tx)
    .await
    .context("Failed to register backup chain")?;

    tx.commit().await?;
    Ok(())
}

/// Appends a completed incremental to an existing chain, advancing the tip.
pub async fn append_to_chain(
    pool: &Pool<MySql>,
    chain_id: &str,
    child_backup_id: &str,
    image_size: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE backup_chain SET
            latest_backup_id = ?,
            backup_count = backup_count + 1,
            total_size_bytes = total_size_bytes + ?
        WHERE id = ?"#,
    )
    .bind(child_backup_id)
    .bind(image_size)
    .bind(chain_id)
    .execute(pool)
    .await
    .context("Failed to append to backup chain")?;

    Ok(())
}

/// Moves a chain's tip back to the deleted tip's parent.
pub async fn retip_chain(
    pool: &Pool<MySql>,
    chain_id: &str,
    new_latest_id: &str,
    removed_size: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE backup_chain SET
            latest_backup_id = ?,
            backup_count = backup_count - 1,
            total_size_bytes = total_size_bytes - ?
        WHERE id = ?"#,
    )
    .bind(new_latest_id)
    .bind(removed_size)
    .bind(chain_id)
    .execute(pool)
    .await
    .context("Failed to re-tip backup chain")?;

    Ok(())
}

/// Removes a chain row (the chain is closed and its root deleted).
pub async fn delete_chain(pool: &Pool<MySql>, chain_id: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM backup_chain WHERE id = ?")
        .bind(chain_id)
        .execute(pool)
        .await
        .context("Failed to delete backup chain")?;

    Ok(())
}

/// Counts chains stored in a repository; repository deletion is refused
/// while this is non-zero.
pub async fn count_chains_in_repository(
    pool: &Pool<MySql>,
    repository_id: &str,
) -> anyhow::Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM backup_chain WHERE repository_id = ?")
            .bind(repository_id)
            .fetch_one(pool)
            .await
            .context("Failed to count chains in repository")?;

    Ok(count.0)
}

/// Lists the members of a chain ordered root..tip by walking parent links.
///
/// The walk is done in SQL-adjacent code rather than a recursive CTE so the
/// ordering logic stays visible and testable.
pub async fn list_chain_members(
    pool: &Pool<MySql>,
    chain: &BackupChain,
) -> anyhow::Result<Vec<BackupJob>> {
    let members = sqlx::query_as::<_, BackupJob>(
        "SELECT * FROM backup_job
         WHERE context_id = ? AND disk_ordinal = ? AND repository_id = ?
           AND status = 'completed'",
    )
    .bind(&chain.context_id)
    .bind(chain.disk_ordinal)
    .bind(&chain.repository_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch chain members")?;

    // Order root..tip by following parent_backup_id edges from the full.
    let mut ordered = Vec::with_capacity(members.len());
    let mut cursor = Some(chain.full_backup_id.clone());
    while let Some(current) = cursor.take() {
        let Some(job) = members.iter().find(|j| j.id == current) else {
            break;
        };
        ordered.push(job.clone());
        if current == chain.latest_backup_id {
            break;
        }
        cursor = members
            .iter()
            .find(|j| j.parent_backup_id.as_deref() == Some(current.as_str()))
            .map(|j| j.id.clone());
    }

    Ok(ordered)
}
