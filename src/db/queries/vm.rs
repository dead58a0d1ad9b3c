use crate::models::{Disk, VmContext};
use anyhow::Context;
use sqlx::{MySql, Pool};

/// Gets a VM context by id.
pub async fn get_context(pool: &Pool<MySql>, context_id: &str) -> anyhow::Result<Option<VmContext>> {
    let context = sqlx::query_as::<_, VmContext>("SELECT * FROM vm_context WHERE id = ?")
        .bind(context_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch VM context")?;

    Ok(context)
}

/// Gets one disk of a VM context by ordinal.
pub async fn get_disk(
    pool: &Pool<MySql>,
    context_id: &str,
    disk_ordinal: i32,
) -> anyhow::Result<Option<Disk>> {
    let disk = sqlx::query_as::<_, Disk>(
        "SELECT * FROM disk WHERE context_id = ? AND disk_ordinal = ?",
    )
    .bind(context_id)
    .bind(disk_ordinal)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch disk")?;

    Ok(disk)
}

/// Lists all disks of a VM context, ordered by ordinal.
pub async fn list_disks(pool: &Pool<MySql>, context_id: &str) -> anyhow::Result<Vec<Disk>> {
    let disks = sqlx::query_as::<_, Disk>(
        "SELECT * FROM disk WHERE context_id = ? ORDER BY disk_ordinal",
    )
    .bind(context_id)
    .fetch_all(pool)
    .await
    .context("Failed to list disks")?;

    Ok(disks)
}

/// Stores a disk's change marker after a successful backup.
///
/// The marker is only ever advanced by a completed job; failed and
/// cancelled jobs leave the previous marker in place.
pub async fn update_change_marker(
    pool: &Pool<MySql>,
    context_id: &str,
    disk_ordinal: i32,
    change_marker: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE disk SET change_marker = ? WHERE context_id = ? AND disk_ordinal = ?")
        .bind(change_marker)
        .bind(context_id)
        .bind(disk_ordinal)
        .execute(pool)
        .await
        .context("Failed to update disk change marker")?;

    Ok(())
}
