use crate::models::Repository;
use anyhow::Context;
use sqlx::{MySql, Pool};

/// Creates a new repository row.
pub async fn create_repository(
    pool: &Pool<MySql>,
    id: &str,
    name: &str,
    kind: &str,
    config: &serde_json::Value,
    immutable: bool,
    retention_days: i32,
) -> anyhow::Result<Repository> {
    sqlx::query(
        r#"INSERT INTO repository (id, name, kind, config, immutable, retention_days)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(id)
    .bind(name)
    .bind(kind)
    .bind(config)
    .bind(immutable)
    .bind(retention_days)
    .execute(pool)
    .await
    .context("Failed to create repository")?;

    let repository = sqlx::query_as::<_, Repository>("SELECT * FROM repository WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("Failed to read back created repository")?;

    Ok(repository)
}

/// Gets a repository by id.
pub async fn get_repository(pool: &Pool<MySql>, id: &str) -> anyhow::Result<Option<Repository>> {
    let repository = sqlx::query_as::<_, Repository>("SELECT * FROM repository WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch repository")?;

    Ok(repository)
}

/// Lists all repositories.
pub async fn list_repositories(pool: &Pool<MySql>) -> anyhow::Result<Vec<Repository>> {
    let repositories = sqlx::query_as::<_, Repository>("SELECT * FROM repository ORDER BY name")
        .fetch_all(pool)
        .await
        .context("Failed to list repositories")?;

    Ok(repositories)
}

/// Lists immutable repositories for the retention sweeper.
pub async fn list_immutable_repositories(pool: &Pool<MySql>) -> anyhow::Result<Vec<Repository>> {
    let repositories =
        sqlx::query_as::<_, Repository>("SELECT * FROM repository WHERE immutable = TRUE")
            .fetch_all(pool)
            .await
            .context("Failed to list immutable repositories")?;

    Ok(repositories)
}

/// Updates a repository's storage accounting after a refresh.
pub async fn update_storage(
    pool: &Pool<MySql>,
    id: &str,
    total_bytes: i64,
    used_bytes: i64,
    available_bytes: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE repository SET total_bytes = ?, used_bytes = ?, available_bytes = ?
         WHERE id = ?",
    )
    .bind(total_bytes)
    .bind(used_bytes)
    .bind(available_bytes)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to update repository storage accounting")?;

    Ok(())
}

/// Deletes a repository row.
pub async fn delete_repository(pool: &Pool<MySql>, id: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM repository WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete repository")?;

    Ok(())
}
