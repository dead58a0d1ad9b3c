use anyhow::Context;
use sqlx::{MySql, Pool};

/// Creates the metadata key/value table used for schema versioning.
pub async fn initialize_metadata_system(pool: &Pool<MySql>) -> anyhow::Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS metadata (
            meta_key VARCHAR(64) PRIMARY KEY,
            meta_value TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await
    .context("Failed to create metadata table")?;

    Ok(())
}

/// Gets a metadata value by key.
pub async fn get_meta_value(pool: &Pool<MySql>, key: &str) -> anyhow::Result<String> {
    let value: (String,) =
        sqlx::query_as("SELECT meta_value FROM metadata WHERE meta_key = ?")
            .bind(key)
            .fetch_one(pool)
            .await
            .context("Failed to fetch metadata value")?;

    Ok(value.0)
}

/// Sets a metadata value, inserting or replacing as needed.
pub async fn set_meta_value(pool: &Pool<MySql>, key: &str, value: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO metadata (meta_key, meta_value) VALUES (?, ?)
         ON DUPLICATE KEY UPDATE meta_value = VALUES(meta_value)",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set metadata value")?;

    Ok(())
}
