use crate::joblog::record::Record;
use async_trait::async_trait;
use sqlx::{MySql, Pool};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Destination for drained record batches.
///
/// A batch must land atomically: either every record in it is durable or
/// none is, so the writer can safely re-enqueue on failure.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_batch(&self, batch: &[Record]) -> anyhow::Result<()>;
}

/// Production sink: one MySQL transaction per batch.
pub struct DbSink {
    pool: Pool<MySql>,
}

impl DbSink {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSink for DbSink {
    async fn write_batch(&self, batch: &[Record]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in batch {
            match record {
                Record::JobStart {
                    job_id,
                    parent_id,
                    kind,
                    owner,
                    external_id,
                    at,
                } => {
                    sqlx::query(
                        r#"INSERT INTO job
                           (id, parent_id, kind, owner, external_id, status, created_at)
                           VALUES (?, ?, ?, ?, ?, 'running', ?)"#,
                    )
                    .bind(job_id)
                    .bind(parent_id)
                    .bind(kind)
                    .bind(owner)
                    .bind(external_id)
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                }
                Record::JobEnd {
                    job_id,
                    outcome,
                    error,
                    at,
                } => {
                    sqlx::query(
                        r#"UPDATE job SET status = ?, error = ?, completed_at = ?
                           WHERE id = ? AND status = 'running'"#,
                    )
                    .bind(outcome.as_str())
                    .bind(error)
                    .bind(at)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;

                    // Cascade failure to any children still open.
                    sqlx::query(
                        r#"UPDATE job
                           SET status = 'failed', error = 'parent job ended', completed_at = ?
                           WHERE parent_id = ? AND status = 'running'"#,
                    )
                    .bind(at)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
                }
                Record::StepStart {
                    step_id,
                    job_id,
                    name,
                    at,
                } => {
                    sqlx::query(
                        r#"INSERT INTO job_step (id, job_id, name, status, started_at)
                           VALUES (?, ?, ?, 'running', ?)"#,
                    )
                    .bind(step_id)
                    .bind(job_id)
                    .bind(name)
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                }
                Record::StepEnd {
                    step_id,
                    outcome,
                    error,
                    at,
                } => {
                    sqlx::query(
                        r#"UPDATE job_step SET status = ?, error = ?, completed_at = ?
                           WHERE id = ? AND status = 'running'"#,
                    )
                    .bind(outcome.as_str())
                    .bind(error)
                    .bind(at)
                    .bind(step_id)
                    .execute(&mut *tx)
                    .await?;
                }
                Record::Event(event) => {
                    sqlx::query(
                        r#"INSERT INTO log_event
                           (job_id, step_id, seq, level, message, attrs, recorded_at)
                           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                    )
                    .bind(&event.job_id)
                    .bind(&event.step_id)
                    .bind(event.seq)
                    .bind(event.level.as_str())
                    .bind(&event.message)
                    .bind(&event.attrs)
                    .bind(event.at)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Fan-out decorator: forwards every batch to the inner sink and appends
/// log events to a local text file. Per-job event order is preserved
/// because batches arrive from a single writer task.
pub struct TextFanoutSink {
    inner: Arc<dyn RecordSink>,
    path: PathBuf,
}

impl TextFanoutSink {
    pub fn new(inner: Arc<dyn RecordSink>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RecordSink for TextFanoutSink {
    async fn write_batch(&self, batch: &[Record]) -> anyhow::Result<()> {
        self.inner.write_batch(batch).await?;

        // Text fan-out is best-effort; a failure here must not fail the
        // batch that already landed durably.
        let mut lines = String::new();
        for record in batch {
            if let Record::Event(event) = record {
                lines.push_str(&format!(
                    "{} [{}] job={} {}\n",
                    event.at.to_rfc3339(),
                    event.level,
                    event.job_id,
                    event.message
                ));
            }
        }
        if !lines.is_empty() {
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(lines.as_bytes()).await {
                        log::warn!("log fan-out write failed: {}", e);
                    }
                }
                Err(e) => log::warn!("log fan-out open failed: {}", e),
            }
        }

        Ok(())
    }
}
