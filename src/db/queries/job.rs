use crate::models::{Job, JobStep, LogEvent};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

// Writes to job/job_step/log_event go through the joblog batch writer so a
// batch stays one transaction; this module is the retrieval surface.

/// Gets a job by id.
pub async fn get_job(pool: &Pool<MySql>, id: &str) -> anyhow::Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM job WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch job")?;

    Ok(job)
}

/// Gets jobs carrying a business correlation id, oldest first.
pub async fn get_jobs_by_external_id(
    pool: &Pool<MySql>,
    external_id: &str,
) -> anyhow::Result<Vec<Job>> {
    let jobs =
        sqlx::query_as::<_, Job>("SELECT * FROM job WHERE external_id = ? ORDER BY created_at")
            .bind(external_id)
            .fetch_all(pool)
            .await
            .context("Failed to fetch jobs by external id")?;

    Ok(jobs)
}

/// Lists the steps of a job in start order.
pub async fn list_steps(pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<Vec<JobStep>> {
    let steps =
        sqlx::query_as::<_, JobStep>("SELECT * FROM job_step WHERE job_id = ? ORDER BY started_at")
            .bind(job_id)
            .fetch_all(pool)
            .await
            .context("Failed to list job steps")?;

    Ok(steps)
}

/// Fetches a job's log events in per-job order, optionally bounded by a
/// time range and minimum level.
pub async fn list_log_events(
    pool: &Pool<MySql>,
    job_id: &str,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    min_level: Option<&str>,
) -> anyhow::Result<Vec<LogEvent>> {
    let mut sql = String::from("SELECT * FROM log_event WHERE job_id = ?");
    if since.is_some() {
        sql.push_str(" AND recorded_at >= ?");
    }
    if until.is_some() {
        sql.push_str(" AND recorded_at < ?");
    }
    if min_level.is_some() {
        sql.push_str(
            " AND FIELD(level, 'debug', 'info', 'warn', 'error')
               >= FIELD(?, 'debug', 'info', 'warn', 'error')",
        );
    }
    sql.push_str(" ORDER BY seq");

    let mut query = sqlx::query_as::<_, LogEvent>(&sql).bind(job_id);
    if let Some(since) = since {
        query = query.bind(since);
    }
    if let Some(until) = until {
        query = query.bind(until);
    }
    if let Some(min_level) = min_level {
        query = query.bind(min_level);
    }

    let events = query
        .fetch_all(pool)
        .await
        .context("Failed to list log events")?;

    Ok(events)
}
