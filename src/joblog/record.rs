use crate::models::{LogLevel, Outcome};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// One queued tracker mutation. Every public tracker call turns into
/// exactly one of these; the writer drains them in batches.
#[derive(Debug, Clone)]
pub enum Record {
    JobStart {
        job_id: String,
        parent_id: Option<String>,
        kind: String,
        owner: String,
        external_id: Option<String>,
        at: DateTime<Utc>,
    },
    JobEnd {
        job_id: String,
        outcome: Outcome,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    StepStart {
        step_id: String,
        job_id: String,
        name: String,
        at: DateTime<Utc>,
    },
    StepEnd {
        step_id: String,
        outcome: Outcome,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    Event(StampedEvent),
}

/// A structured log event stamped with its per-job sequence number.
///
/// The sequence is assigned at enqueue time under the tracker's counter
/// lock, so per-job order survives batching and retries.
#[derive(Debug, Clone)]
pub struct StampedEvent {
    pub job_id: String,
    pub step_id: Option<String>,
    pub seq: i64,
    pub level: LogLevel,
    pub message: String,
    pub attrs: Option<Value>,
    pub at: DateTime<Utc>,
}
