use crate::joblog::queue::RecordQueue;
use crate::joblog::record::{Record, StampedEvent};
use crate::models::{Job, JobStep, LogEvent, LogLevel, Outcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Selector for [`JobTracker::query`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub job_id: Option<String>,
    pub external_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_level: Option<LogLevel>,
}

/// Front door of the job/log substrate.
///
/// All mutations are enqueued onto the bounded record queue and become
/// durable asynchronously; identifiers are minted synchronously so callers
/// can correlate immediately. A tracker failure never fails the business
/// operation that produced the record.
pub struct JobTracker {
    queue: Arc<RecordQueue>,
    /// Next per-job event sequence numbers.
    sequences: Mutex<HashMap<String, i64>>,
    /// Step → job index so EndStep callers only need the step id.
    step_jobs: Mutex<HashMap<String, String>>,
    /// Last event timestamp per job, to keep per-job timestamps
    /// non-decreasing even if the wall clock steps backwards.
    high_water: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl JobTracker {
    pub fn new(queue: Arc<RecordQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            sequences: Mutex::new(HashMap::new()),
            step_jobs: Mutex::new(HashMap::new()),
            high_water: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a new job, optionally as a child of another, and emits its
    /// start event. Returns the new job id.
    pub async fn start_job(
        &self,
        parent_id: Option<&str>,
        kind: &str,
        owner: &str,
        external_id: Option<&str>,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        let at = self.stamp(&job_id);

        self.queue
            .push(Record::JobStart {
                job_id: job_id.clone(),
                parent_id: parent_id.map(str::to_string),
                kind: kind.to_string(),
                owner: owner.to_string(),
                external_id: external_id.map(str::to_string),
                at,
            })
            .await;

        self.log(&job_id, None, LogLevel::Info, &format!("{} started", kind), None)
            .await;

        job_id
    }

    /// Opens a step within a job. Returns the new step id.
    pub async fn start_step(&self, job_id: &str, name: &str) -> String {
        let step_id = Uuid::new_v4().to_string();
        let at = self.stamp(job_id);

        self.step_jobs
            .lock()
            .insert(step_id.clone(), job_id.to_string());

        self.queue
            .push(Record::StepStart {
                step_id: step_id.clone(),
                job_id: job_id.to_string(),
                name: name.to_string(),
                at,
            })
            .await;

        step_id
    }

    /// Closes a step.
    pub async fn end_step(&self, step_id: &str, outcome: Outcome, error: Option<&str>) {
        let job_id = self.step_jobs.lock().remove(step_id);
        let at = match &job_id {
            Some(job_id) => self.stamp(job_id),
            None => Utc::now(),
        };

        self.queue
            .push(Record::StepEnd {
                step_id: step_id.to_string(),
                outcome,
                error: error.map(str::to_string),
                at,
            })
            .await;
    }

    /// Closes a job. The sink cascades `failed` to any still-open children.
    pub async fn end_job(&self, job_id: &str, outcome: Outcome, error: Option<&str>) {
        let at = self.stamp(job_id);

        self.queue
            .push(Record::JobEnd {
                job_id: job_id.to_string(),
                outcome,
                error: error.map(str::to_string),
                at,
            })
            .await;

        self.sequences.lock().remove(job_id);
        self.high_water.lock().remove(job_id);
    }

    /// Appends a structured log event to a job and optionally a step.
    pub async fn log(
        &self,
        job_id: &str,
        step_id: Option<&str>,
        level: LogLevel,
        message: &str,
        attrs: Option<Value>,
    ) {
        let at = self.stamp(job_id);
        let seq = {
            let mut sequences = self.sequences.lock();
            let seq = sequences.entry(job_id.to_string()).or_insert(0);
            *seq += 1;
            *seq
        };

        self.queue
            .push(Record::Event(StampedEvent {
                job_id: job_id.to_string(),
                step_id: step_id.map(str::to_string),
                seq,
                level,
                message: message.to_string(),
                attrs,
                at,
            }))
            .await;
    }

    /// Retrieval surface for APIs and diagnostics. Events come back in
    /// per-job order.
    pub async fn query(
        &self,
        pool: &Pool<MySql>,
        query: &EventQuery,
    ) -> anyhow::Result<Vec<LogEvent>> {
        let min_level = query.min_level.map(|l| l.as_str());

        let job_ids: Vec<String> = if let Some(job_id) = &query.job_id {
            vec![job_id.clone()]
        } else if let Some(external_id) = &query.external_id {
            crate::db::queries::job::get_jobs_by_external_id(pool, external_id)
                .await?
                .into_iter()
                .map(|j| j.id)
                .collect()
        } else {
            anyhow::bail!("event query needs a job id or an external id");
        };

        let mut events = Vec::new();
        for job_id in &job_ids {
            let mut batch = crate::db::queries::job::list_log_events(
                pool,
                job_id,
                query.since,
                query.until,
                min_level,
            )
            .await?;
            events.append(&mut batch);
        }

        Ok(events)
    }

    /// Fetches a job record.
    pub async fn get_job(&self, pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<Option<Job>> {
        crate::db::queries::job::get_job(pool, job_id).await
    }

    /// Fetches a job's steps in start order.
    pub async fn get_steps(
        &self,
        pool: &Pool<MySql>,
        job_id: &str,
    ) -> anyhow::Result<Vec<JobStep>> {
        crate::db::queries::job::list_steps(pool, job_id).await
    }

    /// Records discarded under queue pressure or write failure.
    pub fn lost_records(&self) -> u64 {
        self.queue.dropped()
    }

    /// Produces a timestamp that never decreases within one job.
    fn stamp(&self, job_id: &str) -> DateTime<Utc> {
        let now = Utc::now();
        let mut high_water = self.high_water.lock();
        let entry = high_water.entry(job_id.to_string()).or_insert(now);
        if now > *entry {
            *entry = now;
        }
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DropPolicy;
    use crate::joblog::Record;

    fn tracker_with_queue(capacity: usize) -> (Arc<JobTracker>, Arc<RecordQueue>) {
        let queue = RecordQueue::new(capacity, DropPolicy::DropOldest);
        (JobTracker::new(Arc::clone(&queue)), queue)
    }

    #[tokio::test]
    async fn start_job_enqueues_state_then_event() {
        let (tracker, queue) = tracker_with_queue(16);
        let job_id = tracker.start_job(None, "backup", "engine", Some("bk-1")).await;

        let batch = queue.pop_batch(10);
        assert_eq!(batch.len(), 2);
        match &batch[0] {
            Record::JobStart {
                job_id: id,
                external_id,
                ..
            } => {
                assert_eq!(id, &job_id);
                assert_eq!(external_id.as_deref(), Some("bk-1"));
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert!(matches!(&batch[1], Record::Event(_)));
    }

    #[tokio::test]
    async fn event_sequences_are_per_job_monotonic() {
        let (tracker, queue) = tracker_with_queue(64);
        let a = tracker.start_job(None, "backup", "engine", None).await;
        let b = tracker.start_job(None, "restore", "engine", None).await;

        for i in 0..3 {
            tracker
                .log(&a, None, LogLevel::Info, &format!("a{}", i), None)
                .await;
            tracker
                .log(&b, None, LogLevel::Info, &format!("b{}", i), None)
                .await;
        }

        let mut a_seqs = Vec::new();
        let mut b_seqs = Vec::new();
        for record in queue.pop_batch(100) {
            if let Record::Event(e) = record {
                if e.job_id == a {
                    a_seqs.push(e.seq);
                } else {
                    b_seqs.push(e.seq);
                }
            }
        }
        assert_eq!(a_seqs, vec![1, 2, 3, 4]);
        assert_eq!(b_seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn end_step_resolves_owning_job() {
        let (tracker, queue) = tracker_with_queue(64);
        let job_id = tracker.start_job(None, "backup", "engine", None).await;
        let step_id = tracker.start_step(&job_id, "snapshotting").await;
        tracker.end_step(&step_id, Outcome::Ok, None).await;

        let records = queue.pop_batch(100);
        let end = records
            .iter()
            .find(|r| matches!(r, Record::StepEnd { .. }))
            .unwrap();
        match end {
            Record::StepEnd {
                step_id: id,
                outcome,
                ..
            } => {
                assert_eq!(id, &step_id);
                assert_eq!(*outcome, Outcome::Ok);
            }
            _ => unreachable!(),
        }
    }
}
