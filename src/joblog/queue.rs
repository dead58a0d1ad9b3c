use crate::config::DropPolicy;
use crate::joblog::record::Record;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Bounded in-memory record queue between tracker callers and the writer.
///
/// The configured policy decides what a full queue does: under
/// `DropPolicy::DropOldest` the oldest queued record is discarded and the
/// caller never suspends; under `DropPolicy::Block` the caller waits for
/// the writer to drain.
pub struct RecordQueue {
    inner: Mutex<VecDeque<Record>>,
    capacity: usize,
    policy: DropPolicy,
    dropped: AtomicU64,
    readable: Notify,
    writable: Notify,
}

impl RecordQueue {
    pub fn new(capacity: usize, policy: DropPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    /// Enqueues a record, applying the queue-full policy.
    pub async fn push(&self, record: Record) {
        let mut record = Some(record);

        loop {
            {
                let mut queue = self.inner.lock();
                if queue.len() < self.capacity {
                    queue.push_back(record.take().unwrap());
                    drop(queue);
                    self.readable.notify_one();
                    return;
                }
                if self.policy == DropPolicy::DropOldest {
                    // Queue is full: discard the oldest record to make
                    // room.
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    queue.push_back(record.take().unwrap());
                    drop(queue);
                    self.readable.notify_one();
                    return;
                }
            }
            self.writable.notified().await;
        }
    }

    /// Re-enqueues a failed batch at the front, preserving order.
    pub fn push_front(&self, batch: Vec<Record>) {
        let mut queue = self.inner.lock();
        for record in batch.into_iter().rev() {
            queue.push_front(record);
        }
        drop(queue);
        self.readable.notify_one();
    }

    /// Pops up to `max` records. Returns an empty vec when the queue is
    /// empty.
    pub fn pop_batch(&self, max: usize) -> Vec<Record> {
        let mut queue = self.inner.lock();
        let n = queue.len().min(max);
        let batch: Vec<Record> = queue.drain(..n).collect();
        if !batch.is_empty() {
            self.writable.notify_waiters();
        }
        batch
    }

    /// Waits until at least one record is queued.
    pub async fn wait_readable(&self) {
        loop {
            if !self.inner.lock().is_empty() {
                return;
            }
            self.readable.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total records discarded under queue pressure since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn count_drop(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joblog::record::StampedEvent;
    use crate::models::LogLevel;
    use chrono::Utc;

    fn event(seq: i64) -> Record {
        Record::Event(StampedEvent {
            job_id: "j1".to_string(),
            step_id: None,
            seq,
            level: LogLevel::Info,
            message: format!("event {}", seq),
            attrs: None,
            at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn drop_oldest_discards_the_head() {
        let queue = RecordQueue::new(2, DropPolicy::DropOldest);
        queue.push(event(1)).await;
        queue.push(event(2)).await;
        queue.push(event(3)).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        let batch = queue.pop_batch(10);
        match &batch[0] {
            Record::Event(e) => assert_eq!(e.seq, 2),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn drop_oldest_applies_to_every_record_kind() {
        // The policy is uniform: a state record at the head goes the same
        // way an event would.
        let queue = RecordQueue::new(2, DropPolicy::DropOldest);
        queue
            .push(Record::JobEnd {
                job_id: "j1".to_string(),
                outcome: crate::models::Outcome::Ok,
                error: None,
                at: Utc::now(),
            })
            .await;
        queue.push(event(1)).await;
        queue.push(event(2)).await;

        assert_eq!(queue.dropped(), 1);
        let batch = queue.pop_batch(10);
        assert!(batch
            .iter()
            .all(|r| !matches!(r, Record::JobEnd { .. })));
    }

    #[tokio::test]
    async fn block_policy_waits_for_the_writer() {
        let queue = RecordQueue::new(1, DropPolicy::Block);
        queue.push(event(1)).await;

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.push(event(2)).await;
            })
        };

        // The producer is parked until a drain frees a slot; nothing is
        // ever dropped.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let batch = queue.pop_batch(1);
        assert_eq!(batch.len(), 1);
        blocked.await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn push_front_preserves_order() {
        let queue = RecordQueue::new(10, DropPolicy::DropOldest);
        queue.push(event(3)).await;
        let requeue = vec![event(1), event(2)];
        queue.push_front(requeue);

        let batch = queue.pop_batch(10);
        let seqs: Vec<i64> = batch
            .iter()
            .map(|r| match r {
                Record::Event(e) => e.seq,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
