use crate::joblog::queue::RecordQueue;
use crate::joblog::sink::RecordSink;
use log::{error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Max records per flush transaction.
const MAX_BATCH: usize = 100;

/// Flush floor: a queued record waits at most this long.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// How often a failed batch is retried before its records are dropped.
const WRITE_RETRIES: u32 = 3;

/// Background writer draining the record queue into a sink.
pub struct LogWriter {
    queue: Arc<RecordQueue>,
    sink: Arc<dyn RecordSink>,
    shutdown: Arc<AtomicBool>,
}

impl LogWriter {
    pub fn new(queue: Arc<RecordQueue>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            queue,
            sink,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the writer task. The returned handle resolves once the queue
    /// has drained after [`WriterHandle::shutdown`].
    pub fn spawn(self) -> WriterHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let queue = Arc::clone(&self.queue);
        let handle = tokio::spawn(async move { self.run().await });
        WriterHandle {
            shutdown,
            queue,
            handle,
        }
    }

    async fn run(self) {
        loop {
            let stopping = self.shutdown.load(Ordering::Acquire);
            if stopping && self.queue.is_empty() {
                return;
            }

            if self.queue.is_empty() {
                // Nothing queued; wait for a record or the flush tick.
                tokio::select! {
                    _ = self.queue.wait_readable() => {}
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => continue,
                }
            } else {
                // Let a partial batch accumulate, but never past the floor.
                tokio::time::sleep(FLUSH_INTERVAL).await;
            }

            loop {
                let batch = self.queue.pop_batch(MAX_BATCH);
                if batch.is_empty() {
                    break;
                }
                self.write_with_retry(batch).await;
            }
        }
    }

    /// Writes one batch, retrying transient failures. After the retry
    /// budget the batch is dropped and counted as lost; the substrate keeps
    /// accepting records afterwards.
    async fn write_with_retry(&self, batch: Vec<crate::joblog::Record>) {
        let mut attempt = 0;
        loop {
            match self.sink.write_batch(&batch).await {
                Ok(()) => return,
                Err(e) => {
                    attempt += 1;
                    if attempt >= WRITE_RETRIES {
                        error!(
                            "dropping {} tracker records after {} failed writes: {}",
                            batch.len(),
                            attempt,
                            e
                        );
                        self.queue.count_drop(batch.len() as u64);
                        return;
                    }
                    warn!(
                        "tracker batch write failed (attempt {}/{}): {}",
                        attempt, WRITE_RETRIES, e
                    );
                    tokio::time::sleep(Duration::from_millis(100 << (attempt * 2))).await;
                }
            }
        }
    }
}

/// Handle to the running writer task.
pub struct WriterHandle {
    shutdown: Arc<AtomicBool>,
    queue: Arc<RecordQueue>,
    handle: JoinHandle<()>,
}

impl WriterHandle {
    /// Requests drain-and-stop and waits for it.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        // Nudge the writer in case it is parked waiting for records.
        self.queue.push_front(Vec::new());
        let _ = self.handle.await;
    }
}
