// transport/progress.rs
//
// Progress aggregation: workers publish byte deltas, one aggregator turns
// them into throttled external updates.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One external progress emission.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub cumulative_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    /// Bytes per second since the previous emission.
    pub throughput_bps: f64,
}

/// Emission throttle settings.
#[derive(Debug, Clone, Copy)]
pub struct ProgressPolicy {
    /// Minimum wall time between emissions.
    pub interval: Duration,
    /// Minimum percent advance between emissions.
    pub percent_step: f64,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            percent_step: 1.0,
        }
    }
}

/// Aggregates worker byte deltas into throttled [`ProgressUpdate`]s.
///
/// An update is emitted when either the interval has elapsed or the
/// percent-complete advanced by the configured step since the last
/// emission. A final 100 % update is guaranteed on successful completion
/// whatever the throttle state.
pub struct ProgressAggregator {
    delta_tx: mpsc::Sender<u64>,
    cumulative: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ProgressAggregator {
    pub fn start(
        total_bytes: u64,
        policy: ProgressPolicy,
        update_tx: mpsc::Sender<ProgressUpdate>,
    ) -> ProgressAggregator {
        let (delta_tx, mut delta_rx) = mpsc::channel::<u64>(256);
        let cumulative = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&cumulative);

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut last_emit_at = started;
            let mut last_emit_bytes = 0u64;
            let mut last_emit_percent = 0.0f64;
            let mut emitted_any = false;

            while let Some(delta) = delta_rx.recv().await {
                let cumulative = counter.fetch_add(delta, Ordering::AcqRel) + delta;
                let percent = percent_of(cumulative, total_bytes);

                let elapsed = last_emit_at.elapsed();
                let interval_due = elapsed >= policy.interval;
                let percent_due = percent - last_emit_percent >= policy.percent_step;
                if !interval_due && !percent_due {
                    continue;
                }

                let window = if emitted_any {
                    elapsed
                } else {
                    started.elapsed()
                };
                let update = ProgressUpdate {
                    cumulative_bytes: cumulative,
                    total_bytes,
                    percent,
                    throughput_bps: throughput(cumulative - last_emit_bytes, window),
                };
                if update_tx.send(update).await.is_err() {
                    // Receiver went away; keep draining so workers never
                    // block on the delta channel.
                    continue;
                }
                emitted_any = true;
                last_emit_at = Instant::now();
                last_emit_bytes = cumulative;
                last_emit_percent = percent;
            }

            // Delta channel closed: the transfer is over. Emit the final
            // record if the workers completed the whole change set.
            let cumulative = counter.load(Ordering::Acquire);
            if cumulative >= total_bytes {
                let update = ProgressUpdate {
                    cumulative_bytes: cumulative,
                    total_bytes,
                    percent: 100.0,
                    throughput_bps: throughput(
                        cumulative - last_emit_bytes,
                        last_emit_at.elapsed(),
                    ),
                };
                let _ = update_tx.send(update).await;
            } else {
                debug!(
                    "transfer ended early at {}/{} bytes; no final emission",
                    cumulative, total_bytes
                );
            }
        });

        ProgressAggregator {
            delta_tx,
            cumulative,
            task,
        }
    }

    /// Sender workers publish committed byte counts on.
    pub fn delta_sender(&self) -> mpsc::Sender<u64> {
        self.delta_tx.clone()
    }

    /// Bytes committed so far.
    pub fn cumulative_bytes(&self) -> u64 {
        self.cumulative.load(Ordering::Acquire)
    }

    /// Drops the internal sender and waits for the final emission.
    pub async fn finish(self) {
        drop(self.delta_tx);
        let _ = self.task.await;
    }
}

fn percent_of(cumulative: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        cumulative as f64 / total as f64 * 100.0
    }
}

fn throughput(bytes: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        bytes as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_fast() -> ProgressPolicy {
        ProgressPolicy {
            interval: Duration::from_millis(10),
            percent_step: 1.0,
        }
    }

    #[tokio::test]
    async fn final_emission_is_guaranteed_on_completion() {
        let (update_tx, mut update_rx) = mpsc::channel(64);
        let aggregator = ProgressAggregator::start(1000, policy_fast(), update_tx);

        let delta_tx = aggregator.delta_sender();
        delta_tx.send(400).await.unwrap();
        delta_tx.send(600).await.unwrap();
        drop(delta_tx);
        aggregator.finish().await;

        let mut updates = Vec::new();
        while let Some(update) = update_rx.recv().await {
            updates.push(update);
        }
        let last = updates.last().expect("expected at least the final record");
        assert_eq!(last.cumulative_bytes, 1000);
        assert_eq!(last.percent, 100.0);
    }

    #[tokio::test]
    async fn failed_transfer_emits_no_final_record() {
        let (update_tx, mut update_rx) = mpsc::channel(64);
        let aggregator = ProgressAggregator::start(1000, policy_fast(), update_tx);

        let delta_tx = aggregator.delta_sender();
        delta_tx.send(100).await.unwrap();
        drop(delta_tx);
        aggregator.finish().await;

        while let Some(update) = update_rx.recv().await {
            assert!(update.percent < 100.0);
        }
    }

    #[tokio::test]
    async fn percent_step_throttles_emissions() {
        let (update_tx, mut update_rx) = mpsc::channel(1024);
        let policy = ProgressPolicy {
            interval: Duration::from_secs(3600),
            percent_step: 10.0,
        };
        let aggregator = ProgressAggregator::start(1000, policy, update_tx);

        let delta_tx = aggregator.delta_sender();
        for _ in 0..100 {
            delta_tx.send(10).await.unwrap(); // 1% each
        }
        drop(delta_tx);
        aggregator.finish().await;

        let mut updates = Vec::new();
        while let Some(update) = update_rx.recv().await {
            updates.push(update);
        }
        // 10% steps plus the final record; far fewer than 100.
        assert!(updates.len() <= 12, "got {} updates", updates.len());
        for window in updates.windows(2) {
            assert!(window[1].cumulative_bytes >= window[0].cumulative_bytes);
        }
    }

    #[tokio::test]
    async fn zero_length_transfer_reports_complete() {
        let (update_tx, mut update_rx) = mpsc::channel(4);
        let aggregator = ProgressAggregator::start(0, policy_fast(), update_tx);
        aggregator.finish().await;

        let update = update_rx.recv().await.expect("final record");
        assert_eq!(update.percent, 100.0);
        assert_eq!(update.cumulative_bytes, 0);
    }
}
