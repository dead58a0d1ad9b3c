// transport/copier.rs
//
// The copy workers: round-robin extent distribution, slice-wise transfer
// with zero elision, per-slice retry with backoff, cancellation at every
// suspension point.

use crate::cancel::CancelSignal;
use crate::transport::endpoint::{BlockEndpoint, EndpointConnector};
use crate::transport::error::TransportError;
use crate::transport::extent::ChangedRange;
use crate::transport::zero::{is_all_zero, probe_offsets, SAMPLED_PROBE_MIN, SAMPLE_LEN};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Backoff schedule for per-slice transient failures.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Worker-pool settings for one transfer.
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub workers: usize,
    pub max_chunk: u64,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            max_chunk: 32 * 1024 * 1024,
        }
    }
}

/// Copies the coalesced extents from source to target.
///
/// Extents are distributed round-robin across `options.workers` tasks;
/// each worker owns its own pair of connections and processes its extents
/// sequentially. Returns the bytes committed on success. Any worker
/// failure cancels the remaining workers and fails the whole transfer.
pub async fn run_copy(
    source: Arc<dyn EndpointConnector>,
    target: Arc<dyn EndpointConnector>,
    extents: Vec<ChangedRange>,
    options: CopyOptions,
    cancel: CancelSignal,
    delta_tx: mpsc::Sender<u64>,
) -> Result<u64, TransportError> {
    let workers = options.workers.max(1);

    let mut handles = Vec::with_capacity(workers);
    for worker_index in 0..workers {
        let assigned: Vec<ChangedRange> = extents
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, _)| i % workers == worker_index)
            .map(|(_, e)| e)
            .collect();
        if assigned.is_empty() {
            continue;
        }

        let source = Arc::clone(&source);
        let target = Arc::clone(&target);
        let cancel = cancel.clone();
        let delta_tx = delta_tx.clone();
        let max_chunk = options.max_chunk;

        handles.push(tokio::spawn(async move {
            run_worker(worker_index, source, target, assigned, max_chunk, cancel, delta_tx).await
        }));
    }
    drop(delta_tx);

    let mut copied = 0u64;
    let mut first_error: Option<TransportError> = None;
    let mut cancelled = false;
    for handle in handles {
        match handle.await {
            Ok(Ok(bytes)) => copied += bytes,
            Ok(Err(TransportError::Cancelled)) => cancelled = true,
            Ok(Err(e)) => {
                // Stop the remaining workers at their next suspension
                // point; the first real error wins.
                cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_error) => {
                cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(TransportError::Protocol(format!(
                        "worker task failed: {}",
                        join_error
                    )));
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None if cancelled => Err(TransportError::Cancelled),
        None => Ok(copied),
    }
}

async fn run_worker(
    index: usize,
    source: Arc<dyn EndpointConnector>,
    target: Arc<dyn EndpointConnector>,
    extents: Vec<ChangedRange>,
    max_chunk: u64,
    cancel: CancelSignal,
    delta_tx: mpsc::Sender<u64>,
) -> Result<u64, TransportError> {
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }

    let mut src = connect_with_retry(source.as_ref(), &cancel).await?;
    let mut dst = connect_with_retry(target.as_ref(), &cancel).await?;
    debug!("worker {} connected, {} extent(s)", index, extents.len());

    let result = worker_loop(&mut src, &mut dst, &extents, max_chunk, &cancel, &delta_tx).await;

    // Whatever happened, close both sides.
    let _ = src.close().await;
    let _ = dst.close().await;

    match &result {
        Ok(bytes) => debug!("worker {} done, {} bytes", index, bytes),
        Err(e) => warn!("worker {} failed: {}", index, e),
    }
    result
}

/// Connects one endpoint, retrying unreachable-endpoint failures on the
/// same backoff schedule as slice I/O.
async fn connect_with_retry(
    connector: &dyn EndpointConnector,
    cancel: &CancelSignal,
) -> Result<Box<dyn BlockEndpoint>, TransportError> {
    let mut attempt = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match connector.connect().await {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) if e.is_transient() && attempt < RETRY_BACKOFF.len() => {
                warn!("endpoint connect failed (attempt {}): {}", attempt + 1, e);
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_BACKOFF[attempt]) => {}
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn worker_loop(
    src: &mut Box<dyn BlockEndpoint>,
    dst: &mut Box<dyn BlockEndpoint>,
    extents: &[ChangedRange],
    max_chunk: u64,
    cancel: &CancelSignal,
    delta_tx: &mpsc::Sender<u64>,
) -> Result<u64, TransportError> {
    let mut copied = 0u64;

    for extent in extents {
        let mut offset = extent.offset;
        let end = extent.end();
        while offset < end {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let len = (end - offset).min(max_chunk);
            copy_slice(src, dst, offset, len, cancel).await?;

            // Committed; publish the delta. A dropped aggregator must not
            // kill the transfer.
            if delta_tx.send(len).await.is_err() {
                debug!("progress channel closed; continuing without progress");
            }
            copied += len;
            offset += len;
        }
    }

    dst.flush().await?;
    Ok(copied)
}

/// Runs an endpoint operation with the transient-failure retry schedule,
/// re-evaluating the operation on each attempt.
macro_rules! with_retry {
    ($cancel:expr, $op:expr) => {{
        let mut attempt = 0usize;
        loop {
            if $cancel.is_cancelled() {
                break Err(TransportError::Cancelled);
            }
            match $op {
                Ok(()) => break Ok(()),
                Err(e) if e.is_transient() && attempt < RETRY_BACKOFF.len() => {
                    warn!("transient transfer error (attempt {}): {}", attempt + 1, e);
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_BACKOFF[attempt]) => {}
                        _ = $cancel.cancelled() => break Err(TransportError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

/// Transfers one slice, eliding confirmed-zero content.
async fn copy_slice(
    src: &mut Box<dyn BlockEndpoint>,
    dst: &mut Box<dyn BlockEndpoint>,
    offset: u64,
    len: u64,
    cancel: &CancelSignal,
) -> Result<(), TransportError> {
    // Sampled probe on large slices: five 8 KiB anchors. A nonzero sample
    // proves the slice has data and skips the full-slice zero scan.
    let mut probe_says_zero = true;
    if len >= SAMPLED_PROBE_MIN {
        let mut sample = vec![0u8; SAMPLE_LEN as usize];
        for probe in probe_offsets(len) {
            with_retry!(cancel, src.read_at(offset + probe, &mut sample).await)?;
            if !is_all_zero(&sample) {
                probe_says_zero = false;
                break;
            }
        }
    }

    let mut data = vec![0u8; len as usize];
    with_retry!(cancel, src.read_at(offset, &mut data).await)?;

    let emit_zero = if len >= SAMPLED_PROBE_MIN {
        // Only a sampled-zero slice earns the full verification scan; the
        // probe already proved the others nonzero.
        probe_says_zero && is_all_zero(&data)
    } else {
        is_all_zero(&data)
    };

    if emit_zero {
        match with_retry!(cancel, dst.write_zeroes(offset, len).await) {
            Ok(()) => return Ok(()),
            Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
            Err(e) => {
                // Zero request failed at the target; fall back to a
                // positioned write of literal zeros for this slice only.
                debug!("zero request at {} failed ({}); writing zeros", offset, e);
            }
        }
    }

    with_retry!(cancel, dst.write_at(offset, &data).await)
}
