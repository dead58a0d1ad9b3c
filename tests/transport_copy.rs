// End-to-end transport tests: file-backed source, copy workers, NBD over a
// Unix socket into the export server, repository copy-on-write images.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use vmvault::cancel::CancelSignal;
use vmvault::config::ExportConfig;
use vmvault::export::ExportServer;
use vmvault::repository::{CowImage, OpenMode, DEFAULT_CLUSTER_SIZE};
use vmvault::transport::{
    run_copy, ChangedRange, CopyOptions, EndpointUrl, ProgressAggregator, ProgressPolicy,
    TransportError, UrlConnector,
};

const MIB: u64 = 1024 * 1024;

struct Harness {
    _dir: TempDir,
    server: Arc<ExportServer>,
    socket: PathBuf,
    root: PathBuf,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = ExportConfig {
        base_config: dir.path().join("server.conf").display().to_string(),
        include_dir: dir.path().join("conf.d").display().to_string(),
        socket_path: dir.path().join("nbd.sock").display().to_string(),
        listen_addr: None,
    };
    let server = ExportServer::new(&config);
    server.start().await.unwrap();
    Harness {
        socket: dir.path().join("nbd.sock"),
        root: dir.path().to_path_buf(),
        _dir: dir,
        server,
    }
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 31 + seed as u64) % 251) as u8)
        .collect()
}

fn target_connector(harness: &Harness, export: &str) -> Arc<UrlConnector> {
    Arc::new(UrlConnector::new(
        EndpointUrl::NbdUnix {
            socket: harness.socket.clone(),
            export: export.to_string(),
        },
        true,
    ))
}

fn source_connector(path: &std::path::Path) -> Arc<UrlConnector> {
    Arc::new(UrlConnector::parse(&format!("file://{}", path.display()), false).unwrap())
}

#[tokio::test]
async fn full_copy_lands_source_bytes_in_the_image() {
    let harness = harness().await;
    let capacity = 8 * MIB;

    // Source: patterned first 2 MiB, zeros, patterned tail.
    let source_path = harness.root.join("source.raw");
    let mut content = vec![0u8; capacity as usize];
    content[..2 * MIB as usize].copy_from_slice(&patterned(2 * MIB as usize, 1));
    let tail_start = capacity as usize - 512 * 1024;
    content[tail_start..].copy_from_slice(&patterned(512 * 1024, 9));
    tokio::fs::write(&source_path, &content).await.unwrap();

    let image_path = harness.root.join("full.vvc");
    CowImage::create(&image_path, capacity, DEFAULT_CLUSTER_SIZE, None)
        .await
        .unwrap();
    harness
        .server
        .create_file_export("full-copy", &image_path, true, None)
        .await
        .unwrap();

    let copied = run_copy(
        source_connector(&source_path),
        target_connector(&harness, "full-copy"),
        vec![ChangedRange::new(0, capacity)],
        CopyOptions {
            workers: 2,
            max_chunk: MIB,
        },
        CancelSignal::new(),
        mpsc::channel(64).0,
    )
    .await
    .unwrap();
    assert_eq!(copied, capacity);

    harness.server.remove_export("full-copy").await.unwrap();

    let image = CowImage::open(&image_path, OpenMode::Read).await.unwrap();
    let mut readback = vec![0u8; capacity as usize];
    image.read_at(0, &mut readback).await.unwrap();
    assert_eq!(readback, content);
}

#[tokio::test]
async fn zero_disk_copies_everything_but_allocates_nothing() {
    let harness = harness().await;
    let capacity = 16 * MIB;

    let source_path = harness.root.join("zeros.raw");
    tokio::fs::write(&source_path, vec![0u8; capacity as usize])
        .await
        .unwrap();

    let image_path = harness.root.join("zeros.vvc");
    CowImage::create(&image_path, capacity, DEFAULT_CLUSTER_SIZE, None)
        .await
        .unwrap();
    harness
        .server
        .create_file_export("zero-copy", &image_path, true, None)
        .await
        .unwrap();

    let copied = run_copy(
        source_connector(&source_path),
        target_connector(&harness, "zero-copy"),
        vec![ChangedRange::new(0, capacity)],
        CopyOptions {
            workers: 2,
            max_chunk: 4 * MIB,
        },
        CancelSignal::new(),
        mpsc::channel(64).0,
    )
    .await
    .unwrap();

    // All bytes count as transferred, but zero elision keeps the image at
    // header plus table.
    assert_eq!(copied, capacity);
    let image = CowImage::open(&image_path, OpenMode::Read).await.unwrap();
    assert!(image.physical_size().await.unwrap() <= MIB);

    // Elision is observationally invisible.
    let mut buf = vec![0xFFu8; 64 * 1024];
    image.read_at(7 * MIB, &mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn incremental_writes_only_the_delta_and_reads_merge_with_parent() {
    let harness = harness().await;
    let capacity = 8 * MIB;

    // Parent image holding the "previous backup": patterned everywhere.
    let parent_path = harness.root.join("parent.vvc");
    let parent = CowImage::create(&parent_path, capacity, DEFAULT_CLUSTER_SIZE, None)
        .await
        .unwrap();
    let base = patterned(capacity as usize, 3);
    parent.write_at(0, &base).await.unwrap();
    parent.flush().await.unwrap();
    drop(parent);

    // Current disk state: base plus two small deltas, 4 KiB at 1 MiB and
    // 64 KiB at 6 MiB.
    let mut current = base.clone();
    let delta_a = patterned(4096, 7);
    let delta_b = patterned(64 * 1024, 8);
    current[MIB as usize..MIB as usize + 4096].copy_from_slice(&delta_a);
    current[6 * MIB as usize..6 * MIB as usize + 64 * 1024].copy_from_slice(&delta_b);
    let source_path = harness.root.join("current.raw");
    tokio::fs::write(&source_path, &current).await.unwrap();

    let child_path = harness.root.join("child.vvc");
    CowImage::create(&child_path, capacity, DEFAULT_CLUSTER_SIZE, Some("parent.vvc"))
        .await
        .unwrap();
    harness
        .server
        .create_file_export("incr-copy", &child_path, true, None)
        .await
        .unwrap();

    let extents = vec![
        ChangedRange::new(MIB, 4096),
        ChangedRange::new(6 * MIB, 64 * 1024),
    ];
    let copied = run_copy(
        source_connector(&source_path),
        target_connector(&harness, "incr-copy"),
        extents,
        CopyOptions {
            workers: 2,
            max_chunk: MIB,
        },
        CancelSignal::new(),
        mpsc::channel(64).0,
    )
    .await
    .unwrap();
    assert_eq!(copied, 4096 + 64 * 1024);

    harness.server.remove_export("incr-copy").await.unwrap();

    // The chain tip shows current everywhere: deltas from the child,
    // untouched ranges through the parent.
    let tip = CowImage::open(&child_path, OpenMode::Read).await.unwrap();
    let mut readback = vec![0u8; capacity as usize];
    tip.read_at(0, &mut readback).await.unwrap();
    assert_eq!(readback, current);

    // Unchanged ranges were not copied into the child: it stays far
    // smaller than the parent.
    let child_size = tip.physical_size().await.unwrap();
    let parent_size = tokio::fs::metadata(&parent_path).await.unwrap().len();
    assert!(
        child_size < parent_size / 4,
        "child {} should be a fraction of parent {}",
        child_size,
        parent_size
    );
}

#[tokio::test]
async fn progress_reaches_one_hundred_percent_on_success() {
    let harness = harness().await;
    let capacity = 4 * MIB;

    let source_path = harness.root.join("progress.raw");
    tokio::fs::write(&source_path, patterned(capacity as usize, 5))
        .await
        .unwrap();

    let image_path = harness.root.join("progress.vvc");
    CowImage::create(&image_path, capacity, DEFAULT_CLUSTER_SIZE, None)
        .await
        .unwrap();
    harness
        .server
        .create_file_export("progress-copy", &image_path, true, None)
        .await
        .unwrap();

    let (update_tx, mut update_rx) = mpsc::channel(256);
    let aggregator = ProgressAggregator::start(
        capacity,
        ProgressPolicy {
            interval: Duration::from_millis(50),
            percent_step: 1.0,
        },
        update_tx,
    );

    run_copy(
        source_connector(&source_path),
        target_connector(&harness, "progress-copy"),
        vec![ChangedRange::new(0, capacity)],
        CopyOptions {
            workers: 2,
            max_chunk: MIB,
        },
        CancelSignal::new(),
        aggregator.delta_sender(),
    )
    .await
    .unwrap();
    aggregator.finish().await;

    let mut updates = Vec::new();
    while let Some(update) = update_rx.recv().await {
        updates.push(update);
    }
    let last = updates.last().expect("at least the final emission");
    assert_eq!(last.percent, 100.0);
    assert_eq!(last.cumulative_bytes, capacity);
    assert_eq!(last.total_bytes, capacity);
}

#[tokio::test]
async fn cancellation_stops_workers_at_the_next_suspension_point() {
    use async_trait::async_trait;
    use vmvault::transport::{BlockEndpoint, EndpointConnector, FileEndpoint};

    struct SlowSource {
        path: PathBuf,
    }

    struct SlowEndpoint {
        inner: FileEndpoint,
    }

    #[async_trait]
    impl BlockEndpoint for SlowEndpoint {
        fn size(&self) -> u64 {
            self.inner.size()
        }
        async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.inner.read_at(offset, buf).await
        }
        async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
            self.inner.write_at(offset, data).await
        }
        async fn write_zeroes(&mut self, offset: u64, len: u64) -> Result<(), TransportError> {
            self.inner.write_zeroes(offset, len).await
        }
        async fn flush(&mut self) -> Result<(), TransportError> {
            self.inner.flush().await
        }
        async fn close(&mut self) -> Result<(), TransportError> {
            self.inner.close().await
        }
    }

    #[async_trait]
    impl EndpointConnector for SlowSource {
        async fn connect(&self) -> Result<Box<dyn BlockEndpoint>, TransportError> {
            Ok(Box::new(SlowEndpoint {
                inner: FileEndpoint::open(&self.path, false).await?,
            }))
        }
    }

    let harness = harness().await;
    let capacity = 32 * MIB;

    let source_path = harness.root.join("slow.raw");
    tokio::fs::write(&source_path, patterned(capacity as usize, 2))
        .await
        .unwrap();

    let image_path = harness.root.join("slow.vvc");
    CowImage::create(&image_path, capacity, DEFAULT_CLUSTER_SIZE, None)
        .await
        .unwrap();
    harness
        .server
        .create_file_export("slow-copy", &image_path, true, None)
        .await
        .unwrap();

    let cancel = CancelSignal::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        })
    };

    let result = run_copy(
        Arc::new(SlowSource {
            path: source_path.clone(),
        }),
        target_connector(&harness, "slow-copy"),
        vec![ChangedRange::new(0, capacity)],
        CopyOptions {
            workers: 2,
            max_chunk: MIB,
        },
        cancel,
        mpsc::channel(64).0,
    )
    .await;

    canceller.await.unwrap();
    assert!(matches!(result, Err(TransportError::Cancelled)));

    // The export can be torn down and the partial image marked invalid,
    // exactly what the engine's teardown does.
    harness.server.remove_export("slow-copy").await.unwrap();
    CowImage::mark_invalid(&image_path).await.unwrap();
    let image = CowImage::open(&image_path, OpenMode::Read).await.unwrap();
    assert!(image.is_invalid());
}
