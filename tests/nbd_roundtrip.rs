// NBD client/server round trip against the export server: negotiation,
// reads, writes, zero requests and read-only enforcement.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vmvault::config::ExportConfig;
use vmvault::export::ExportServer;
use vmvault::transport::{BlockEndpoint, NbdClient, TransportError};

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

#[tokio::test]
async fn negotiates_and_reads_and_writes() {
    let harness = harness().await;

    let backing = harness.root.join("disk.img");
    tokio::fs::write(&backing, vec![0u8; 1024 * 1024]).await.unwrap();
    harness
        .server
        .create_file_export("rw-export", &backing, true, Some(1024 * 1024))
        .await
        .unwrap();

    let mut client = NbdClient::connect_unix(&harness.socket, "rw-export")
        .await
        .unwrap();
    assert_eq!(client.size(), 1024 * 1024);

    let payload: Vec<u8> = (0..8192).map(|i| (i % 199) as u8).collect();
    client.write_at(65536, &payload).await.unwrap();
    client.flush().await.unwrap();

    let mut readback = vec![0u8; 8192];
    client.read_at(65536, &mut readback).await.unwrap();
    assert_eq!(readback, payload);

    client.close().await.unwrap();

    // The bytes really landed in the backing file.
    let on_disk = tokio::fs::read(&backing).await.unwrap();
    assert_eq!(&on_disk[65536..65536 + 8192], payload.as_slice());
}

#[tokio::test]
async fn unknown_export_is_refused() {
    let harness = harness().await;
    let result = NbdClient::connect_unix(&harness.socket, "no-such-export").await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
}

#[tokio::test]
async fn read_only_export_rejects_writes() {
    let harness = harness().await;

    let backing = harness.root.join("ro.img");
    tokio::fs::write(&backing, vec![7u8; 65536]).await.unwrap();
    harness
        .server
        .create_file_export("ro-export", &backing, false, Some(65536))
        .await
        .unwrap();

    let mut client = NbdClient::connect_unix(&harness.socket, "ro-export")
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    client.read_at(0, &mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 7));

    let result = client.write_at(0, &[0u8; 512]).await;
    assert!(matches!(result, Err(TransportError::Remote(_))));

    client.close().await.unwrap();
}

#[tokio::test]
async fn out_of_range_requests_fail_cleanly() {
    let harness = harness().await;

    let backing = harness.root.join("small.img");
    tokio::fs::write(&backing, vec![0u8; 4096]).await.unwrap();
    harness
        .server
        .create_file_export("small-export", &backing, true, Some(4096))
        .await
        .unwrap();

    let mut client = NbdClient::connect_unix(&harness.socket, "small-export")
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    assert!(client.read_at(1, &mut buf).await.is_err());

    // The connection survives the error.
    client.read_at(0, &mut buf).await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn zero_request_zeroes_the_range() {
    let harness = harness().await;

    let backing = harness.root.join("zeroes.img");
    tokio::fs::write(&backing, vec![0xAAu8; 256 * 1024])
        .await
        .unwrap();
    harness
        .server
        .create_file_export("zero-export", &backing, true, Some(256 * 1024))
        .await
        .unwrap();

    let mut client = NbdClient::connect_unix(&harness.socket, "zero-export")
        .await
        .unwrap();
    client.write_zeroes(4096, 8192).await.unwrap();
    client.flush().await.unwrap();

    let mut buf = vec![0u8; 16384];
    client.read_at(0, &mut buf).await.unwrap();
    assert!(buf[..4096].iter().all(|&b| b == 0xAA));
    assert!(buf[4096..12288].iter().all(|&b| b == 0));
    assert!(buf[12288..].iter().all(|&b| b == 0xAA));

    client.close().await.unwrap();
}
