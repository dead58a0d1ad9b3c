// transport/endpoint.rs
//
// Block endpoints: the read/write surface the copy workers run against.
// Sources come from the platform collaborator as URLs; targets come from
// the export server.

use crate::transport::error::TransportError;
use crate::transport::nbd::NbdClient;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A connected block endpoint. Each worker owns its endpoints exclusively,
/// so methods take `&mut self` and implementations need no internal
/// locking.
#[async_trait]
pub trait BlockEndpoint: Send {
    fn size(&self) -> u64;
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), TransportError>;
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransportError>;
    /// Protocol-level zero request. Implementations that cannot elide
    /// return [`TransportError::ZeroUnsupported`] and the caller falls
    /// back to a positioned write of literal zeros.
    async fn write_zeroes(&mut self, offset: u64, len: u64) -> Result<(), TransportError>;
    async fn flush(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connects fresh endpoints; one call per worker per side.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BlockEndpoint>, TransportError>;
}

/// Endpoint address in URL form.
///
/// Supported schemes:
///   nbd://host:port/exportname
///   nbd+unix:///exportname?socket=/run/vmvault/nbd.sock
///   file:///absolute/path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointUrl {
    NbdTcp { addr: String, export: String },
    NbdUnix { socket: PathBuf, export: String },
    File { path: PathBuf },
}

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<EndpointUrl, TransportError> {
        if let Some(rest) = url.strip_prefix("nbd+unix:///") {
            let (export, query) = match rest.split_once('?') {
                Some((export, query)) => (export, query),
                None => return Err(TransportError::BadUrl(url.to_string())),
            };
            let socket = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("socket="))
                .ok_or_else(|| TransportError::BadUrl(url.to_string()))?;
            if export.is_empty() || socket.is_empty() {
                return Err(TransportError::BadUrl(url.to_string()));
            }
            return Ok(EndpointUrl::NbdUnix {
                socket: PathBuf::from(socket),
                export: export.to_string(),
            });
        }
        if let Some(rest) = url.strip_prefix("nbd://") {
            let (addr, export) = rest
                .split_once('/')
                .ok_or_else(|| TransportError::BadUrl(url.to_string()))?;
            if addr.is_empty() || export.is_empty() {
                return Err(TransportError::BadUrl(url.to_string()));
            }
            return Ok(EndpointUrl::NbdTcp {
                addr: addr.to_string(),
                export: export.to_string(),
            });
        }
        if let Some(path) = url.strip_prefix("file://") {
            if !path.starts_with('/') {
                return Err(TransportError::BadUrl(url.to_string()));
            }
            return Ok(EndpointUrl::File {
                path: PathBuf::from(path),
            });
        }
        Err(TransportError::BadUrl(url.to_string()))
    }
}

/// Connector resolving an [`EndpointUrl`] per connect call.
pub struct UrlConnector {
    url: EndpointUrl,
    writable: bool,
}

impl UrlConnector {
    pub fn new(url: EndpointUrl, writable: bool) -> Self {
        Self { url, writable }
    }

    pub fn parse(url: &str, writable: bool) -> Result<Self, TransportError> {
        Ok(Self::new(EndpointUrl::parse(url)?, writable))
    }
}

#[async_trait]
impl EndpointConnector for UrlConnector {
    async fn connect(&self) -> Result<Box<dyn BlockEndpoint>, TransportError> {
        match &self.url {
            EndpointUrl::NbdTcp { addr, export } => {
                let client = NbdClient::connect_tcp(addr, export).await?;
                Ok(Box::new(client))
            }
            EndpointUrl::NbdUnix { socket, export } => {
                let client = NbdClient::connect_unix(socket, export).await?;
                Ok(Box::new(client))
            }
            EndpointUrl::File { path } => {
                let endpoint = FileEndpoint::open(path, self.writable).await?;
                Ok(Box::new(endpoint))
            }
        }
    }
}

/// Local-file endpoint, used by loopback paths and tests.
pub struct FileEndpoint {
    file: File,
    size: u64,
}

impl FileEndpoint {
    pub async fn open(path: &Path, writable: bool) -> Result<FileEndpoint, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .len();
        Ok(FileEndpoint { file, size })
    }
}

#[async_trait]
impl BlockEndpoint for FileEndpoint {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn write_zeroes(&mut self, _offset: u64, _len: u64) -> Result<(), TransportError> {
        // Plain files have no zero primitive here; let the caller fall
        // back to a positioned write.
        Err(TransportError::ZeroUnsupported)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nbd_tcp_urls() {
        let url = EndpointUrl::parse("nbd://10.0.0.5:10809/backup-vm1-disk0-full-x").unwrap();
        assert_eq!(
            url,
            EndpointUrl::NbdTcp {
                addr: "10.0.0.5:10809".to_string(),
                export: "backup-vm1-disk0-full-x".to_string(),
            }
        );
    }

    #[test]
    fn parses_nbd_unix_urls() {
        let url =
            EndpointUrl::parse("nbd+unix:///myexport?socket=/run/vmvault/nbd.sock").unwrap();
        assert_eq!(
            url,
            EndpointUrl::NbdUnix {
                socket: PathBuf::from("/run/vmvault/nbd.sock"),
                export: "myexport".to_string(),
            }
        );
    }

    #[test]
    fn parses_file_urls() {
        let url = EndpointUrl::parse("file:///srv/disks/source.raw").unwrap();
        assert_eq!(
            url,
            EndpointUrl::File {
                path: PathBuf::from("/srv/disks/source.raw"),
            }
        );
    }

    #[test]
    fn rejects_malformed_urls() {
        for bad in [
            "http://example.com/x",
            "nbd://",
            "nbd://hostonly",
            "nbd+unix:///export",
            "file://relative/path",
            "",
        ] {
            assert!(EndpointUrl::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[tokio::test]
    async fn file_endpoint_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.raw");
        tokio::fs::write(&path, vec![0u8; 8192]).await.unwrap();

        let mut endpoint = FileEndpoint::open(&path, true).await.unwrap();
        assert_eq!(endpoint.size(), 8192);

        endpoint.write_at(100, b"payload").await.unwrap();
        let mut buf = vec![0u8; 7];
        endpoint.read_at(100, &mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");

        assert!(matches!(
            endpoint.write_zeroes(0, 4096).await,
            Err(TransportError::ZeroUnsupported)
        ));
    }
}
