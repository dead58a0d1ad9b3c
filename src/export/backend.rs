// export/backend.rs
//
// Per-connection backing store behind a served export: either a raw file
// (or block device) or a repository copy-on-write image with its chain.

use crate::export::error::ExportError;
use crate::export::include::ExportEntry;
use crate::repository::{CowImage, OpenMode};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Magic prefix distinguishing repository images from raw files.
const COW_MAGIC: &[u8; 8] = b"VMVCOW1\0";

pub enum ExportBackend {
    Raw {
        file: Mutex<File>,
        size: u64,
        read_only: bool,
    },
    Cow {
        image: CowImage,
        read_only: bool,
    },
}

impl ExportBackend {
    /// Opens the backing store for an export entry. Repository images are
    /// detected by magic, everything else is served raw at the size the
    /// include file declares.
    pub async fn open(entry: &ExportEntry) -> Result<ExportBackend, ExportError> {
        if is_cow_image(&entry.backing_path).await? {
            let mode = if entry.read_only {
                OpenMode::Read
            } else {
                OpenMode::ReadWrite
            };
            let image = CowImage::open(&entry.backing_path, mode).await?;
            Ok(ExportBackend::Cow {
                image,
                read_only: entry.read_only,
            })
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(!entry.read_only)
                .open(&entry.backing_path)
                .await?;
            Ok(ExportBackend::Raw {
                file: Mutex::new(file),
                size: entry.size_bytes,
                read_only: entry.read_only,
            })
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ExportBackend::Raw { size, .. } => *size,
            ExportBackend::Cow { image, .. } => image.virtual_size(),
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            ExportBackend::Raw { read_only, .. } => *read_only,
            ExportBackend::Cow { read_only, .. } => *read_only,
        }
    }

    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ExportError> {
        match self {
            ExportBackend::Raw { file, .. } => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(buf).await?;
                Ok(())
            }
            ExportBackend::Cow { image, .. } => Ok(image.read_at(offset, buf).await?),
        }
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), ExportError> {
        match self {
            ExportBackend::Raw { file, .. } => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(data).await?;
                Ok(())
            }
            ExportBackend::Cow { image, .. } => Ok(image.write_at(offset, data).await?),
        }
    }

    pub async fn write_zeroes(&self, offset: u64, len: u64) -> Result<(), ExportError> {
        match self {
            ExportBackend::Raw { file, .. } => {
                // Raw files have no allocation map; write literal zeros.
                let zeros = vec![0u8; (64 * 1024).min(len as usize)];
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut remaining = len;
                while remaining > 0 {
                    let n = remaining.min(zeros.len() as u64) as usize;
                    file.write_all(&zeros[..n]).await?;
                    remaining -= n as u64;
                }
                Ok(())
            }
            ExportBackend::Cow { image, .. } => Ok(image.write_zeroes(offset, len).await?),
        }
    }

    pub async fn flush(&self) -> Result<(), ExportError> {
        match self {
            ExportBackend::Raw { file, .. } => {
                let mut file = file.lock().await;
                file.flush().await?;
                file.sync_all().await?;
                Ok(())
            }
            ExportBackend::Cow { image, .. } => Ok(image.flush().await?),
        }
    }
}

async fn is_cow_image(path: &Path) -> Result<bool, ExportError> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) => return Err(ExportError::Io(e)),
    };
    let mut magic = [0u8; 8];
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(&magic == COW_MAGIC),
        Err(_) => Ok(false), // shorter than a header: raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn raw_and_cow_are_distinguished() {
        let dir = TempDir::new().unwrap();

        let raw_path = dir.path().join("plain.img");
        tokio::fs::write(&raw_path, vec![0u8; 4096]).await.unwrap();
        assert!(!is_cow_image(&raw_path).await.unwrap());

        let cow_path = dir.path().join("image.vvc");
        CowImage::create(&cow_path, 1024 * 1024, 64 * 1024, None)
            .await
            .unwrap();
        assert!(is_cow_image(&cow_path).await.unwrap());
    }

    #[tokio::test]
    async fn raw_backend_round_trips_at_declared_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.img");
        tokio::fs::write(&path, vec![0u8; 8192]).await.unwrap();

        let entry = ExportEntry {
            name: "e".to_string(),
            backing_path: PathBuf::from(&path),
            read_only: false,
            size_bytes: 8192,
        };
        let backend = ExportBackend::open(&entry).await.unwrap();
        assert_eq!(backend.size(), 8192);

        backend.write_at(1024, b"hello nbd").await.unwrap();
        let mut buf = vec![0u8; 9];
        backend.read_at(1024, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello nbd");
    }
}
