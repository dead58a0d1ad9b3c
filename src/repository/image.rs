// repository/image.rs
//
// The repository's native sparse copy-on-write disk image format ("vvc").
//
// Layout:
//   [0, 4096)           fixed header, little-endian
//   [4096, data_start)  allocation table, one u64 file offset per cluster
//   [data_start, EOF)   cluster data, appended in allocation order
//
// A table entry of 0 means the cluster is unallocated; reads fall through
// to the backing image, or to zeros when there is none. Cluster data is
// written before its table entry so a crash can orphan a cluster but never
// point the table at garbage.

use crate::repository::error::RepositoryError;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

const MAGIC: &[u8; 8] = b"VMVCOW1\0";
const VERSION: u32 = 1;
const HEADER_SIZE: u64 = 4096;
/// Byte offset of the flags word within the header.
const FLAGS_OFFSET: u64 = 12;
/// Fixed header fields before the backing path bytes.
const FIXED_HEADER_LEN: usize = 8 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 4;

/// Image flag: the producing job failed; contents are not trustworthy.
const FLAG_INVALID: u32 = 1 << 0;

/// Default cluster size. Large enough to keep the allocation table of a
/// multi-TiB disk in the low megabytes, small enough that copy-up traffic
/// on partial writes stays reasonable.
pub const DEFAULT_CLUSTER_SIZE: u32 = 256 * 1024;

/// Open mode for [`CowImage::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Longest backing chain the engine will follow before declaring a cycle.
const MAX_CHAIN_DEPTH: u32 = 64;

#[derive(Debug, Clone)]
struct Header {
    flags: u32,
    cluster_size: u32,
    virtual_size: u64,
    table_offset: u64,
    table_entries: u64,
    data_start: u64,
    backing_path: Option<String>,
}

impl Header {
    fn encode(&self) -> Vec<u8> {
        let backing = self.backing_path.as_deref().unwrap_or("").as_bytes();
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.cluster_size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // reserved
        buf.extend_from_slice(&self.virtual_size.to_le_bytes());
        buf.extend_from_slice(&self.table_offset.to_le_bytes());
        buf.extend_from_slice(&self.table_entries.to_le_bytes());
        buf.extend_from_slice(&self.data_start.to_le_bytes());
        buf.extend_from_slice(&(backing.len() as u32).to_le_bytes());
        buf.extend_from_slice(backing);
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self, RepositoryError> {
        if raw.len() < HEADER_SIZE as usize || &raw[..8] != MAGIC {
            return Err(RepositoryError::Corrupt("bad image magic".into()));
        }
        let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(raw[o..o + 8].try_into().unwrap());

        let version = u32_at(8);
        if version != VERSION {
            return Err(RepositoryError::Corrupt(format!(
                "unsupported image version {}",
                version
            )));
        }

        let flags = u32_at(12);
        let cluster_size = u32_at(16);
        let virtual_size = u64_at(24);
        let table_offset = u64_at(32);
        let table_entries = u64_at(40);
        let data_start = u64_at(48);
        let backing_len = u32_at(56) as usize;

        if cluster_size == 0 || !cluster_size.is_power_of_two() {
            return Err(RepositoryError::Corrupt("bad cluster size".into()));
        }
        if backing_len > HEADER_SIZE as usize - FIXED_HEADER_LEN {
            return Err(RepositoryError::Corrupt("backing path overruns header".into()));
        }
        let expected_entries = virtual_size.div_ceil(cluster_size as u64);
        if table_entries != expected_entries {
            return Err(RepositoryError::Corrupt("table entry count mismatch".into()));
        }

        let backing_path = if backing_len == 0 {
            None
        } else {
            let bytes = &raw[FIXED_HEADER_LEN..FIXED_HEADER_LEN + backing_len];
            Some(
                std::str::from_utf8(bytes)
                    .map_err(|_| RepositoryError::Corrupt("backing path not UTF-8".into()))?
                    .to_string(),
            )
        };

        Ok(Self {
            flags,
            cluster_size,
            virtual_size,
            table_offset,
            table_entries,
            data_start,
            backing_path,
        })
    }
}

struct ImageInner {
    file: File,
    table: Vec<u64>,
    /// End of allocated data; the next cluster lands here.
    data_end: u64,
}

/// One open copy-on-write image, with its backing chain resolved.
pub struct CowImage {
    path: PathBuf,
    header: Header,
    inner: Mutex<ImageInner>,
    backing: Option<Box<CowImage>>,
    writable: bool,
}

impl CowImage {
    /// Creates a new sparse image. `backing` is stored as written (a name
    /// relative to the image's directory, by convention) and the referenced
    /// image must already exist with the same cluster size.
    pub async fn create(
        path: &Path,
        virtual_size: u64,
        cluster_size: u32,
        backing: Option<&str>,
    ) -> Result<CowImage, RepositoryError> {
        let table_entries = virtual_size.div_ceil(cluster_size as u64);
        let table_bytes = table_entries * 8;
        let data_start = (HEADER_SIZE + table_bytes).next_multiple_of(4096);

        let header = Header {
            flags: 0,
            cluster_size,
            virtual_size,
            table_offset: HEADER_SIZE,
            table_entries,
            data_start,
            backing_path: backing.map(str::to_string),
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        file.write_all(&header.encode()).await?;
        // Zero the table in bounded chunks.
        let zeros = vec![0u8; 64 * 1024];
        let mut remaining = data_start - HEADER_SIZE;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;

        let backing_image = Self::open_backing_at(path, &header, 1).await?;

        Ok(CowImage {
            path: path.to_path_buf(),
            inner: Mutex::new(ImageInner {
                file,
                table: vec![0; table_entries as usize],
                data_end: data_start,
            }),
            header,
            backing: backing_image,
            writable: true,
        })
    }

    /// Opens an existing image and its backing chain. The chain is opened
    /// read-only regardless of `mode`; only the tip is ever writable.
    pub async fn open(path: &Path, mode: OpenMode) -> Result<CowImage, RepositoryError> {
        Self::open_at_depth(path, mode, 0).await
    }

    async fn open_at_depth(
        path: &Path,
        mode: OpenMode,
        depth: u32,
    ) -> Result<CowImage, RepositoryError> {
        if depth >= MAX_CHAIN_DEPTH {
            return Err(RepositoryError::Corrupt(
                "backing chain exceeds maximum depth".into(),
            ));
        }

        let writable = mode == OpenMode::ReadWrite;
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .await
            .map_err(|e| match e.kind() {
                // A missing ancestor is a broken chain, not a plain miss.
                std::io::ErrorKind::NotFound if depth > 0 => {
                    RepositoryError::ParentNotFound(path.display().to_string())
                }
                _ => RepositoryError::Io(e),
            })?;

        let mut raw = vec![0u8; HEADER_SIZE as usize];
        file.read_exact(&mut raw).await.map_err(|_| {
            RepositoryError::Corrupt(format!("short header in {}", path.display()))
        })?;
        let header = Header::decode(&raw)?;

        // Load the allocation table.
        let mut table_raw = vec![0u8; (header.table_entries * 8) as usize];
        file.seek(SeekFrom::Start(header.table_offset)).await?;
        file.read_exact(&mut table_raw).await.map_err(|_| {
            RepositoryError::Corrupt(format!("short allocation table in {}", path.display()))
        })?;
        let table: Vec<u64> = table_raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let file_len = file.metadata().await?.len();
        let data_end = file_len.max(header.data_start);

        let backing = Self::open_backing_at(path, &header, depth + 1).await?;

        Ok(CowImage {
            path: path.to_path_buf(),
            header,
            inner: Mutex::new(ImageInner {
                file,
                table,
                data_end,
            }),
            backing,
            writable,
        })
    }

    async fn open_backing_at(
        path: &Path,
        header: &Header,
        depth: u32,
    ) -> Result<Option<Box<CowImage>>, RepositoryError> {
        let Some(backing_name) = &header.backing_path else {
            return Ok(None);
        };
        let backing_path = if Path::new(backing_name).is_absolute() {
            PathBuf::from(backing_name)
        } else {
            path.parent()
                .unwrap_or_else(|| Path::new("."))
                .join(backing_name)
        };
        // Box::pin breaks the async recursion cycle through the chain.
        let parent = Box::pin(Self::open_at_depth(&backing_path, OpenMode::Read, depth)).await?;
        if parent.header.cluster_size != header.cluster_size {
            return Err(RepositoryError::Corrupt(
                "backing cluster size mismatch".into(),
            ));
        }
        Ok(Some(Box::new(parent)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn virtual_size(&self) -> u64 {
        self.header.virtual_size
    }

    pub fn cluster_size(&self) -> u32 {
        self.header.cluster_size
    }

    pub fn backing_path(&self) -> Option<&str> {
        self.header.backing_path.as_deref()
    }

    pub fn is_invalid(&self) -> bool {
        self.header.flags & FLAG_INVALID != 0
    }

    /// Bytes the image file actually occupies.
    pub async fn physical_size(&self) -> Result<u64, RepositoryError> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }

    /// Reads `buf.len()` bytes at `offset`, resolving each cluster to the
    /// nearest ancestor that has written it; unwritten clusters read as
    /// zeros.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), RepositoryError> {
        self.check_bounds(offset, buf.len() as u64)?;

        let cluster_size = self.header.cluster_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let within = abs % cluster_size;
            let run = ((cluster_size - within) as usize).min(buf.len() - pos);
            let segment = &mut buf[pos..pos + run];

            // Walk the chain for the nearest ancestor owning this cluster.
            let mut node: Option<&CowImage> = Some(self);
            let mut filled = false;
            while let Some(img) = node {
                let cluster = (abs / cluster_size) as usize;
                let entry = {
                    let inner = img.inner.lock().await;
                    inner.table[cluster]
                };
                if entry != 0 {
                    let mut inner = img.inner.lock().await;
                    inner.file.seek(SeekFrom::Start(entry + within)).await?;
                    inner.file.read_exact(segment).await?;
                    filled = true;
                    break;
                }
                node = img.backing.as_deref();
            }
            if !filled {
                segment.fill(0);
            }

            pos += run;
        }

        Ok(())
    }

    /// Writes `data` at `offset`. Partial writes into an unallocated
    /// cluster copy up the parent's content first so the rest of the
    /// cluster stays correct.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), RepositoryError> {
        self.check_writable()?;
        self.check_bounds(offset, data.len() as u64)?;

        let cluster_size = self.header.cluster_size as u64;
        let mut pos = 0usize;
        while pos < data.len() {
            let abs = offset + pos as u64;
            let cluster = (abs / cluster_size) as usize;
            let within = abs % cluster_size;
            let run = ((cluster_size - within) as usize).min(data.len() - pos);
            let segment = &data[pos..pos + run];

            let entry = {
                let inner = self.inner.lock().await;
                inner.table[cluster]
            };

            if entry != 0 {
                let mut inner = self.inner.lock().await;
                inner.file.seek(SeekFrom::Start(entry + within)).await?;
                inner.file.write_all(segment).await?;
            } else {
                self.allocate_cluster(cluster, within, Some(segment)).await?;
            }

            pos += run;
        }

        Ok(())
    }

    /// Declares `[offset, offset+len)` zero. Unallocated clusters with no
    /// ancestor data are left untouched; everything else is materialised as
    /// literal zeros so chain reads stay correct.
    pub async fn write_zeroes(&self, offset: u64, len: u64) -> Result<(), RepositoryError> {
        self.check_writable()?;
        self.check_bounds(offset, len)?;

        let cluster_size = self.header.cluster_size as u64;
        let zeros = vec![0u8; cluster_size as usize];
        let mut abs = offset;
        let end = offset + len;
        while abs < end {
            let cluster = (abs / cluster_size) as usize;
            let within = abs % cluster_size;
            let run = (cluster_size - within).min(end - abs);

            let entry = {
                let inner = self.inner.lock().await;
                inner.table[cluster]
            };

            if entry != 0 {
                let mut inner = self.inner.lock().await;
                inner.file.seek(SeekFrom::Start(entry + within)).await?;
                inner.file.write_all(&zeros[..run as usize]).await?;
            } else if self.ancestor_has_cluster(cluster).await {
                // Ancestor data would shine through; mask it.
                self.allocate_cluster(cluster, within, Some(&zeros[..run as usize]))
                    .await?;
            }
            // No entry and no ancestor data: already reads as zero.

            abs += run;
        }

        Ok(())
    }

    /// Flushes file contents to stable storage.
    pub async fn flush(&self) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        inner.file.flush().await?;
        inner.file.sync_all().await?;
        Ok(())
    }

    /// Marks the image invalid (producing job failed). The flag is sticky;
    /// restore and chain operations refuse invalid images.
    pub async fn mark_invalid(path: &Path) -> Result<(), RepositoryError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path).await?;
        let mut raw = vec![0u8; HEADER_SIZE as usize];
        file.read_exact(&mut raw).await?;
        let mut header = Header::decode(&raw)?;
        header.flags |= FLAG_INVALID;
        file.seek(SeekFrom::Start(FLAGS_OFFSET)).await?;
        file.write_all(&header.flags.to_le_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Allocates a cluster, copying up parent content around the written
    /// segment. `within` is the byte offset of `data` inside the cluster.
    async fn allocate_cluster(
        &self,
        cluster: usize,
        within: u64,
        data: Option<&[u8]>,
    ) -> Result<(), RepositoryError> {
        let cluster_size = self.header.cluster_size as u64;
        let cluster_start = cluster as u64 * cluster_size;
        // The tail cluster may extend past the virtual size; it is stored
        // full-length anyway, the excess just never addressed.
        let mut content = vec![0u8; cluster_size as usize];

        let full_overwrite = data.map(|d| d.len() as u64 == cluster_size).unwrap_or(false);
        if !full_overwrite {
            if let Some(backing) = &self.backing {
                let readable = (backing.virtual_size().saturating_sub(cluster_start))
                    .min(cluster_size) as usize;
                if readable > 0 {
                    backing
                        .read_at(cluster_start, &mut content[..readable])
                        .await?;
                }
            }
        }
        if let Some(data) = data {
            content[within as usize..within as usize + data.len()].copy_from_slice(data);
        }

        let mut inner = self.inner.lock().await;
        // Re-check under the lock; a concurrent writer may have allocated.
        if inner.table[cluster] != 0 {
            let entry = inner.table[cluster];
            if let Some(data) = data {
                inner.file.seek(SeekFrom::Start(entry + within)).await?;
                inner.file.write_all(data).await?;
            }
            return Ok(());
        }

        let entry = inner.data_end;
        inner.file.seek(SeekFrom::Start(entry)).await?;
        inner.file.write_all(&content).await?;
        inner.data_end = entry + cluster_size;

        // Data is on disk; now publish the table entry.
        let table_pos = self.header.table_offset + cluster as u64 * 8;
        inner.file.seek(SeekFrom::Start(table_pos)).await?;
        inner.file.write_all(&entry.to_le_bytes()).await?;
        inner.table[cluster] = entry;

        Ok(())
    }

    /// True if any ancestor has allocated the given cluster.
    async fn ancestor_has_cluster(&self, cluster: usize) -> bool {
        let mut node = self.backing.as_deref();
        while let Some(img) = node {
            if cluster < img.header.table_entries as usize {
                let inner = img.inner.lock().await;
                if inner.table[cluster] != 0 {
                    return true;
                }
            }
            node = img.backing.as_deref();
        }
        false
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<(), RepositoryError> {
        if offset
            .checked_add(len)
            .map_or(true, |end| end > self.header.virtual_size)
        {
            return Err(RepositoryError::Corrupt(format!(
                "access [{}, {}+{}) beyond virtual size {}",
                offset, offset, len, self.header.virtual_size
            )));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if !self.writable {
            return Err(RepositoryError::Unsupported(
                "image opened read-only".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CLUSTER: u32 = 64 * 1024;

    #[tokio::test]
    async fn create_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("base.vvc");
        let image = CowImage::create(&path, 10 * 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();
        drop(image);

        let image = CowImage::open(&path, OpenMode::Read).await.unwrap();
        assert_eq!(image.virtual_size(), 10 * 1024 * 1024);
        assert_eq!(image.cluster_size(), CLUSTER);
        assert!(image.backing_path().is_none());
        assert!(!image.is_invalid());
    }

    #[tokio::test]
    async fn unwritten_regions_read_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("base.vvc");
        let image = CowImage::create(&path, 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();

        let mut buf = vec![0xAAu8; 8192];
        image.read_at(512 * 1024, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn writes_read_back_across_cluster_boundaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("base.vvc");
        let image = CowImage::create(&path, 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();

        // Straddle the boundary between clusters 0 and 1.
        let offset = CLUSTER as u64 - 1000;
        let data: Vec<u8> = (0..4000).map(|i| (i % 251) as u8).collect();
        image.write_at(offset, &data).await.unwrap();

        let mut buf = vec![0u8; 4000];
        image.read_at(offset, &mut buf).await.unwrap();
        assert_eq!(buf, data);

        // Bytes around the write are still zero.
        let mut before = vec![0xFFu8; 16];
        image.read_at(offset - 16, &mut before).await.unwrap();
        assert!(before.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn backing_chain_resolves_nearest_ancestor() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("base.vvc");
        let tip_path = dir.path().join("tip.vvc");

        let base = CowImage::create(&base_path, 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();
        base.write_at(0, &[1u8; 4096]).await.unwrap();
        base.write_at(200 * 1024, &[2u8; 4096]).await.unwrap();
        base.flush().await.unwrap();
        drop(base);

        let tip = CowImage::create(&tip_path, 1024 * 1024, CLUSTER, Some("base.vvc"))
            .await
            .unwrap();
        tip.write_at(0, &[9u8; 4096]).await.unwrap();

        // Cluster written in the tip wins.
        let mut buf = vec![0u8; 4096];
        tip.read_at(0, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 9));

        // Cluster only in the base falls through.
        tip.read_at(200 * 1024, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 2));

        // Cluster in neither reads zero.
        tip.read_at(512 * 1024, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn partial_write_copies_up_parent_content() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("base.vvc");
        let tip_path = dir.path().join("tip.vvc");

        let base = CowImage::create(&base_path, 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();
        base.write_at(0, &vec![7u8; CLUSTER as usize]).await.unwrap();
        base.flush().await.unwrap();
        drop(base);

        let tip = CowImage::create(&tip_path, 1024 * 1024, CLUSTER, Some("base.vvc"))
            .await
            .unwrap();
        // Overwrite 4 KiB in the middle of the first cluster.
        tip.write_at(8192, &[3u8; 4096]).await.unwrap();

        let mut buf = vec![0u8; 16384];
        tip.read_at(0, &mut buf).await.unwrap();
        assert!(buf[..8192].iter().all(|&b| b == 7));
        assert!(buf[8192..12288].iter().all(|&b| b == 3));
        assert!(buf[12288..].iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn write_zeroes_elides_on_unbacked_clusters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("base.vvc");
        let image = CowImage::create(&path, 8 * 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();

        let before = image.physical_size().await.unwrap();
        image.write_zeroes(0, 8 * 1024 * 1024).await.unwrap();
        let after = image.physical_size().await.unwrap();
        assert_eq!(before, after, "zeroing an empty image must not allocate");
    }

    #[tokio::test]
    async fn write_zeroes_masks_ancestor_data() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("base.vvc");
        let tip_path = dir.path().join("tip.vvc");

        let base = CowImage::create(&base_path, 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();
        base.write_at(0, &[5u8; 4096]).await.unwrap();
        base.flush().await.unwrap();
        drop(base);

        let tip = CowImage::create(&tip_path, 1024 * 1024, CLUSTER, Some("base.vvc"))
            .await
            .unwrap();
        tip.write_zeroes(0, 4096).await.unwrap();

        let mut buf = vec![0xFFu8; 4096];
        tip.read_at(0, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn mark_invalid_is_sticky() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.vvc");
        CowImage::create(&path, 1024 * 1024, CLUSTER, None)
            .await
            .unwrap();

        CowImage::mark_invalid(&path).await.unwrap();
        let image = CowImage::open(&path, OpenMode::Read).await.unwrap();
        assert!(image.is_invalid());
    }

    #[tokio::test]
    async fn zero_length_disk_creates_empty_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.vvc");
        let image = CowImage::create(&path, 0, CLUSTER, None).await.unwrap();
        assert_eq!(image.virtual_size(), 0);
        assert!(image.physical_size().await.unwrap() <= HEADER_SIZE);
    }

    #[tokio::test]
    async fn out_of_bounds_access_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.vvc");
        let image = CowImage::create(&path, 128 * 1024, CLUSTER, None)
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        assert!(image.read_at(128 * 1024 - 100, &mut buf).await.is_err());
        assert!(image.write_at(u64::MAX - 10, &buf).await.is_err());
    }
}
