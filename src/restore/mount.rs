// restore/mount.rs
//
// Restore mounts: expose a chain tip as a local block device through the
// export server's loopback attach, mount its filesystem read-only, and
// reap idle mounts.

use crate::config::RestoreConfig;
use crate::db::queries;
use crate::export::ExportServer;
use crate::repository::{CowImage, OpenMode, RepositoryManager};
use crate::restore::browse::{self, FileEntry};
use crate::restore::error::RestoreError;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One live restore mount.
struct MountState {
    backup_id: String,
    image_path: PathBuf,
    export_name: String,
    device: String,
    /// Filesystem mount point; None when the filesystem is unsupported
    /// and only the block device is exposed.
    fs_path: Option<PathBuf>,
    created_at: DateTime<Utc>,
    last_used: Instant,
}

/// Result of a mount call.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub mount_id: String,
    pub local_path: String,
    pub created_at: DateTime<Utc>,
}

pub struct MountManager {
    pool: Pool<MySql>,
    repositories: Arc<RepositoryManager>,
    exports: Arc<ExportServer>,
    export_socket: PathBuf,
    mount_root: PathBuf,
    idle_ttl: Duration,
    mounts: Arc<Mutex<HashMap<String, MountState>>>,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MountManager {
    pub fn new(
        pool: Pool<MySql>,
        repositories: Arc<RepositoryManager>,
        exports: Arc<ExportServer>,
        export_socket: impl Into<PathBuf>,
        config: &RestoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            repositories,
            exports,
            export_socket: export_socket.into(),
            mount_root: PathBuf::from(&config.mount_root),
            idle_ttl: Duration::from_secs(config.mount_idle_ttl_secs),
            mounts: Arc::new(Mutex::new(HashMap::new())),
            reaper: parking_lot::Mutex::new(None),
        })
    }

    /// Starts the idle reaper.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                manager.reap_idle().await;
            }
        });
        *self.reaper.lock() = Some(handle);
    }

    /// Attaches a completed backup's chain tip read-only and mounts its
    /// filesystem. Concurrent mounts of the same backup each get their
    /// own device and mount point.
    pub async fn mount(&self, backup_id: &str) -> Result<MountInfo, RestoreError> {
        let backup = queries::backup::get_backup_job(&self.pool, backup_id)
            .await?
            .filter(|b| b.status == "completed")
            .ok_or_else(|| RestoreError::BackupNotFound(backup_id.to_string()))?;
        let image_path = backup
            .image_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| RestoreError::BackupNotFound(backup_id.to_string()))?;

        // The tip must open cleanly (this also validates the chain).
        let image = CowImage::open(&image_path, OpenMode::Read).await?;
        if image.is_invalid() {
            return Err(RestoreError::BackupNotFound(format!(
                "backup {} image is marked invalid",
                backup_id
            )));
        }
        drop(image);

        let mount_id = Uuid::new_v4().to_string();
        let export_name = format!("restore-{}", mount_id);

        self.exports
            .create_file_export(&export_name, &image_path, false, None)
            .await?;
        self.repositories.pin_image(&image_path);

        let attach = async {
            let device = self.attach_loopback(&export_name).await?;
            let fs_path = match self.mount_filesystem(&mount_id, &device).await {
                Ok(path) => Some(path),
                Err(RestoreError::UnsupportedFilesystem) => {
                    // Block device stays exposed; List will report the
                    // unsupported filesystem.
                    warn!(
                        "backup {} has no mountable filesystem; exposing {} only",
                        backup_id, device
                    );
                    None
                }
                Err(e) => {
                    self.detach_loopback(&device).await;
                    return Err(e);
                }
            };
            Ok((device, fs_path))
        };

        let (device, fs_path) = match attach.await {
            Ok(result) => result,
            Err(e) => {
                let _ = self.exports.remove_export(&export_name).await;
                self.repositories.unpin_image(&image_path);
                return Err(e);
            }
        };

        let local_path = fs_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| device.clone());
        let created_at = Utc::now();

        self.mounts.lock().await.insert(
            mount_id.clone(),
            MountState {
                backup_id: backup_id.to_string(),
                image_path,
                export_name,
                device,
                fs_path,
                created_at,
                last_used: Instant::now(),
            },
        );

        info!("backup {} mounted as {} at {}", backup_id, mount_id, local_path);
        Ok(MountInfo {
            mount_id,
            local_path,
            created_at,
        })
    }

    /// Lists a directory within a mount. Fails with
    /// `UnsupportedFilesystem` when only the block device is exposed.
    pub async fn list(&self, mount_id: &str, path: &str) -> Result<Vec<FileEntry>, RestoreError> {
        let root = self.touch_and_root(mount_id).await?;
        browse::list_dir(&root, path).await
    }

    /// Opens a file within a mount for download.
    pub async fn download(
        &self,
        mount_id: &str,
        path: &str,
    ) -> Result<tokio::fs::File, RestoreError> {
        let root = self.touch_and_root(mount_id).await?;
        browse::open_file(&root, path).await
    }

    /// Unmounts and releases one mount.
    pub async fn unmount(&self, mount_id: &str) -> Result<(), RestoreError> {
        let state = self
            .mounts
            .lock()
            .await
            .remove(mount_id)
            .ok_or_else(|| RestoreError::MountNotFound(mount_id.to_string()))?;
        self.release(mount_id, state).await;
        Ok(())
    }

    /// Tears down every mount. Called on shutdown.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        let drained: Vec<(String, MountState)> = self.mounts.lock().await.drain().collect();
        for (mount_id, state) in drained {
            self.release(&mount_id, state).await;
        }
    }

    async fn touch_and_root(&self, mount_id: &str) -> Result<PathBuf, RestoreError> {
        let mut mounts = self.mounts.lock().await;
        let state = mounts
            .get_mut(mount_id)
            .ok_or_else(|| RestoreError::MountNotFound(mount_id.to_string()))?;
        state.last_used = Instant::now();
        state
            .fs_path
            .clone()
            .ok_or(RestoreError::UnsupportedFilesystem)
    }

    async fn reap_idle(&self) {
        let expired: Vec<(String, MountState)> = {
            let mut mounts = self.mounts.lock().await;
            let expired_ids: Vec<String> = mounts
                .iter()
                .filter(|(_, state)| state.last_used.elapsed() >= self.idle_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| mounts.remove(&id).map(|state| (id, state)))
                .collect()
        };

        for (mount_id, state) in expired {
            info!(
                "reaping idle restore mount {} of backup {}",
                mount_id, state.backup_id
            );
            self.release(&mount_id, state).await;
        }
    }

    async fn release(&self, mount_id: &str, state: MountState) {
        if let Some(fs_path) = &state.fs_path {
            match Command::new("umount").arg(fs_path).output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    "umount of {} failed: {}",
                    fs_path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("umount of {} failed: {}", fs_path.display(), e),
            }
            let _ = tokio::fs::remove_dir(fs_path).await;
        }

        self.detach_loopback(&state.device).await;

        if let Err(e) = self.exports.remove_export(&state.export_name).await {
            warn!("export removal for mount {} failed: {}", mount_id, e);
        }
        self.repositories.unpin_image(&state.image_path);
        debug!(
            "mount {} released (created {})",
            mount_id, state.created_at
        );
    }

    /// Attaches the export to a free kernel NBD device.
    async fn attach_loopback(&self, export_name: &str) -> Result<String, RestoreError> {
        for index in 0..16 {
            let device = format!("/dev/nbd{}", index);
            // A device with a pid node is already attached.
            if tokio::fs::try_exists(format!("/sys/block/nbd{}/pid", index))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            let output = Command::new("nbd-client")
                .arg("-unix")
                .arg(&self.export_socket)
                .arg("-N")
                .arg(export_name)
                .arg(&device)
                .arg("-readonly")
                .output()
                .await
                .map_err(|e| RestoreError::Command(format!("nbd-client: {}", e)))?;
            if output.status.success() {
                debug!("export {} attached at {}", export_name, device);
                return Ok(device);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("nbd-client on {} failed: {}", device, stderr.trim());
        }
        Err(RestoreError::NoFreeDevice)
    }

    async fn detach_loopback(&self, device: &str) {
        match Command::new("nbd-client").arg("-d").arg(device).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "nbd-client -d {} failed: {}",
                device,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("nbd-client -d {} failed: {}", device, e),
        }
    }

    /// Probes partitions and mounts the first filesystem read-only with
    /// journal recovery disabled.
    async fn mount_filesystem(
        &self,
        mount_id: &str,
        device: &str,
    ) -> Result<PathBuf, RestoreError> {
        let target = self.mount_root.join(mount_id);
        tokio::fs::create_dir_all(&target).await?;

        // Prefer the first partition; fall back to the whole device for
        // partitionless filesystems.
        let mut candidates = Vec::new();
        let output = Command::new("lsblk")
            .args(["-nlo", "NAME,TYPE", device])
            .output()
            .await
            .map_err(|e| RestoreError::Command(format!("lsblk: {}", e)))?;
        if output.status.success() {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let mut parts = line.split_whitespace();
                if let (Some(name), Some("part")) = (parts.next(), parts.next()) {
                    candidates.push(format!("/dev/{}", name));
                }
            }
        }
        candidates.push(device.to_string());

        for candidate in &candidates {
            // Read-only with journal recovery disabled; a dirty journal
            // must not trigger writes to an immutable chain.
            for options in ["ro,norecovery,noload", "ro"] {
                let output = Command::new("mount")
                    .args(["-o", options, candidate])
                    .arg(&target)
                    .output()
                    .await
                    .map_err(|e| RestoreError::Command(format!("mount: {}", e)))?;
                if output.status.success() {
                    return Ok(target);
                }
                debug!(
                    "mount {} -o {} failed: {}",
                    candidate,
                    options,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        let _ = tokio::fs::remove_dir(&target).await;
        Err(RestoreError::UnsupportedFilesystem)
    }
}
