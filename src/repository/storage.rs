// repository/storage.rs
//
// Repository registry: owns image persistence, backend mount lifecycle,
// capacity accounting and space reservations.

use crate::db::queries;
use crate::models::{Repository, RepositoryKind};
use crate::repository::error::RepositoryError;
use crate::repository::image::{CowImage, OpenMode, DEFAULT_CLUSTER_SIZE};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{MySql, Pool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;
use uuid::Uuid;

/// Backend-specific repository configuration, stored as JSON in the
/// repository row and tagged by the row's `kind` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendConfig {
    Local(LocalConfig),
    Nfs(NfsConfig),
    Cifs(CifsConfig),
    Object(ObjectConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Absolute directory the repository lives in.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsConfig {
    pub server: String,
    pub export_path: String,
    #[serde(default)]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CifsConfig {
    pub server: String,
    pub share: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Free/used/total bytes of a repository's underlying store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// Registry of repositories and their live process-local state.
pub struct RepositoryManager {
    pool: Pool<MySql>,
    /// Root under which NFS/CIFS backends are mounted.
    mount_root: PathBuf,
    /// Repository ids whose backend is currently mounted.
    mounted: Mutex<HashSet<String>>,
    /// Image paths pinned by a live export or restore mount.
    in_use: Mutex<HashMap<PathBuf, u32>>,
    /// Outstanding space reservations per repository, bytes.
    reservations: Mutex<HashMap<String, u64>>,
}

impl RepositoryManager {
    pub fn new(pool: Pool<MySql>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            mount_root: mount_root.into(),
            mounted: Mutex::new(HashSet::new()),
            in_use: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    /// Creates and persists a repository after validating its backend.
    pub async fn create_repository(
        &self,
        name: &str,
        kind: RepositoryKind,
        config: BackendConfig,
        immutable: bool,
        retention_days: i32,
    ) -> Result<Repository, RepositoryError> {
        self.validate_backend(kind, &config).await?;

        let id = Uuid::new_v4().to_string();
        let config_json = serde_json::to_value(&config)
            .map_err(|e| RepositoryError::Config(e.to_string()))?;

        let repository = queries::repository::create_repository(
            &self.pool,
            &id,
            name,
            kind.as_str(),
            &config_json,
            immutable,
            retention_days,
        )
        .await?;

        // Seed the storage accounting so admission control works from the
        // first job.
        if let Err(e) = self.refresh_storage(&id).await {
            warn!("initial storage refresh failed for repository {}: {}", id, e);
        }

        info!("repository {} ({}) created as {}", name, kind, id);
        match queries::repository::get_repository(&self.pool, &id).await? {
            Some(updated) => Ok(updated),
            None => Ok(repository),
        }
    }

    /// Validates reachability and free space without persisting anything.
    pub async fn test_repository(
        &self,
        kind: RepositoryKind,
        config: &BackendConfig,
    ) -> Result<(), RepositoryError> {
        self.validate_backend(kind, config).await
    }

    pub async fn get_repository(&self, repo_id: &str) -> Result<Repository, RepositoryError> {
        queries::repository::get_repository(&self.pool, repo_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(repo_id.to_string()))
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, RepositoryError> {
        Ok(queries::repository::list_repositories(&self.pool).await?)
    }

    /// Deletes a repository. Refused while any chain still lives in it.
    pub async fn delete_repository(&self, repo_id: &str) -> Result<(), RepositoryError> {
        let repository = self.get_repository(repo_id).await?;

        let chains = queries::chain::count_chains_in_repository(&self.pool, repo_id).await?;
        if chains > 0 {
            return Err(RepositoryError::InUse(format!(
                "repository {} still holds {} chain(s)",
                repo_id, chains
            )));
        }

        self.unmount_backend(&repository).await;
        queries::repository::delete_repository(&self.pool, repo_id).await?;
        info!("repository {} deleted", repo_id);
        Ok(())
    }

    /// Resolves the local directory a repository's images live in,
    /// mounting the backend on first use.
    pub async fn backend_root(&self, repository: &Repository) -> Result<PathBuf, RepositoryError> {
        let kind = RepositoryKind::from_str(&repository.kind)
            .map_err(RepositoryError::Config)?;
        let config = self.parse_config(kind, &repository.config)?;

        match (kind, &config) {
            (RepositoryKind::Local, BackendConfig::Local(local)) => {
                let path = PathBuf::from(&local.path);
                if !path.is_absolute() {
                    return Err(RepositoryError::Config(format!(
                        "repository path {} is not absolute",
                        local.path
                    )));
                }
                if !path.is_dir() {
                    return Err(RepositoryError::Unavailable(format!(
                        "repository directory {} does not exist",
                        local.path
                    )));
                }
                Ok(path)
            }
            (RepositoryKind::Nfs, _) | (RepositoryKind::Cifs, _) => {
                self.ensure_mounted(repository, kind, &config).await
            }
            (RepositoryKind::Object, _) => Err(RepositoryError::Unsupported(
                "object-store repositories do not expose a local root yet".into(),
            )),
            _ => Err(RepositoryError::Config(format!(
                "configuration does not match repository kind {}",
                repository.kind
            ))),
        }
    }

    /// Creates a new sparse copy-on-write image for a backup.
    ///
    /// Chain members share one directory per (context, disk), so backing
    /// references stay relative file names.
    pub async fn create_image(
        &self,
        repository: &Repository,
        context_id: &str,
        disk_ordinal: i32,
        backup_id: &str,
        virtual_size: u64,
        parent_file: Option<&str>,
    ) -> Result<PathBuf, RepositoryError> {
        let root = self.backend_root(repository).await?;
        let dir = root.join(format!("{}-disk{}", context_id, disk_ordinal));
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(parent) = parent_file {
            let parent_path = dir.join(parent);
            let parent_image = CowImage::open(&parent_path, OpenMode::Read)
                .await
                .map_err(|e| match e {
                    RepositoryError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        RepositoryError::ParentNotFound(parent_path.display().to_string())
                    }
                    RepositoryError::Io(e) => {
                        RepositoryError::ParentUnavailable(e.to_string())
                    }
                    other => other,
                })?;
            if parent_image.is_invalid() {
                return Err(RepositoryError::ParentUnavailable(format!(
                    "parent image {} is marked invalid",
                    parent
                )));
            }
        }

        let path = dir.join(format!("{}.vvc", backup_id));
        CowImage::create(&path, virtual_size, DEFAULT_CLUSTER_SIZE, parent_file).await?;
        info!(
            "created image {} ({} bytes virtual, parent {:?})",
            path.display(),
            virtual_size,
            parent_file
        );
        Ok(path)
    }

    /// Opens an image file.
    pub async fn open_image(
        &self,
        path: &Path,
        mode: OpenMode,
    ) -> Result<CowImage, RepositoryError> {
        CowImage::open(path, mode).await
    }

    /// Deletes an image file. Fails with `InUse` while an export or mount
    /// pins it and `HasChildren` while a sibling backs onto it.
    pub async fn delete_image(&self, path: &Path) -> Result<(), RepositoryError> {
        if self.is_pinned(path) {
            return Err(RepositoryError::InUse(path.display().to_string()));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RepositoryError::Config("image path has no file name".into()))?;

        // Any sibling naming this image as backing blocks the delete.
        if let Some(dir) = path.parent() {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let sibling = entry.path();
                if sibling == path || sibling.extension().and_then(|e| e.to_str()) != Some("vvc")
                {
                    continue;
                }
                match CowImage::open(&sibling, OpenMode::Read).await {
                    Ok(image) => {
                        if image.backing_path() == Some(file_name) {
                            return Err(RepositoryError::HasChildren(
                                path.display().to_string(),
                            ));
                        }
                    }
                    Err(e) => warn!(
                        "skipping unreadable sibling {} during delete: {}",
                        sibling.display(),
                        e
                    ),
                }
            }
        }

        tokio::fs::remove_file(path).await?;
        info!("deleted image {}", path.display());
        Ok(())
    }

    /// Pins an image for a live export or restore mount. Pins nest.
    pub fn pin_image(&self, path: &Path) {
        *self.in_use.lock().entry(path.to_path_buf()).or_insert(0) += 1;
    }

    /// Releases one pin.
    pub fn unpin_image(&self, path: &Path) {
        let mut in_use = self.in_use.lock();
        if let Some(count) = in_use.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                in_use.remove(path);
            }
        }
    }

    fn is_pinned(&self, path: &Path) -> bool {
        self.in_use.lock().contains_key(path)
    }

    /// Reserves space for an upcoming transfer; part of targeting.
    /// Released by [`release_reservation`] at finalise or failure.
    pub async fn reserve_space(
        &self,
        repo_id: &str,
        bytes: u64,
    ) -> Result<(), RepositoryError> {
        let repository = self.get_repository(repo_id).await?;
        let mut reservations = self.reservations.lock();
        let reserved = reservations.entry(repo_id.to_string()).or_insert(0);
        let effective_available =
            (repository.available_bytes.max(0) as u64).saturating_sub(*reserved);
        if effective_available < bytes {
            return Err(RepositoryError::InsufficientSpace {
                needed: bytes,
                available: effective_available,
            });
        }
        *reserved += bytes;
        Ok(())
    }

    /// Releases a reservation taken by [`reserve_space`].
    pub fn release_reservation(&self, repo_id: &str, bytes: u64) {
        let mut reservations = self.reservations.lock();
        if let Some(reserved) = reservations.get_mut(repo_id) {
            *reserved = reserved.saturating_sub(bytes);
            if *reserved == 0 {
                reservations.remove(repo_id);
            }
        }
    }

    /// Recomputes used/available from the underlying store and updates the
    /// repository row. Called after every successful job and on demand.
    pub async fn refresh_storage(&self, repo_id: &str) -> Result<StorageInfo, RepositoryError> {
        let repository = self.get_repository(repo_id).await?;
        let root = self.backend_root(&repository).await?;
        let info = filesystem_info(&root)?;

        queries::repository::update_storage(
            &self.pool,
            repo_id,
            info.total_bytes as i64,
            info.used_bytes as i64,
            info.available_bytes as i64,
        )
        .await?;

        Ok(info)
    }

    /// Pre-admission check for a full backup: the backend must have at
    /// least one full backup's worth of free space.
    pub async fn check_space_for_full(
        &self,
        repository: &Repository,
        expected_bytes: u64,
    ) -> Result<(), RepositoryError> {
        let root = self.backend_root(repository).await?;
        let info = filesystem_info(&root)?;
        if info.available_bytes < expected_bytes {
            return Err(RepositoryError::InsufficientSpace {
                needed: expected_bytes,
                available: info.available_bytes,
            });
        }
        Ok(())
    }

    /// Unmounts every backend this process mounted. Called on shutdown.
    pub async fn shutdown(&self) {
        let repositories = match self.list_repositories().await {
            Ok(r) => r,
            Err(e) => {
                warn!("could not enumerate repositories during shutdown: {}", e);
                return;
            }
        };
        for repository in &repositories {
            self.unmount_backend(repository).await;
        }
    }

    async fn validate_backend(
        &self,
        kind: RepositoryKind,
        config: &BackendConfig,
    ) -> Result<(), RepositoryError> {
        match (kind, config) {
            (RepositoryKind::Local, BackendConfig::Local(local)) => {
                let path = Path::new(&local.path);
                if !path.is_absolute() {
                    return Err(RepositoryError::Config(format!(
                        "repository path {} is not absolute",
                        local.path
                    )));
                }
                if !path.is_dir() {
                    return Err(RepositoryError::Unavailable(format!(
                        "repository directory {} does not exist",
                        local.path
                    )));
                }
                // Probe writability the obvious way.
                let probe = path.join(format!(".vmvault-probe-{}", Uuid::new_v4()));
                tokio::fs::write(&probe, b"probe").await.map_err(|e| {
                    RepositoryError::Unavailable(format!(
                        "repository directory {} is not writable: {}",
                        local.path, e
                    ))
                })?;
                let _ = tokio::fs::remove_file(&probe).await;
                Ok(())
            }
            (RepositoryKind::Nfs, BackendConfig::Nfs(_))
            | (RepositoryKind::Cifs, BackendConfig::Cifs(_)) => Ok(()),
            (RepositoryKind::Object, BackendConfig::Object(object)) => {
                if object.endpoint.is_empty() || object.bucket.is_empty() {
                    return Err(RepositoryError::Config(
                        "object-store config needs endpoint and bucket".into(),
                    ));
                }
                Ok(())
            }
            _ => Err(RepositoryError::Config(
                "configuration does not match repository kind".into(),
            )),
        }
    }

    fn parse_config(
        &self,
        kind: RepositoryKind,
        raw: &serde_json::Value,
    ) -> Result<BackendConfig, RepositoryError> {
        let parsed = match kind {
            RepositoryKind::Local => serde_json::from_value::<LocalConfig>(raw.clone())
                .map(BackendConfig::Local),
            RepositoryKind::Nfs => {
                serde_json::from_value::<NfsConfig>(raw.clone()).map(BackendConfig::Nfs)
            }
            RepositoryKind::Cifs => {
                serde_json::from_value::<CifsConfig>(raw.clone()).map(BackendConfig::Cifs)
            }
            RepositoryKind::Object => {
                serde_json::from_value::<ObjectConfig>(raw.clone()).map(BackendConfig::Object)
            }
        };
        parsed.map_err(|e| RepositoryError::Config(e.to_string()))
    }

    /// Mounts an NFS/CIFS backend under the process mount root on first
    /// use.
    async fn ensure_mounted(
        &self,
        repository: &Repository,
        kind: RepositoryKind,
        config: &BackendConfig,
    ) -> Result<PathBuf, RepositoryError> {
        let target = self.mount_root.join(&repository.id);

        if self.mounted.lock().contains(&repository.id) {
            return Ok(target);
        }

        tokio::fs::create_dir_all(&target).await?;

        let mut command = Command::new("mount");
        match (kind, config) {
            (RepositoryKind::Nfs, BackendConfig::Nfs(nfs)) => {
                command
                    .arg("-t")
                    .arg("nfs")
                    .arg(format!("{}:{}", nfs.server, nfs.export_path))
                    .arg(&target);
                if let Some(options) = &nfs.options {
                    command.arg("-o").arg(options);
                }
            }
            (RepositoryKind::Cifs, BackendConfig::Cifs(cifs)) => {
                let mut options = format!(
                    "username={},password={}",
                    cifs.username, cifs.password
                );
                if let Some(extra) = &cifs.options {
                    options.push(',');
                    options.push_str(extra);
                }
                command
                    .arg("-t")
                    .arg("cifs")
                    .arg(format!("//{}/{}", cifs.server, cifs.share))
                    .arg(&target)
                    .arg("-o")
                    .arg(options);
            }
            _ => {
                return Err(RepositoryError::Config(
                    "configuration does not match repository kind".into(),
                ))
            }
        }

        // Transient share outages get three attempts before the job sees
        // RepositoryUnavailable.
        let mut last_error = String::new();
        for attempt in 0..3u32 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100 << (2 * attempt))).await;
            }
            let output = command.output().await?;
            if output.status.success() {
                self.mounted.lock().insert(repository.id.clone());
                info!("mounted repository {} at {}", repository.id, target.display());
                return Ok(target);
            }
            last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                "mount of repository {} failed (attempt {}): {}",
                repository.id,
                attempt + 1,
                last_error
            );
        }

        Err(RepositoryError::Unavailable(format!(
            "mount of repository {} failed: {}",
            repository.id, last_error
        )))
    }

    async fn unmount_backend(&self, repository: &Repository) {
        if !self.mounted.lock().remove(&repository.id) {
            return;
        }
        let target = self.mount_root.join(&repository.id);
        match Command::new("umount").arg(&target).output().await {
            Ok(output) if output.status.success() => {
                info!("unmounted repository {}", repository.id);
            }
            Ok(output) => warn!(
                "umount of repository {} failed: {}",
                repository.id,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("umount of repository {} failed: {}", repository.id, e),
        }
    }
}

/// Reads total/used/available from the filesystem holding `path`.
fn filesystem_info(path: &Path) -> Result<StorageInfo, RepositoryError> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RepositoryError::Config("path contains NUL".into()))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(RepositoryError::Io(std::io::Error::last_os_error()));
    }

    let frsize = stats.f_frsize as u64;
    let total = stats.f_blocks as u64 * frsize;
    let available = stats.f_bavail as u64 * frsize;
    let used = total - stats.f_bfree as u64 * frsize;

    Ok(StorageInfo {
        total_bytes: total,
        used_bytes: used,
        available_bytes: available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_info_reports_sane_numbers() {
        let info = filesystem_info(Path::new("/")).unwrap();
        assert!(info.total_bytes > 0);
        assert!(info.used_bytes <= info.total_bytes);
        assert!(info.available_bytes <= info.total_bytes);
    }

    #[test]
    fn backend_config_parses_by_kind() {
        let raw = serde_json::json!({"path": "/srv/backups"});
        let parsed: LocalConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.path, "/srv/backups");

        let raw = serde_json::json!({
            "server": "filer01",
            "share": "backups",
            "username": "svc",
            "password": "secret"
        });
        let parsed: CifsConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.server, "filer01");
        assert!(parsed.options.is_none());
    }
}
