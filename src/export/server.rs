// export/server.rs
//
// The export server: include-directory configuration, atomic reload, and
// the embedded NBD listeners serving the registered exports.

use crate::config::ExportConfig;
use crate::export::error::ExportError;
use crate::export::include::{self, ExportEntry};
use crate::export::serve::{handle_connection, ExportTable};
use crate::repository::{CowImage, OpenMode};
use log::{error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Publishes files and block devices as named NBD exports.
///
/// The include directory is the source of truth: every mutation writes or
/// deletes one file there and then reloads, so external tooling (or an
/// operator with SIGHUP) always converges on the same state.
pub struct ExportServer {
    base_config: PathBuf,
    include_dir: PathBuf,
    socket_path: PathBuf,
    listen_addr: Option<String>,
    exports: ExportTable,
    /// Serialises create/remove + reload; disjoint names may prepare in
    /// parallel but reloads never interleave.
    mutation: Mutex<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ExportServer {
    pub fn new(config: &ExportConfig) -> Arc<Self> {
        Arc::new(Self {
            base_config: PathBuf::from(&config.base_config),
            include_dir: PathBuf::from(&config.include_dir),
            socket_path: PathBuf::from(&config.socket_path),
            listen_addr: config.listen_addr.clone(),
            exports: Arc::new(RwLock::new(HashMap::new())),
            mutation: Mutex::new(()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Prepares directories, writes the base config, performs the initial
    /// reload and starts the listeners and the SIGHUP handler.
    pub async fn start(self: &Arc<Self>) -> Result<(), ExportError> {
        tokio::fs::create_dir_all(&self.include_dir).await?;
        if let Some(parent) = self.base_config.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The base config names the include directory; one line per key,
        // nbd-server style.
        let base = format!(
            "[generic]\nincludedir = {}\nunixsock = {}\n",
            self.include_dir.display(),
            self.socket_path.display()
        );
        tokio::fs::write(&self.base_config, base).await?;

        self.reload().await?;

        // Unix listener; a stale socket from a previous run is replaced.
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        let unix_listener = UnixListener::bind(&self.socket_path)?;
        info!("export server listening on {}", self.socket_path.display());
        self.spawn_unix_accept(unix_listener);

        if let Some(addr) = &self.listen_addr {
            let tcp_listener = TcpListener::bind(addr).await?;
            info!("export server listening on {}", addr);
            self.spawn_tcp_accept(tcp_listener);
        }

        self.spawn_reload_on_hangup();
        Ok(())
    }

    /// Registers a file as a named export. Size comes from the image
    /// header when the backing is a repository image; raw backings need an
    /// explicit size. Returns once the reload has been observed.
    ///
    /// Re-adding an identical export is a no-op; a name or path clash
    /// fails with `AlreadyExists`.
    pub async fn create_file_export(
        &self,
        name: &str,
        path: &Path,
        read_write: bool,
        size_bytes: Option<u64>,
    ) -> Result<(), ExportError> {
        if name.len() > crate::export::name::MAX_EXPORT_NAME {
            return Err(ExportError::NameTooLong(
                name.to_string(),
                crate::export::name::MAX_EXPORT_NAME,
            ));
        }

        let _guard = self.mutation.lock().await;

        let size = match size_bytes {
            Some(size) => size,
            None => match CowImage::open(path, OpenMode::Read).await {
                Ok(image) => image.virtual_size(),
                Err(_) => return Err(ExportError::UnknownSize(path.display().to_string())),
            },
        };

        let entry = ExportEntry {
            name: name.to_string(),
            backing_path: path.to_path_buf(),
            read_only: !read_write,
            size_bytes: size,
        };

        {
            let exports = self.exports.read();
            if let Some(existing) = exports.get(name) {
                if *existing == entry {
                    return Ok(()); // idempotent re-add
                }
                return Err(ExportError::AlreadyExists(name.to_string()));
            }
            // One export per backing path at a time.
            if let Some(clash) = exports.values().find(|e| e.backing_path == entry.backing_path)
            {
                return Err(ExportError::AlreadyExists(clash.name.clone()));
            }
        }

        include::write_include_file(&self.include_dir, &entry).await?;
        self.reload_locked().await?;
        info!("export '{}' registered for {}", name, path.display());
        Ok(())
    }

    /// Removes an export. Removing an absent export is a no-op.
    pub async fn remove_export(&self, name: &str) -> Result<(), ExportError> {
        let _guard = self.mutation.lock().await;

        let path = include::include_file_path(&self.include_dir, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ExportError::Io(e)),
        }

        self.reload_locked().await?;
        info!("export '{}' removed", name);
        Ok(())
    }

    /// Lists the exports as described by the include directory.
    pub async fn list_exports(&self) -> Result<Vec<ExportEntry>, ExportError> {
        include::read_include_dir(&self.include_dir).await
    }

    /// Re-reads the include directory and atomically swaps the live table.
    /// Exports that remain unchanged keep serving without interruption.
    pub async fn reload(&self) -> Result<(), ExportError> {
        let _guard = self.mutation.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> Result<(), ExportError> {
        let entries = include::read_include_dir(&self.include_dir).await?;
        let table: HashMap<String, ExportEntry> = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();

        let count = table.len();
        *self.exports.write() = table;
        info!("export table reloaded: {} export(s)", count);
        Ok(())
    }

    /// The live export table, shared with connection handlers.
    pub fn export_table(&self) -> ExportTable {
        Arc::clone(&self.exports)
    }

    fn spawn_unix_accept(self: &Arc<Self>, listener: UnixListener) {
        let exports = self.export_table();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let exports = Arc::clone(&exports);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, exports).await {
                                warn!("nbd connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("unix accept failed: {}", e);
                        return;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_tcp_accept(self: &Arc<Self>, listener: TcpListener) {
        let exports = self.export_table();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let exports = Arc::clone(&exports);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, exports).await {
                                warn!("nbd connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("tcp accept failed: {}", e);
                        return;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Out-of-band reload: the host signals SIGHUP after mutating the
    /// include directory externally.
    fn spawn_reload_on_hangup(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut hangup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!("cannot install SIGHUP handler: {}", e);
                        return;
                    }
                };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading export table");
                if let Err(e) = server.reload().await {
                    error!("reload on SIGHUP failed: {}", e);
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stops the listeners. In-flight connections drain on their own.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ExportServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ExportConfig {
        ExportConfig {
            base_config: dir.path().join("server.conf").display().to_string(),
            include_dir: dir.path().join("conf.d").display().to_string(),
            socket_path: dir.path().join("nbd.sock").display().to_string(),
            listen_addr: None,
        }
    }

    async fn started_server(dir: &TempDir) -> Arc<ExportServer> {
        let server = ExportServer::new(&test_config(dir));
        server.start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn create_list_remove_cycle() {
        let dir = TempDir::new().unwrap();
        let server = started_server(&dir).await;

        let backing = dir.path().join("disk.img");
        tokio::fs::write(&backing, vec![0u8; 4096]).await.unwrap();

        server
            .create_file_export("backup-vm1-disk0-full-20260801T000000", &backing, true, Some(4096))
            .await
            .unwrap();

        let exports = server.list_exports().await.unwrap();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].size_bytes, 4096);
        assert!(!exports[0].read_only);

        server
            .remove_export("backup-vm1-disk0-full-20260801T000000")
            .await
            .unwrap();
        assert!(server.list_exports().await.unwrap().is_empty());

        // Removing again is a no-op.
        server
            .remove_export("backup-vm1-disk0-full-20260801T000000")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_name_with_different_backing_fails() {
        let dir = TempDir::new().unwrap();
        let server = started_server(&dir).await;

        let first = dir.path().join("a.img");
        let second = dir.path().join("b.img");
        tokio::fs::write(&first, vec![0u8; 512]).await.unwrap();
        tokio::fs::write(&second, vec![0u8; 512]).await.unwrap();

        server
            .create_file_export("clash", &first, false, Some(512))
            .await
            .unwrap();

        // Identical re-add: no-op.
        server
            .create_file_export("clash", &first, false, Some(512))
            .await
            .unwrap();

        // Same name, different backing: refused.
        let result = server
            .create_file_export("clash", &second, false, Some(512))
            .await;
        assert!(matches!(result, Err(ExportError::AlreadyExists(_))));

        // Same backing under a new name: refused too.
        let result = server
            .create_file_export("other", &first, false, Some(512))
            .await;
        assert!(matches!(result, Err(ExportError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn oversized_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let server = started_server(&dir).await;

        let backing = dir.path().join("a.img");
        tokio::fs::write(&backing, vec![0u8; 512]).await.unwrap();

        let name = "x".repeat(64);
        let result = server
            .create_file_export(&name, &backing, false, Some(512))
            .await;
        assert!(matches!(result, Err(ExportError::NameTooLong(_, 63))));
    }

    #[tokio::test]
    async fn reload_picks_up_external_include_files() {
        let dir = TempDir::new().unwrap();
        let server = started_server(&dir).await;

        // Simulate external tooling dropping an include file.
        let entry = ExportEntry {
            name: "external".to_string(),
            backing_path: dir.path().join("ext.img"),
            read_only: true,
            size_bytes: 2048,
        };
        include::write_include_file(&PathBuf::from(&test_config(&dir).include_dir), &entry)
            .await
            .unwrap();

        server.reload().await.unwrap();
        assert!(server.export_table().read().contains_key("external"));
    }
}
