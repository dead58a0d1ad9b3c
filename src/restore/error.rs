use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Backup '{0}' not found or not restorable")]
    BackupNotFound(String),

    #[error("Mount '{0}' not found")]
    MountNotFound(String),

    #[error("Filesystem on the backup is not supported")]
    UnsupportedFilesystem,

    #[error("Path escapes the mount: {0}")]
    InvalidPath(String),

    #[error("No free loopback device")]
    NoFreeDevice,

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Export error: {0}")]
    Export(#[from] crate::export::ExportError),

    #[error("Repository error: {0}")]
    Repository(#[from] crate::repository::RepositoryError),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
