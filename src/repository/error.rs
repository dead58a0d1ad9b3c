use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository '{0}' not found")]
    NotFound(String),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("Parent image not found: {0}")]
    ParentNotFound(String),

    #[error("Parent image unavailable: {0}")]
    ParentUnavailable(String),

    #[error("Insufficient space in repository: need {needed} bytes, have {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("Image '{0}' is in use")]
    InUse(String),

    #[error("Image '{0}' has dependent children")]
    HasChildren(String),

    #[error("Backup is within its retention window until {0}")]
    Immutable(String),

    #[error("Image file is corrupt: {0}")]
    Corrupt(String),

    #[error("Operation not supported for this repository kind: {0}")]
    Unsupported(String),

    #[error("Invalid repository configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}
