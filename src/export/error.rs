use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export '{0}' already exists")]
    AlreadyExists(String),

    #[error("Export name '{0}' exceeds {1} bytes")]
    NameTooLong(String, usize),

    #[error("Export '{0}' not found")]
    NotFound(String),

    #[error("Bad include file: {0}")]
    IncludeFormat(String),

    #[error("Cannot determine export size for {0}")]
    UnknownSize(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Image error: {0}")]
    Image(#[from] crate::repository::RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
