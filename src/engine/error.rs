use crate::platforms::PlatformError;
use crate::repository::RepositoryError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Backup '{0}' not found")]
    NotFound(String),

    #[error("Parent backup missing: {0}")]
    ParentMissing(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Export error: {0}")]
    Export(#[from] crate::export::ExportError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

impl EngineError {
    /// The terminal backup status this error drives the job into.
    pub fn terminal_status(&self) -> &'static str {
        match self {
            EngineError::Cancelled => "cancelled",
            _ => "failed",
        }
    }
}
