use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection to block endpoint failed: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote I/O error (errno {0})")]
    Remote(u32),

    #[error("Target does not support zero requests")]
    ZeroUnsupported,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Unsupported endpoint URL: {0}")]
    BadUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Transient errors are worth retrying; everything else fails the
    /// slice immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Remote(_) | TransportError::Connect(_)
        )
    }
}
