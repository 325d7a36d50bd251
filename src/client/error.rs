use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by a [`Connection`](super::connection::Connection) and the calls it carries.
///
/// A single terminal error is handed to every outstanding call when a connection dies,
/// so the type is `Clone`; non-clone sources are kept behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection is shut down")]
    Shutdown,

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("malformed message: {0}")]
    Codec(Arc<serde_json::Error>),

    #[error("incomplete message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("peer rejected {method}: {error}")]
    Rejected { method: String, error: serde_json::Value },
}

impl ClientError {
    /// True for errors that mean the connection can no longer carry traffic.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ClientError::Shutdown | ClientError::UnexpectedEof)
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ClientError::UnexpectedEof,
            _ => ClientError::Io(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            return ClientError::from(io::Error::from(err));
        }
        ClientError::Codec(Arc::new(err))
    }
}
