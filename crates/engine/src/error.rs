//! Upload error taxonomy.

use uplink_protocol::ProtocolError;
use uplink_signer::AuthorizationError;
use uplink_transfer::{SessionId, TransferError};

/// Errors produced while uploading a file.
///
/// Variants carry the chunk index, raw status and backend code where they
/// apply so the coordinator can classify them without string matching.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transport error: {message}")]
    Transport { chunk: Option<u32>, message: String },

    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("storage service rejected request ({status}{}): {message}", code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    BackendRejection {
        chunk: Option<u32>,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("response does not match request: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,

    #[error("key resolution failed: {0}")]
    KeyResolution(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("server requested a full reset: {0}")]
    ResetRequested(String),

    #[error("success notification failed: {0}")]
    Notification(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Chunk the error is attributed to, if any.
    pub fn chunk(&self) -> Option<u32> {
        match self {
            Self::Transport { chunk, .. } | Self::BackendRejection { chunk, .. } => *chunk,
            _ => None,
        }
    }

    /// Attributes a transport or backend error to `chunk`.
    pub fn with_chunk(self, index: Option<u32>) -> Self {
        match self {
            Self::Transport { message, .. } => Self::Transport {
                chunk: index,
                message,
            },
            Self::BackendRejection {
                status,
                code,
                message,
                ..
            } => Self::BackendRejection {
                chunk: index,
                status,
                code,
                message,
            },
            other => other,
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            chunk: None,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_includes_code() {
        let err = UploadError::BackendRejection {
            chunk: Some(1),
            status: 400,
            code: Some("InvalidPartOrder".into()),
            message: "bad order".into(),
        };
        assert_eq!(
            err.to_string(),
            "storage service rejected request (400 InvalidPartOrder): bad order"
        );
        assert_eq!(err.chunk(), Some(1));
    }

    #[test]
    fn with_chunk_attributes_transport_errors() {
        let err = UploadError::Transport {
            chunk: None,
            message: "reset by peer".into(),
        }
        .with_chunk(Some(4));
        assert_eq!(err.chunk(), Some(4));
        assert!(UploadError::Cancelled.with_chunk(Some(1)).is_cancelled());
    }
}
