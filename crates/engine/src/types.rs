//! Engine events and results.

use uplink_protocol::UploadStatus;
use uplink_transfer::SessionId;

/// Event emitted while uploads run.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StatusChanged {
        session: SessionId,
        status: UploadStatus,
    },
    /// Bytes of one chunk on the wire, with the session total.
    ChunkProgress {
        session: SessionId,
        chunk: u32,
        sent: u64,
        transferred: u64,
        total: u64,
    },
    ChunkAcked {
        session: SessionId,
        chunk: u32,
        acked: usize,
        total: usize,
    },
    /// The transaction was discarded; the upload restarts from the first chunk.
    Reset { session: SessionId, reason: String },
    Completed {
        session: SessionId,
        key: String,
        container: String,
    },
    Failed { session: SessionId, error: String },
    Canceled { session: SessionId },
}

impl UploadEvent {
    pub fn session(&self) -> &SessionId {
        match self {
            Self::StatusChanged { session, .. }
            | Self::ChunkProgress { session, .. }
            | Self::ChunkAcked { session, .. }
            | Self::Reset { session, .. }
            | Self::Completed { session, .. }
            | Self::Failed { session, .. }
            | Self::Canceled { session } => session,
        }
    }
}

/// A finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub session: SessionId,
    pub key: String,
    pub container: String,
    pub parts: usize,
    pub bytes: u64,
    /// Full resets the upload went through.
    pub resets: u32,
}
