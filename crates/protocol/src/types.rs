use serde::{Deserialize, Serialize};

/// Lifecycle state of a single file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    KeyResolving,
    Initiating,
    Transferring,
    Finalizing,
    Complete,
    Canceled,
    Failed,
    ResetRequired,
}

impl UploadStatus {
    /// Returns `true` once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled | Self::Failed)
    }

    /// Returns `true` if a transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Canceled | Failed => true,
            ResetRequired => matches!(self, Transferring | Finalizing | Initiating),
            KeyResolving => matches!(self, Pending),
            Initiating => matches!(self, KeyResolving),
            Transferring => matches!(self, KeyResolving | Initiating),
            Finalizing => matches!(self, Transferring),
            Complete => matches!(self, Finalizing),
            Pending => matches!(self, ResetRequired),
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::KeyResolving => "key_resolving",
            Self::Initiating => "initiating",
            Self::Transferring => "transferring",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::ResetRequired => "reset_required",
        };
        f.write_str(s)
    }
}

/// Whether the storage service has confirmed a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Acked,
}

/// Proof that a chunk was sent, and once acked, stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub index: u32,
    /// Backend completion token (S3 ETag or Azure block id). Empty while pending.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub status: ReceiptStatus,
}

impl ChunkReceipt {
    pub fn pending(index: u32) -> Self {
        Self {
            index,
            token: String::new(),
            status: ReceiptStatus::Pending,
        }
    }

    pub fn is_acked(&self) -> bool {
        self.status == ReceiptStatus::Acked
    }
}

/// The subset of a session needed to resume after a restart.
///
/// The chunk plan is not stored: it is recomputed from `file_size` and
/// `chunk_size`, and a mismatch on either invalidates the saved state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub receipts: Vec<ChunkReceipt>,
    pub file_size: u64,
    pub chunk_size: u64,
    pub container: String,
}
