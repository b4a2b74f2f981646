//! Chunk planning, per-file session state and resume persistence.
//!
//! Nothing in this crate talks to the network. The engine drives an
//! [`UploadSession`] through its lifecycle; this crate keeps the session's
//! receipts, remote handle and key consistent while it does.

mod chunked;
mod persist;
mod plan;
mod progress;
mod types;
mod validation;

pub use chunked::{checksum_bytes, md5_base64, read_range};
pub use persist::{JsonFileStore, MemoryStore, PersistenceAdapter};
pub use plan::{ChunkDescriptor, ChunkPlan, ChunkingConfig, MAX_CHUNKS, PlanMode};
pub use progress::{ProgressTracker, SessionProgress, SpeedCalculator};
pub use types::{SessionId, UploadSession};
pub use validation::validate_object_key;

use uplink_protocol::UploadStatus;

/// Default chunk size: 5 MiB, the smallest part S3 accepts.
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("chunk {index} is outside the plan ({chunks} chunks)")]
    ChunkOutOfRange { index: u32, chunks: usize },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("invalid object key: {0}")]
    InvalidKey(String),
}
