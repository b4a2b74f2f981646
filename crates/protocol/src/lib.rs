//! Wire formats shared by the uplink crates.
//!
//! Storage-service request and response bodies (S3 multipart XML, Azure
//! block list XML, structured error bodies) plus the serde types that
//! describe an upload's lifecycle and its persisted resume state.

pub mod azure;
pub mod error;
pub mod s3;
pub mod types;
mod xml;

pub use error::ProtocolError;
pub use types::{ChunkReceipt, PersistedState, ReceiptStatus, UploadStatus};
