//! Resumable chunked upload orchestration.
//!
//! Splits a file into chunks, gets each request signed by the caller's
//! signature service, and sends the chunks to S3 or Azure Blob Storage with
//! bounded concurrency. Failures are retried, escalated to a full reset of
//! the remote transaction, or reported, depending on what the service said.
//!
//! # Pipeline
//!
//! 1. **Key**: resolve the object key once per session
//! 2. **Initiate**: open the multi-part transaction (S3 only)
//! 3. **Transfer**: send chunks, at most `max_in_flight` at a time
//! 4. **Finalize**: combine the acked chunks in ascending order
//! 5. **Notify**: tell the success endpoint, if configured

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod key;
pub mod notify;
pub mod store;
pub mod transport;
pub mod types;

// Re-export primary types for convenience.
pub use backend::{
    AzureBackend, ChunkedUploadBackend, CompletionEcho, ContainerField, RequestContext, S3Backend,
};
pub use config::{AzureConfig, BackendConfig, EngineConfig, RetryConfig, S3Config};
pub use coordinator::{Action, Coordinator, ExponentialBackoff, RetryPolicy};
pub use engine::{EngineBuilder, UploadEngine};
pub use error::UploadError;
pub use key::{FnKeyResolver, KeyResolver, UuidKeyResolver};
pub use notify::{SuccessNotifier, SuccessPayload};
pub use transport::{ReqwestTransport, Transport};
pub use types::{UploadEvent, UploadOutcome};
