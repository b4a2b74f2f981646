//! Storage-service backends.

pub mod azure;
pub mod s3;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uplink_protocol::ChunkReceipt;
use uplink_signer::{AuthorizationGrant, AuthorizationRequest, Operation, RequestId, SignatureBroker};
use uplink_transfer::{ChunkDescriptor, UploadSession};

pub use azure::AzureBackend;
pub use s3::S3Backend;

use crate::error::UploadError;
use crate::transport::ProgressFn;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// What one backend call needs to know about the upload it belongs to.
#[derive(Clone)]
pub struct RequestContext {
    pub session: Arc<UploadSession>,
    pub key: String,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(session: Arc<UploadSession>, key: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session,
            key: key.into(),
            cancel,
        }
    }

    /// A fresh request id for `operation`; never reused across retries.
    pub fn request_id(&self, operation: Operation) -> RequestId {
        RequestId::new(
            self.session.id().as_str(),
            operation,
            self.session.next_request_seq(),
        )
    }
}

/// What the service reported about the object it assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEcho {
    Echoed { container: String, key: String },
    /// The service does not echo the object identity.
    Unavailable,
}

/// Which success-payload field names the object's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerField {
    Bucket,
    Container,
}

/// One storage service's multi-part protocol.
pub trait ChunkedUploadBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bucket or container objects land in.
    fn container(&self) -> &str;

    fn container_field(&self) -> ContainerField {
        ContainerField::Bucket
    }

    /// Whether chunks belong to a transaction opened by [`initiate`](Self::initiate).
    fn uses_transaction(&self) -> bool {
        true
    }

    /// Whether a 403 on a chunked call discards the transaction.
    fn forbidden_resets(&self) -> bool {
        true
    }

    /// Backend error codes that force a full reset.
    fn reset_codes(&self) -> &[&'static str] {
        &[]
    }

    /// Opens a multi-part transaction. `None` means the service has no
    /// transaction handle.
    fn initiate<'a>(&'a self, ctx: &'a RequestContext) -> BackendFuture<'a, Option<String>>;

    /// Sends one chunk and returns its completion token.
    fn upload_chunk<'a>(
        &'a self,
        ctx: &'a RequestContext,
        handle: Option<&'a str>,
        descriptor: ChunkDescriptor,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendFuture<'a, String>;

    /// Sends a file that was not split into chunks.
    fn upload_whole<'a>(
        &'a self,
        ctx: &'a RequestContext,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendFuture<'a, Option<String>>;

    /// Combines the acked chunks, given in ascending order.
    fn complete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        handle: Option<&'a str>,
        receipts: &'a [ChunkReceipt],
    ) -> BackendFuture<'a, CompletionEcho>;

    /// Discards a partially uploaded object.
    fn abort<'a>(&'a self, ctx: &'a RequestContext, handle: Option<&'a str>) -> BackendFuture<'a, ()>;
}

/// Authorizes `request` and checks the grant covers what was asked for.
pub(crate) async fn authorize(
    broker: &SignatureBroker,
    request: AuthorizationRequest,
) -> Result<AuthorizationGrant, UploadError> {
    let target = request.target.clone();
    let grant = broker.authorize(request).await?;
    if grant.target.path != target.path || grant.target.query != target.query {
        return Err(UploadError::ProtocolMismatch {
            expected: target.url(),
            actual: grant.target.url(),
        });
    }
    Ok(grant)
}

/// `Content-Type` for an upload, from config or the file extension.
pub(crate) fn content_type_for(file_name: &str, configured: Option<&str>) -> String {
    if let Some(ct) = configured {
        return ct.to_string();
    }
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
    .to_string()
}
