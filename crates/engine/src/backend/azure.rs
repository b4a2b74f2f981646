//! Azure block blob upload.
//!
//! Each block and the final block list are sent to a SAS URI requested
//! for that one operation. There is no transaction handle: uncommitted
//! blocks live on the blob until the list is committed or the blob is
//! deleted.

use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::Method;
use tracing::{debug, info};
use uplink_protocol::ChunkReceipt;
use uplink_protocol::azure::{self, BlockEntry};
use uplink_signer::{
    AuthorizationGrant, AuthorizationRequest, CanonicalTarget, ContentDescriptor, Operation,
    SignatureBroker,
};
use uplink_transfer::ChunkDescriptor;

use super::{
    BackendFuture, ChunkedUploadBackend, CompletionEcho, ContainerField, RequestContext, authorize,
    content_type_for,
};
use crate::config::{AzureConfig, AzureStatuses};
use crate::error::UploadError;
use crate::transport::{Call, ErrorDialect, Executor, HttpRequest, HttpResponse, ProgressFn, Transport};

pub struct AzureBackend {
    config: AzureConfig,
    statuses: AzureStatuses,
    broker: Arc<SignatureBroker>,
    executor: Executor,
}

impl AzureBackend {
    pub fn new(
        config: AzureConfig,
        statuses: AzureStatuses,
        broker: Arc<SignatureBroker>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            statuses,
            broker,
            executor: Executor::new(transport, ErrorDialect::Azure),
        }
    }

    fn target(&self, key: &str) -> CanonicalTarget {
        CanonicalTarget::new(&self.config.endpoint, format!("/{}/{key}", self.config.container))
    }

    fn metadata_headers(&self) -> Vec<(String, String)> {
        self.config
            .metadata
            .iter()
            .map(|(k, v)| (format!("{}{}", azure::META_PREFIX, k.to_ascii_lowercase()), v.clone()))
            .collect()
    }

    async fn grant(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        verb: Method,
        target: CanonicalTarget,
    ) -> Result<AuthorizationGrant, UploadError> {
        let request = AuthorizationRequest {
            id: ctx.request_id(operation),
            verb,
            target,
            content: ContentDescriptor::default(),
            headers: Vec::new(),
        };
        authorize(&self.broker, request).await
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        request: HttpRequest,
        expected: u16,
        chunk: Option<u32>,
        progress: Option<ProgressFn>,
    ) -> Result<HttpResponse, UploadError> {
        self.executor
            .execute(
                Call {
                    chunk,
                    expected,
                    cancel: &ctx.cancel,
                    progress,
                },
                request,
            )
            .await
    }
}

/// Container and blob name a SAS URI points at.
fn echo_from_uri(uri: &str) -> Result<CompletionEcho, UploadError> {
    let mismatch = || UploadError::ProtocolMismatch {
        expected: "blob URI".into(),
        actual: uri.to_string(),
    };
    let url = reqwest::Url::parse(uri).map_err(|_| mismatch())?;
    let path = url.path().trim_start_matches('/');
    let (container, key) = path.split_once('/').ok_or_else(mismatch)?;
    Ok(CompletionEcho::Echoed {
        container: percent_decode_str(container).decode_utf8_lossy().into_owned(),
        key: percent_decode_str(key).decode_utf8_lossy().into_owned(),
    })
}

impl ChunkedUploadBackend for AzureBackend {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn container(&self) -> &str {
        &self.config.container
    }

    fn container_field(&self) -> ContainerField {
        ContainerField::Container
    }

    fn uses_transaction(&self) -> bool {
        false
    }

    fn initiate<'a>(&'a self, _ctx: &'a RequestContext) -> BackendFuture<'a, Option<String>> {
        Box::pin(async { Ok(None) })
    }

    fn upload_chunk<'a>(
        &'a self,
        ctx: &'a RequestContext,
        _handle: Option<&'a str>,
        descriptor: ChunkDescriptor,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let block_id = azure::block_id(descriptor.index);
            let target = self
                .target(&ctx.key)
                .with_query("comp", "block")
                .with_query("blockid", block_id.as_str());
            let grant = self
                .grant(ctx, Operation::Chunk(descriptor.index), Method::PUT, target)
                .await?;
            let request = HttpRequest::from_grant(&grant, &[], body);
            self.execute(ctx, request, self.statuses.put_block, Some(descriptor.index), progress)
                .await?;
            debug!(session = %ctx.session.id(), chunk = descriptor.index, block = %block_id, "block stored");
            Ok(block_id)
        })
    }

    fn upload_whole<'a>(
        &'a self,
        ctx: &'a RequestContext,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let grant = self
                .grant(ctx, Operation::Whole, Method::PUT, self.target(&ctx.key))
                .await?;
            let mut headers = vec![
                (azure::BLOB_TYPE_HEADER.to_string(), azure::BLOCK_BLOB.to_string()),
                (
                    "Content-Type".to_string(),
                    content_type_for(ctx.session.file_name(), self.config.content_type.as_deref()),
                ),
            ];
            headers.extend(self.metadata_headers());
            let request = HttpRequest::from_grant(&grant, &headers, body);
            let resp = self
                .execute(ctx, request, self.statuses.put_blob, Some(0), progress)
                .await?;
            Ok(resp.header("etag").map(str::to_string))
        })
    }

    fn complete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        _handle: Option<&'a str>,
        receipts: &'a [ChunkReceipt],
    ) -> BackendFuture<'a, CompletionEcho> {
        Box::pin(async move {
            let entries: Vec<BlockEntry> = receipts
                .iter()
                .map(|r| BlockEntry {
                    index: r.index,
                    block_id: r.token.clone(),
                })
                .collect();
            let body = azure::build_block_list(&entries)?;

            let target = self.target(&ctx.key).with_query("comp", "blocklist");
            let grant = self
                .grant(ctx, Operation::Complete, Method::PUT, target)
                .await?;
            let mut headers = vec![(
                "x-ms-blob-content-type".to_string(),
                content_type_for(ctx.session.file_name(), self.config.content_type.as_deref()),
            )];
            headers.extend(self.metadata_headers());

            let request = HttpRequest::from_grant(&grant, &headers, Bytes::from(body));
            let echo = echo_from_uri(&request.url)?;
            self.execute(ctx, request, self.statuses.put_block_list, None, None)
                .await?;
            info!(session = %ctx.session.id(), key = %ctx.key, blocks = receipts.len(), "block list committed");
            Ok(echo)
        })
    }

    fn abort<'a>(&'a self, ctx: &'a RequestContext, _handle: Option<&'a str>) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let grant = self
                .grant(ctx, Operation::Abort, Method::DELETE, self.target(&ctx.key))
                .await?;
            let request = HttpRequest::from_grant(&grant, &[], Bytes::new());
            match self.execute(ctx, request, self.statuses.delete, None, None).await {
                Ok(_) => {
                    info!(session = %ctx.session.id(), key = %ctx.key, "blob deleted");
                    Ok(())
                }
                // Uncommitted blocks are not visible as a blob.
                Err(UploadError::BackendRejection { status: 404, .. }) => {
                    debug!(session = %ctx.session.id(), "no blob to delete");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }
}
