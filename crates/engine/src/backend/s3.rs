//! S3 multipart upload.
//!
//! Chunked files go through initiate / upload part / complete; small files
//! are sent with a single signed PUT. Every request is signed through the
//! local signature endpoint.

use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Method;
use tracing::{debug, info};
use uplink_protocol::ChunkReceipt;
use uplink_protocol::s3::{self, CompletedPart};
use uplink_signer::{
    AuthorizationRequest, CanonicalTarget, ContentDescriptor, Operation, SignatureBroker,
};
use uplink_transfer::{ChunkDescriptor, checksum_bytes, md5_base64};

use super::{
    BackendFuture, ChunkedUploadBackend, CompletionEcho, RequestContext, authorize, content_type_for,
};
use crate::config::{S3Config, S3Statuses};
use crate::error::UploadError;
use crate::transport::{Call, ErrorDialect, Executor, HttpRequest, HttpResponse, ProgressFn, Transport};

/// Characters `encodeURIComponent` leaves alone.
const METADATA_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub struct S3Backend {
    config: S3Config,
    statuses: S3Statuses,
    broker: Arc<SignatureBroker>,
    executor: Executor,
}

/// One signed S3 call.
struct Signed<'a> {
    operation: Operation,
    verb: Method,
    target: CanonicalTarget,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Bytes,
    expected: u16,
    progress: Option<ProgressFn>,
    chunk: Option<u32>,
    ctx: &'a RequestContext,
}

impl S3Backend {
    pub fn new(
        config: S3Config,
        statuses: S3Statuses,
        broker: Arc<SignatureBroker>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            statuses,
            broker,
            executor: Executor::new(transport, ErrorDialect::S3),
        }
    }

    fn target(&self, key: &str) -> CanonicalTarget {
        CanonicalTarget::new(&self.config.endpoint, format!("/{key}"))
    }

    /// Headers describing the stored object: ACL, storage options, metadata.
    fn object_headers(&self, file_name: &str) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(acl) = &self.config.acl {
            headers.push(("x-amz-acl".to_string(), acl.clone()));
        }
        if self.config.reduced_redundancy {
            headers.push(("x-amz-storage-class".to_string(), "REDUCED_REDUNDANCY".to_string()));
        }
        if self.config.server_side_encryption {
            headers.push(("x-amz-server-side-encryption".to_string(), "AES256".to_string()));
        }
        headers.push((
            format!("x-amz-meta-{}", self.config.filename_param),
            utf8_percent_encode(file_name, METADATA_SET).to_string(),
        ));
        for (name, value) in &self.config.params {
            headers.push((
                format!("x-amz-meta-{}", name.to_ascii_lowercase()),
                utf8_percent_encode(value, METADATA_SET).to_string(),
            ));
        }
        headers
    }

    async fn send(&self, call: Signed<'_>) -> Result<HttpResponse, UploadError> {
        let request = AuthorizationRequest {
            id: call.ctx.request_id(call.operation),
            verb: call.verb,
            target: call.target,
            content: ContentDescriptor {
                length: call.body.len() as u64,
                sha256: checksum_bytes(&call.body),
                content_type: call.content_type,
            },
            headers: call.headers,
        };
        let grant = authorize(&self.broker, request).await?;
        let http = HttpRequest::from_grant(&grant, &[], call.body);
        self.executor
            .execute(
                Call {
                    chunk: call.chunk,
                    expected: call.expected,
                    cancel: &call.ctx.cancel,
                    progress: call.progress,
                },
                http,
            )
            .await
    }

    fn content_type(&self, ctx: &RequestContext) -> String {
        content_type_for(ctx.session.file_name(), self.config.content_type.as_deref())
    }
}

/// `Content-MD5` for a part or object body; S3 rejects the PUT if the
/// stored bytes hash differently.
fn content_md5(body: &Bytes) -> (String, String) {
    ("Content-MD5".to_string(), md5_base64(body))
}

fn require_handle(handle: Option<&str>) -> Result<&str, UploadError> {
    handle.ok_or_else(|| UploadError::Precondition("multipart upload has not been initiated".into()))
}

fn etag(response: &HttpResponse) -> Option<String> {
    response.header("etag").map(str::to_string)
}

impl ChunkedUploadBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn container(&self) -> &str {
        &self.config.bucket
    }

    fn reset_codes(&self) -> &[&'static str] {
        s3::RESET_CODES
    }

    fn initiate<'a>(&'a self, ctx: &'a RequestContext) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let resp = self
                .send(Signed {
                    operation: Operation::Initiate,
                    verb: Method::POST,
                    target: self.target(&ctx.key).with_query("uploads", ""),
                    headers: self.object_headers(ctx.session.file_name()),
                    content_type: Some(self.content_type(ctx)),
                    body: Bytes::new(),
                    expected: self.statuses.initiate,
                    progress: None,
                    chunk: None,
                    ctx,
                })
                .await?;
            let upload_id = s3::parse_initiate_result(&resp.body)?;
            info!(session = %ctx.session.id(), key = %ctx.key, upload_id = %upload_id, "multipart upload initiated");
            Ok(Some(upload_id))
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        ctx: &'a RequestContext,
        handle: Option<&'a str>,
        descriptor: ChunkDescriptor,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let upload_id = require_handle(handle)?;
            let target = self
                .target(&ctx.key)
                .with_query("partNumber", s3::part_number(descriptor.index).to_string())
                .with_query("uploadId", upload_id);
            let resp = self
                .send(Signed {
                    operation: Operation::Chunk(descriptor.index),
                    verb: Method::PUT,
                    target,
                    headers: vec![content_md5(&body)],
                    content_type: None,
                    body,
                    expected: self.statuses.part,
                    progress,
                    chunk: Some(descriptor.index),
                    ctx,
                })
                .await?;
            let etag = etag(&resp).ok_or(uplink_protocol::ProtocolError::MissingElement("ETag"))?;
            debug!(session = %ctx.session.id(), chunk = descriptor.index, etag = %etag, "part stored");
            Ok(etag)
        })
    }

    fn upload_whole<'a>(
        &'a self,
        ctx: &'a RequestContext,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut headers = self.object_headers(ctx.session.file_name());
            headers.push(content_md5(&body));
            let resp = self
                .send(Signed {
                    operation: Operation::Whole,
                    verb: Method::PUT,
                    target: self.target(&ctx.key),
                    headers,
                    content_type: Some(self.content_type(ctx)),
                    body,
                    expected: self.statuses.whole,
                    progress,
                    chunk: Some(0),
                    ctx,
                })
                .await?;
            Ok(etag(&resp))
        })
    }

    fn complete<'a>(
        &'a self,
        ctx: &'a RequestContext,
        handle: Option<&'a str>,
        receipts: &'a [ChunkReceipt],
    ) -> BackendFuture<'a, CompletionEcho> {
        Box::pin(async move {
            let upload_id = require_handle(handle)?;
            let parts: Vec<CompletedPart> = receipts
                .iter()
                .map(|r| CompletedPart {
                    part_number: s3::part_number(r.index),
                    etag: r.token.clone(),
                })
                .collect();
            let body = s3::build_complete_body(&parts)?;

            let resp = self
                .send(Signed {
                    operation: Operation::Complete,
                    verb: Method::POST,
                    target: self.target(&ctx.key).with_query("uploadId", upload_id),
                    headers: Vec::new(),
                    content_type: Some(s3::COMPLETE_CONTENT_TYPE.to_string()),
                    body: Bytes::from(body),
                    expected: self.statuses.complete,
                    progress: None,
                    chunk: None,
                    ctx,
                })
                .await?;

            // A 200 can still carry an error document.
            if let Some(err) = s3::parse_error(&resp.body) {
                return Err(UploadError::BackendRejection {
                    chunk: None,
                    status: resp.status,
                    code: Some(err.code),
                    message: err.message,
                });
            }
            let result = s3::parse_complete_result(&resp.body)?;
            Ok(CompletionEcho::Echoed {
                container: result.bucket,
                key: result.key,
            })
        })
    }

    fn abort<'a>(&'a self, ctx: &'a RequestContext, handle: Option<&'a str>) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let Some(upload_id) = handle else {
                debug!(session = %ctx.session.id(), "no multipart upload to abort");
                return Ok(());
            };
            self.send(Signed {
                operation: Operation::Abort,
                verb: Method::DELETE,
                target: self.target(&ctx.key).with_query("uploadId", upload_id),
                headers: Vec::new(),
                content_type: None,
                body: Bytes::new(),
                expected: self.statuses.abort,
                progress: None,
                chunk: None,
                ctx,
            })
            .await?;
            info!(session = %ctx.session.id(), upload_id = %upload_id, "multipart upload aborted");
            Ok(())
        })
    }
}
