//! HTTP transport behind a trait, plus the executor every backend call goes
//! through.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uplink_signer::{AuthorizationGrant, Credential};

use crate::error::UploadError;

/// Cumulative bytes sent for the current request.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Body pieces handed to the HTTP stack; progress is reported per piece.
const STREAM_PIECE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Builds the request an authorization grant was issued for.
    ///
    /// Header credentials already carry every signed header; capability URIs
    /// need `extra_headers` attached separately.
    pub fn from_grant(grant: &AuthorizationGrant, extra_headers: &[(String, String)], body: Bytes) -> Self {
        let headers = match &grant.credential {
            Credential::Headers(h) => h.clone(),
            Credential::CapabilityUri(_) => extra_headers.to_vec(),
        };
        Self {
            method: grant.verb.clone(),
            url: grant.request_url(),
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Sends HTTP requests to the storage service.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, UploadError>> + Send + 'a>>;
}

/// [`Transport`] backed by a shared `reqwest` client.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn dispatch(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> Result<HttpResponse, UploadError> {
        let len = request.body.len();
        let mut builder = self.http.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder = match progress {
            Some(progress) if len > 0 => {
                let body = request.body;
                let pieces: Vec<Bytes> = (0..len)
                    .step_by(STREAM_PIECE)
                    .map(|start| body.slice(start..(start + STREAM_PIECE).min(len)))
                    .collect();
                let mut sent = 0u64;
                let stream = futures_util::stream::iter(pieces).map(move |piece| {
                    sent += piece.len() as u64;
                    progress(sent);
                    Ok::<Bytes, std::io::Error>(piece)
                });
                builder
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(stream))
            }
            _ => builder.body(request.body),
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = resp.bytes().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, UploadError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
                result = self.dispatch(request, progress) => result,
            }
        })
    }
}

/// Error body format used to extract backend error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDialect {
    S3,
    Azure,
}

impl ErrorDialect {
    /// Returns `(code, message)` from an error response body.
    pub fn parse(self, body: &[u8]) -> Option<(String, String)> {
        match self {
            Self::S3 => uplink_protocol::s3::parse_error(body).map(|e| (e.code, e.message)),
            Self::Azure => uplink_protocol::azure::parse_error(body).map(|e| (e.code, e.message)),
        }
    }
}

/// Per-call parameters for [`Executor::execute`].
pub struct Call<'a> {
    pub chunk: Option<u32>,
    pub expected: u16,
    pub cancel: &'a CancellationToken,
    pub progress: Option<ProgressFn>,
}

/// Runs backend requests: cancellation check, send, expected-status check.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    dialect: ErrorDialect,
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>, dialect: ErrorDialect) -> Self {
        Self { transport, dialect }
    }

    pub async fn execute(&self, call: Call<'_>, request: HttpRequest) -> Result<HttpResponse, UploadError> {
        if call.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        debug!(method = %request.method, url = %request.url, chunk = ?call.chunk, "sending request");

        let response = self
            .transport
            .send(request, call.progress, call.cancel)
            .await
            .map_err(|e| e.with_chunk(call.chunk))?;

        if response.status != call.expected {
            let (code, message) = match self.dialect.parse(&response.body) {
                Some((code, message)) => (Some(code), message),
                None => (None, String::from_utf8_lossy(&response.body).into_owned()),
            };
            return Err(UploadError::BackendRejection {
                chunk: call.chunk,
                status: response.status,
                code,
                message,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Canned transport: answers from a queue and records every request.
    #[derive(Default)]
    pub struct MockTransport {
        pub requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<Result<HttpResponse, UploadError>>>,
        fallback: Mutex<Option<HttpResponse>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, status: u16, headers: &[(&str, &str)], body: &str) {
            self.responses.lock().unwrap().push_back(Ok(response(status, headers, body)));
        }

        pub fn push_err(&self, err: UploadError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        /// Response used once the queue is empty.
        pub fn set_fallback(&self, status: u16, headers: &[(&str, &str)], body: &str) {
            *self.fallback.lock().unwrap() = Some(response(status, headers, body));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Bytes::from(body.to_string()),
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(
            &'a self,
            request: HttpRequest,
            progress: Option<ProgressFn>,
            _cancel: &'a CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, UploadError>> + Send + 'a>> {
            Box::pin(async move {
                if let Some(progress) = progress {
                    progress(request.body.len() as u64);
                }
                self.requests.lock().unwrap().push(request);
                let next = self.responses.lock().unwrap().pop_front();
                match next {
                    Some(r) => r,
                    None => self.fallback.lock().unwrap().clone().ok_or_else(|| UploadError::Transport {
                        chunk: None,
                        message: "no canned response".into(),
                    }),
                }
            })
        }
    }
}
