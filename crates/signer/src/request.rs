use std::fmt;

use reqwest::Method;

use crate::canonical::{encode_path, encode_query};

/// Logical operation a request performs within an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Initiate,
    Chunk(u32),
    Whole,
    Complete,
    Abort,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiate => f.write_str("initiate"),
            Self::Chunk(index) => write!(f, "{index}"),
            Self::Whole => f.write_str("whole"),
            Self::Complete => f.write_str("complete"),
            Self::Abort => f.write_str("abort"),
        }
    }
}

/// Correlation id for one outbound call.
///
/// Two chunks of the same file, or two tries of the same chunk, never
/// share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId {
    session: String,
    operation: Operation,
    attempt: u32,
}

impl RequestId {
    pub fn new(session: impl Into<String>, operation: Operation, attempt: u32) -> Self {
        Self {
            session: session.into(),
            operation,
            attempt,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.session, self.operation, self.attempt)
    }
}

/// Resource a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalTarget {
    /// Scheme and authority, e.g. `https://bucket.s3.amazonaws.com`.
    pub endpoint: String,
    /// Unencoded object path, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl CanonicalTarget {
    pub fn new(endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Host portion of the endpoint, as sent in the `Host` header.
    pub fn host(&self) -> &str {
        let rest = self
            .endpoint
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(&self.endpoint);
        rest.split('/').next().unwrap_or(rest)
    }

    /// URL of the resource without a query string.
    pub fn resource_url(&self) -> String {
        format!(
            "{}{}",
            self.endpoint.trim_end_matches('/'),
            encode_path(&self.path)
        )
    }

    /// Full request URL, encoded exactly as it was signed.
    pub fn url(&self) -> String {
        let query = encode_query(&self.query);
        if query.is_empty() {
            self.resource_url()
        } else {
            format!("{}?{query}", self.resource_url())
        }
    }
}

/// What the request body carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentDescriptor {
    pub length: u64,
    /// Hex SHA-256 of the body.
    pub sha256: String,
    pub content_type: Option<String>,
}

/// A request the broker is asked to authorize.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub id: RequestId,
    pub verb: Method,
    pub target: CanonicalTarget,
    pub content: ContentDescriptor,
    /// Headers that will be sent and must be covered by the signature.
    pub headers: Vec<(String, String)>,
}

/// How the storage service will recognise the request as authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Headers to attach (Authorization, x-amz-date, ...).
    Headers(Vec<(String, String)>),
    /// Pre-authorized URI for exactly this operation.
    CapabilityUri(String),
}

/// A single-use authorization bound to the exact request shape.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub id: RequestId,
    pub verb: Method,
    pub target: CanonicalTarget,
    pub content_sha256: String,
    pub credential: Credential,
}

impl AuthorizationGrant {
    /// URL the authorized request must be sent to.
    pub fn request_url(&self) -> String {
        match &self.credential {
            Credential::Headers(_) => self.target.url(),
            Credential::CapabilityUri(uri) => {
                let query = encode_query(&self.target.query);
                if query.is_empty() {
                    uri.clone()
                } else if uri.contains('?') {
                    format!("{uri}&{query}")
                } else {
                    format!("{uri}?{query}")
                }
            }
        }
    }
}
