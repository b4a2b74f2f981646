//! AWS SigV4 signing through the local signature endpoint.
//!
//! The client builds the string-to-sign; the local server, which holds
//! the secret key, returns only the hex signature.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::SigningServer;
use crate::canonical::{self, ALGORITHM};
use crate::endpoint::SignatureEndpoint;
use crate::error::AuthorizationError;
use crate::request::{AuthorizationGrant, AuthorizationRequest, Credential};

#[derive(Serialize)]
struct SignatureRequestBody<'a> {
    headers: &'a str,
}

#[derive(Deserialize)]
struct SignatureResponseBody {
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    invalid: bool,
}

/// Signing material assembled before the signature server is asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSignature {
    pub amz_date: String,
    pub scope: String,
    pub signed_headers: String,
    pub string_to_sign: String,
    /// Headers to send alongside `Authorization`.
    pub headers: Vec<(String, String)>,
}

/// Signs S3 requests with SigV4 via the local signature endpoint.
pub struct V4Signer {
    http: reqwest::Client,
    endpoint: SignatureEndpoint,
    access_key: String,
    region: String,
    clock_drift: Duration,
}

impl V4Signer {
    pub fn new(
        http: reqwest::Client,
        endpoint: SignatureEndpoint,
        access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            access_key: access_key.into(),
            region: region.into(),
            clock_drift: Duration::zero(),
        }
    }

    /// Offset applied to the local clock when dating requests.
    pub fn with_clock_drift(mut self, drift: Duration) -> Self {
        self.clock_drift = drift;
        self
    }

    /// Builds the string-to-sign for `request` at time `now`.
    pub fn prepare(&self, request: &AuthorizationRequest, now: DateTime<Utc>) -> PreparedSignature {
        let now = now + self.clock_drift;
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = canonical::credential_scope(&now.format("%Y%m%d").to_string(), &self.region);

        let mut headers = vec![
            ("x-amz-content-sha256".to_string(), request.content.sha256.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ct) = &request.content.content_type {
            headers.push(("Content-Type".to_string(), ct.clone()));
        }
        headers.extend(request.headers.iter().cloned());

        let mut signed = headers.clone();
        signed.push(("host".to_string(), request.target.host().to_string()));

        let canonical_request = canonical::canonical_request(
            request.verb.as_str(),
            &request.target.path,
            &request.target.query,
            &signed,
            &request.content.sha256,
        );
        let (_, signed_headers) = canonical::canonical_headers(&signed);
        let string_to_sign = canonical::string_to_sign(&amz_date, &scope, &canonical_request);

        PreparedSignature {
            amz_date,
            scope,
            signed_headers,
            string_to_sign,
            headers,
        }
    }

    /// Combines prepared material with the server's signature.
    pub fn finish(&self, prepared: PreparedSignature, signature: &str) -> Credential {
        let authorization = format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={signature}",
            self.access_key, prepared.scope, prepared.signed_headers
        );
        let mut headers = prepared.headers;
        headers.push(("Authorization".to_string(), authorization));
        Credential::Headers(headers)
    }

    async fn request_signature(&self, string_to_sign: &str) -> Result<String, AuthorizationError> {
        let mut query: Vec<(&str, &str)> = vec![("v4", "true")];
        query.extend(self.endpoint.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let req = self
            .http
            .post(&self.endpoint.url)
            .query(&query)
            .json(&SignatureRequestBody {
                headers: string_to_sign,
            });
        let resp = self.endpoint.apply_headers(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthorizationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: SignatureResponseBody = resp
            .json()
            .await
            .map_err(|e| AuthorizationError::InvalidResponse(e.to_string()))?;
        if body.invalid {
            return Err(AuthorizationError::InvalidResponse(
                "signature server marked request invalid".into(),
            ));
        }
        match body.signature {
            Some(sig) if !sig.is_empty() => Ok(sig),
            _ => Err(AuthorizationError::InvalidResponse("missing signature".into())),
        }
    }
}

impl SigningServer for V4Signer {
    fn sign<'a>(
        &'a self,
        request: &'a AuthorizationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AuthorizationGrant, AuthorizationError>> + Send + 'a>>
    {
        Box::pin(async move {
            let prepared = self.prepare(request, Utc::now());
            debug!(request = %request.id, verb = %request.verb, "requesting v4 signature");
            let signature = self.request_signature(&prepared.string_to_sign).await?;
            Ok(AuthorizationGrant {
                id: request.id.clone(),
                verb: request.verb.clone(),
                target: request.target.clone(),
                content_sha256: request.content.sha256.clone(),
                credential: self.finish(prepared, &signature),
            })
        })
    }
}
