//! Azure SAS URIs from the local signature endpoint.

use std::future::Future;
use std::pin::Pin;

use reqwest::StatusCode;
use tracing::debug;

use crate::broker::SigningServer;
use crate::endpoint::SignatureEndpoint;
use crate::error::AuthorizationError;
use crate::request::{AuthorizationGrant, AuthorizationRequest, Credential};

/// Requests a capability URI per operation: `GET {url}?bloburi=..&_method=..`.
pub struct SasRequester {
    http: reqwest::Client,
    endpoint: SignatureEndpoint,
}

impl SasRequester {
    pub fn new(http: reqwest::Client, endpoint: SignatureEndpoint) -> Self {
        Self { http, endpoint }
    }

    async fn request_sas(&self, blob_uri: &str, verb: &str) -> Result<String, AuthorizationError> {
        let mut query: Vec<(&str, &str)> = self
            .endpoint
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.push(("bloburi", blob_uri));
        query.push(("_method", verb));

        let req = self.http.get(&self.endpoint.url).query(&query);
        let resp = self.endpoint.apply_headers(req).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status != StatusCode::OK {
            return Err(AuthorizationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let uri = body.trim();
        if uri.is_empty() {
            return Err(AuthorizationError::InvalidResponse("empty SAS response".into()));
        }
        Ok(uri.to_string())
    }
}

impl SigningServer for SasRequester {
    fn sign<'a>(
        &'a self,
        request: &'a AuthorizationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AuthorizationGrant, AuthorizationError>> + Send + 'a>>
    {
        Box::pin(async move {
            let blob_uri = request.target.resource_url();
            debug!(request = %request.id, verb = %request.verb, "requesting SAS");
            let uri = self.request_sas(&blob_uri, request.verb.as_str()).await?;
            Ok(AuthorizationGrant {
                id: request.id.clone(),
                verb: request.verb.clone(),
                target: request.target.clone(),
                content_sha256: request.content.sha256.clone(),
                credential: Credential::CapabilityUri(uri),
            })
        })
    }
}
