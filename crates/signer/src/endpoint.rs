use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Location of the trusted local signing server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignatureEndpoint {
    pub url: String,
    /// Extra headers sent with every signature request.
    pub custom_headers: BTreeMap<String, String>,
    /// Extra query parameters sent with every signature request.
    pub params: BTreeMap<String, String>,
}

impl SignatureEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub(crate) fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.custom_headers {
            req = req.header(name, value);
        }
        req
    }
}
