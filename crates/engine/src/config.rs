//! Engine configuration.
//!
//! Read from a JSON file, by default `$XDG_CONFIG_HOME/uplink/config.json`.
//! Every field has a default so partial files are accepted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uplink_signer::SignatureEndpoint;
use uplink_transfer::ChunkingConfig;

use crate::coordinator::ExponentialBackoff;
use crate::error::UploadError;

/// Upper bound on concurrent chunk requests per session.
pub const MAX_IN_FLIGHT: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub chunking: ChunkingConfig,
    /// Concurrent chunk requests per session, clamped to `1..=6`.
    pub max_in_flight: usize,
    pub retry: RetryConfig,
    pub request_timeout_secs: u64,
    pub expected_status: ExpectedStatus,
    pub signature: SignatureEndpoint,
    pub success: Option<SuccessEndpoint>,
    pub resume: ResumeConfig,
    /// Backend error codes that force a full reset, in addition to the
    /// built-in set.
    pub extra_reset_codes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            chunking: ChunkingConfig::default(),
            max_in_flight: 3,
            retry: RetryConfig::default(),
            request_timeout_secs: 300,
            expected_status: ExpectedStatus::default(),
            signature: SignatureEndpoint::default(),
            success: None,
            resume: ResumeConfig::default(),
            extra_reset_codes: Vec::new(),
        }
    }
}

/// Storage service the engine talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    S3(S3Config),
    Azure(AzureConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::S3(S3Config::default())
    }
}

impl BackendConfig {
    /// Bucket or container objects are written to.
    pub fn container(&self) -> &str {
        match self {
            Self::S3(c) => &c.bucket,
            Self::Azure(c) => &c.container,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Config {
    /// Bucket URL, e.g. `https://my-bucket.s3.amazonaws.com`.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub acl: Option<String>,
    pub reduced_redundancy: bool,
    pub server_side_encryption: bool,
    /// Metadata field carrying the original file name.
    pub filename_param: String,
    /// Custom metadata sent as `x-amz-meta-*`.
    pub params: BTreeMap<String, String>,
    pub content_type: Option<String>,
    /// Offset in seconds between the local and the service clock.
    pub clock_drift_secs: i64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: "us-east-1".into(),
            access_key: String::new(),
            acl: Some("private".into()),
            reduced_redundancy: false,
            server_side_encryption: false,
            filename_param: "qqfilename".into(),
            params: BTreeMap::new(),
            content_type: None,
            clock_drift_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureConfig {
    /// Account URL, e.g. `https://account.blob.core.windows.net`.
    pub endpoint: String,
    pub container: String,
    /// Custom metadata sent as `x-ms-meta-*`.
    pub metadata: BTreeMap<String, String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Tries per request, and full resets per upload.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Consecutive authorization failures tolerated before giving up.
    pub max_auth_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            max_auth_failures: 3,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

/// Status each operation must answer with to count as a success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExpectedStatus {
    pub s3: S3Statuses,
    pub azure: AzureStatuses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Statuses {
    pub initiate: u16,
    pub part: u16,
    pub complete: u16,
    pub whole: u16,
    pub abort: u16,
}

impl Default for S3Statuses {
    fn default() -> Self {
        Self {
            initiate: 200,
            part: 200,
            complete: 200,
            whole: 200,
            abort: 204,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureStatuses {
    pub put_block: u16,
    pub put_block_list: u16,
    pub put_blob: u16,
    pub delete: u16,
}

impl Default for AzureStatuses {
    fn default() -> Self {
        Self {
            put_block: 201,
            put_block_list: 201,
            put_blob: 201,
            delete: 202,
        }
    }
}

/// Local endpoint told about every finished upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuccessEndpoint {
    pub url: String,
    pub custom_headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResumeConfig {
    pub enabled: bool,
    /// State file; defaults to `uplink/resume.json` next to the config.
    pub path: Option<PathBuf>,
}

impl EngineConfig {
    /// Loads the config at `path`, or the default location when `None`.
    ///
    /// A missing file yields the defaults. An unparsable file is logged and
    /// also yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, UploadError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.clamp(1, MAX_IN_FLIGHT)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Where resumable state is kept when resume is enabled.
    pub fn resume_path(&self) -> Option<PathBuf> {
        if !self.resume.enabled {
            return None;
        }
        self.resume
            .path
            .clone()
            .or_else(|| config_base_dir().map(|d| d.join("uplink").join("resume.json")))
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), UploadError> {
        let (endpoint, container) = match &self.backend {
            BackendConfig::S3(c) => (&c.endpoint, &c.bucket),
            BackendConfig::Azure(c) => (&c.endpoint, &c.container),
        };
        if endpoint.is_empty() {
            return Err(UploadError::Config("backend endpoint is not set".into()));
        }
        if container.is_empty() {
            return Err(UploadError::Config("bucket or container is not set".into()));
        }
        if self.signature.url.is_empty() {
            return Err(UploadError::Config("signature endpoint is not set".into()));
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/uplink/config.json`, falling back to `~/.config`.
pub fn default_config_path() -> Option<PathBuf> {
    config_base_dir().map(|d| d.join("uplink").join("config.json"))
}

fn config_base_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.max_in_flight(), 3);
        assert_eq!(c.expected_status.s3.abort, 204);
        assert_eq!(c.expected_status.azure.put_block, 201);
        assert!(c.chunking.enabled);
        assert!(c.resume_path().is_none());
    }

    #[test]
    fn max_in_flight_clamped() {
        let mut c = EngineConfig::default();
        c.max_in_flight = 0;
        assert_eq!(c.max_in_flight(), 1);
        c.max_in_flight = 20;
        assert_eq!(c.max_in_flight(), MAX_IN_FLIGHT);
    }

    #[test]
    fn parses_partial_azure_file() {
        let json = r#"{
            "backend": {"type": "azure", "endpoint": "https://acct.blob.core.windows.net", "container": "photos"},
            "maxInFlight": 5,
            "signature": {"url": "http://localhost:8080/sas"}
        }"#;
        let c: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.backend.container(), "photos");
        assert_eq!(c.max_in_flight(), 5);
        assert_eq!(c.retry.max_attempts, 5);
        c.validate().unwrap();
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = EngineConfig::load(Some(&dir.path().join("none.json"))).unwrap();
        assert_eq!(c, EngineConfig::default());
    }

    #[test]
    fn load_garbage_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let c = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(c, EngineConfig::default());
    }

    #[test]
    fn validate_requires_endpoints() {
        let c = EngineConfig::default();
        assert!(matches!(c.validate(), Err(UploadError::Config(_))));
    }

    #[test]
    fn explicit_resume_path() {
        let mut c = EngineConfig::default();
        c.resume.enabled = true;
        c.resume.path = Some(PathBuf::from("/tmp/state.json"));
        assert_eq!(c.resume_path(), Some(PathBuf::from("/tmp/state.json")));
    }
}
