//! Success notification sent to a local endpoint after an upload finishes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SuccessEndpoint;
use crate::error::UploadError;

/// Body posted to the success endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuccessPayload {
    pub key: String,
    pub uuid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SuccessReply {
    success: Option<bool>,
    error: Option<String>,
    reset: bool,
}

pub struct SuccessNotifier {
    http: reqwest::Client,
    endpoint: SuccessEndpoint,
}

impl SuccessNotifier {
    pub fn new(http: reqwest::Client, endpoint: SuccessEndpoint) -> Self {
        Self { http, endpoint }
    }

    /// Posts `payload`. A reply asking for a reset yields
    /// [`UploadError::ResetRequested`]; other failures yield
    /// [`UploadError::Notification`].
    pub async fn notify(&self, payload: &SuccessPayload) -> Result<(), UploadError> {
        let mut req = self
            .http
            .post(&self.endpoint.url)
            .query(&self.endpoint.params)
            .json(payload);
        for (name, value) in &self.endpoint.custom_headers {
            req = req.header(name, value);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| UploadError::Notification(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let reply: SuccessReply = if body.trim().is_empty() {
            SuccessReply::default()
        } else {
            serde_json::from_str(&body).unwrap_or_default()
        };

        if reply.reset {
            let reason = reply.error.unwrap_or_else(|| "reset requested".into());
            warn!(key = %payload.key, reason = %reason, "success endpoint requested reset");
            return Err(UploadError::ResetRequested(reason));
        }
        if !status.is_success() || reply.success == Some(false) {
            let reason = reply
                .error
                .unwrap_or_else(|| format!("success endpoint returned {}", status.as_u16()));
            return Err(UploadError::Notification(reason));
        }
        debug!(key = %payload.key, "success endpoint notified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serves one canned response and returns the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/success", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut raw = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&raw[..pos]).to_ascii_lowercase();
                    let len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= pos + 4 + len {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (url, handle)
    }

    fn payload() -> SuccessPayload {
        SuccessPayload {
            key: "abc.jpg".into(),
            uuid: "f1".into(),
            name: "cat.jpg".into(),
            bucket: Some("bucket".into()),
            container: None,
            etag: Some("\"e\"".into()),
        }
    }

    fn notifier(url: String) -> SuccessNotifier {
        let mut endpoint = SuccessEndpoint {
            url,
            ..SuccessEndpoint::default()
        };
        endpoint.custom_headers.insert("X-App".into(), "uplink".into());
        SuccessNotifier::new(reqwest::Client::new(), endpoint)
    }

    #[tokio::test]
    async fn posts_json_payload() {
        let (url, server) = serve_once("200 OK", r#"{"success": true}"#).await;
        notifier(url).notify(&payload()).await.unwrap();
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /success"));
        assert!(raw.to_ascii_lowercase().contains("x-app: uplink"));
        assert!(raw.contains(r#""key":"abc.jpg""#));
        assert!(raw.contains(r#""bucket":"bucket""#));
        assert!(!raw.contains("container"));
    }

    #[tokio::test]
    async fn reset_flag_requests_reset() {
        let (url, _server) = serve_once("500 Internal Server Error", r#"{"error": "bad parts", "reset": true}"#).await;
        let err = notifier(url).notify(&payload()).await.unwrap_err();
        assert!(matches!(err, UploadError::ResetRequested(ref r) if r == "bad parts"));
    }

    #[tokio::test]
    async fn failure_without_reset_is_notification_error() {
        let (url, _server) = serve_once("200 OK", r#"{"success": false, "error": "db down"}"#).await;
        let err = notifier(url).notify(&payload()).await.unwrap_err();
        assert!(matches!(err, UploadError::Notification(ref r) if r == "db down"));
    }

    #[tokio::test]
    async fn empty_ok_body_is_success() {
        let (url, _server) = serve_once("204 No Content", "").await;
        notifier(url).notify(&payload()).await.unwrap();
    }
}
