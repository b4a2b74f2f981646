//! Combines acked chunks into the final object.

use percent_encoding::percent_decode_str;
use tracing::{info, warn};

use crate::backend::{ChunkedUploadBackend, CompletionEcho, RequestContext};
use crate::error::UploadError;

/// Result of a successful combine request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub container: String,
    pub key: String,
    pub parts: usize,
}

pub struct Finalizer;

impl Finalizer {
    /// Sends the combine request once every planned chunk is acked.
    ///
    /// The manifest is sorted by chunk index. When the service echoes the
    /// object identity it must match the request.
    pub async fn finalize(
        ctx: &RequestContext,
        backend: &dyn ChunkedUploadBackend,
    ) -> Result<Finalized, UploadError> {
        let session = &ctx.session;
        let planned = session.plan().len();
        let receipts = session.sorted_receipts();
        if receipts.len() != planned {
            return Err(UploadError::Precondition(format!(
                "{} of {planned} chunks acked",
                receipts.len()
            )));
        }
        if let Some((pos, r)) = receipts
            .iter()
            .enumerate()
            .find(|(pos, r)| r.index as usize != *pos)
        {
            return Err(UploadError::Precondition(format!(
                "manifest gap at position {pos}: found chunk {}",
                r.index
            )));
        }

        let handle = session.remote_handle();
        let echo = backend.complete(ctx, handle.as_deref(), &receipts).await?;

        if let CompletionEcho::Echoed { container, key } = &echo {
            if decode(container) != decode(session.container()) {
                warn!(session = %session.id(), expected = %session.container(), actual = %container, "combine echoed a different container");
                return Err(UploadError::ProtocolMismatch {
                    expected: session.container().to_string(),
                    actual: container.clone(),
                });
            }
            if decode(key) != decode(&ctx.key) {
                warn!(session = %session.id(), expected = %ctx.key, actual = %key, "combine echoed a different key");
                return Err(UploadError::ProtocolMismatch {
                    expected: ctx.key.clone(),
                    actual: key.clone(),
                });
            }
        }

        info!(session = %session.id(), key = %ctx.key, parts = planned, backend = backend.name(), "upload combined");
        Ok(Finalized {
            container: session.container().to_string(),
            key: ctx.key.clone(),
            parts: planned,
        })
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
