//! Authorization error types.

/// Errors produced while obtaining an authorization grant.
///
/// `Clone` because one failure is delivered to every caller waiting on the
/// same request id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("signing server rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("signing server unreachable: {0}")]
    Transport(String),

    #[error("invalid signing response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for AuthorizationError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
