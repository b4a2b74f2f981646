//! Protocol error types.

/// Errors produced while encoding or decoding wire bodies.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing element: {0}")]
    MissingElement(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
