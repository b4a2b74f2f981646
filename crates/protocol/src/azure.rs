//! Azure block blob bodies and identifiers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::ProtocolError;
use crate::xml::{read_flat, to_xml, write_text_element};

/// Blob type header sent with every whole-blob PUT.
pub const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
pub const BLOCK_BLOB: &str = "BlockBlob";

/// Prefix for user metadata headers.
pub const META_PREFIX: &str = "x-ms-meta-";

/// Returns the block id for a chunk.
///
/// Azure requires every block id of a blob to have the same length, so
/// the index is zero-padded to five digits before encoding.
pub fn block_id(chunk_index: u32) -> String {
    STANDARD.encode(format!("{chunk_index:05}"))
}

/// A block id paired with the chunk it was produced for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub index: u32,
    pub block_id: String,
}

/// Builds the Put Block List body, ordered by chunk index.
pub fn build_block_list(entries: &[BlockEntry]) -> Result<String, ProtocolError> {
    let mut sorted: Vec<&BlockEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.index);

    to_xml("BlockList", |w| {
        for entry in &sorted {
            write_text_element(w, "Latest", &entry.block_id)?;
        }
        Ok(())
    })
}

/// Structured error body returned by Azure storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Parses an Azure `<Error>` body. Returns `None` for anything else.
pub fn parse_error(xml: &[u8]) -> Option<ErrorBody> {
    let el = read_flat(xml).ok()?;
    if el.name != "Error" {
        return None;
    }
    Some(ErrorBody {
        code: el.first("Code").unwrap_or_default().to_string(),
        message: el.first("Message").unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ids_have_uniform_length() {
        assert_eq!(block_id(0), "MDAwMDA=");
        assert_eq!(block_id(7).len(), block_id(12345).len());
        assert_ne!(block_id(1), block_id(2));
    }

    #[test]
    fn block_list_in_index_order() {
        let entries = vec![
            BlockEntry { index: 2, block_id: block_id(2) },
            BlockEntry { index: 0, block_id: block_id(0) },
            BlockEntry { index: 1, block_id: block_id(1) },
        ];
        let body = build_block_list(&entries).unwrap();
        let positions: Vec<usize> = (0..3)
            .map(|i| body.find(&block_id(i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(body.matches("<Latest>").count(), 3);
        assert!(body.contains("<BlockList>"));
    }

    #[test]
    fn azure_error_body() {
        let xml = br#"<?xml version="1.0" encoding="utf-8"?><Error><Code>AuthenticationFailed</Code><Message>Signature not valid</Message><AuthenticationErrorDetail>expired</AuthenticationErrorDetail></Error>"#;
        let err = parse_error(xml).unwrap();
        assert_eq!(err.code, "AuthenticationFailed");
        assert_eq!(err.message, "Signature not valid");
    }
}
