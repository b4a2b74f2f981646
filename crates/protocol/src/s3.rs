//! S3 multipart upload bodies.
//!
//! Part numbers on the wire are 1-based (`chunk index + 1`).

use crate::error::ProtocolError;
use crate::xml::{read_flat, to_xml, write_text_element};

/// Content type of the CompleteMultipartUpload request body.
pub const COMPLETE_CONTENT_TYPE: &str = "application/xml; charset=UTF-8";

/// S3 error codes that invalidate the whole multipart upload.
pub const RESET_CODES: &[&str] = &[
    "EntityTooSmall",
    "InvalidPart",
    "InvalidPartOrder",
    "NoSuchUpload",
];

/// Returns `true` if `code` requires restarting the upload from scratch.
pub fn is_reset_code(code: &str) -> bool {
    RESET_CODES.contains(&code)
}

/// Converts a 0-based chunk index to an S3 part number.
pub fn part_number(chunk_index: u32) -> u32 {
    chunk_index + 1
}

/// One entry of the completion manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Builds the CompleteMultipartUpload body.
///
/// Parts are sorted ascending by part number regardless of input order.
pub fn build_complete_body(parts: &[CompletedPart]) -> Result<String, ProtocolError> {
    let mut sorted: Vec<&CompletedPart> = parts.iter().collect();
    sorted.sort_by_key(|p| p.part_number);

    to_xml("CompleteMultipartUpload", |w| {
        for part in &sorted {
            w.create_element("Part").write_inner_content(|w| {
                write_text_element(w, "PartNumber", &part.part_number.to_string())?;
                write_text_element(w, "ETag", &part.etag)
            })?;
        }
        Ok(())
    })
}

/// Extracts `UploadId` from an InitiateMultipartUploadResult body.
pub fn parse_initiate_result(xml: &[u8]) -> Result<String, ProtocolError> {
    let el = read_flat(xml)?;
    let id = el.require("UploadId")?;
    if id.is_empty() {
        return Err(ProtocolError::MissingElement("UploadId"));
    }
    Ok(id.to_string())
}

/// Bucket and key echoed back by a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteResult {
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
}

/// Parses a CompleteMultipartUploadResult body.
pub fn parse_complete_result(xml: &[u8]) -> Result<CompleteResult, ProtocolError> {
    let el = read_flat(xml)?;
    Ok(CompleteResult {
        bucket: el.require("Bucket")?.to_string(),
        key: el.require("Key")?.to_string(),
        etag: el.first("ETag").map(str::to_string),
    })
}

/// Structured error body returned by S3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Parses an `<Error>` body. Returns `None` for anything else.
///
/// S3 may return an error document with a 200 status on completion, so
/// callers check this before trusting a nominally successful response.
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
    fn complete_body_sorted_by_part() {
        let parts = vec![
            CompletedPart { part_number: 3, etag: "\"t2\"".into() },
            CompletedPart { part_number: 1, etag: "\"t0\"".into() },
            CompletedPart { part_number: 2, etag: "\"t1\"".into() },
        ];
        let body = build_complete_body(&parts).unwrap();
        let p1 = body.find("<PartNumber>1</PartNumber>").unwrap();
        let p2 = body.find("<PartNumber>2</PartNumber>").unwrap();
        let p3 = body.find("<PartNumber>3</PartNumber>").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert!(body.find("t0").unwrap() < body.find("t1").unwrap());
        assert_eq!(body.matches("<Part>").count(), 3);
    }

    #[test]
    fn initiate_result_upload_id() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>photos</Bucket>
  <Key>a/b.jpg</Key>
  <UploadId>VXBsb2FkIElE</UploadId>
</InitiateMultipartUploadResult>"#;
        assert_eq!(parse_initiate_result(xml).unwrap(), "VXBsb2FkIElE");
    }

    #[test]
    fn initiate_result_without_id_is_error() {
        let xml = b"<InitiateMultipartUploadResult><Bucket>b</Bucket></InitiateMultipartUploadResult>";
        assert!(matches!(
            parse_initiate_result(xml),
            Err(ProtocolError::MissingElement("UploadId"))
        ));
    }

    #[test]
    fn complete_result_echo() {
        let xml = br#"<CompleteMultipartUploadResult>
  <Location>https://photos.s3.amazonaws.com/a%20b.jpg</Location>
  <Bucket>photos</Bucket>
  <Key>a b.jpg</Key>
  <ETag>"3858f62230ac3c915f300c664312c11f-9"</ETag>
</CompleteMultipartUploadResult>"#;
        let res = parse_complete_result(xml).unwrap();
        assert_eq!(res.bucket, "photos");
        assert_eq!(res.key, "a b.jpg");
        assert_eq!(
            res.etag.as_deref(),
            Some("\"3858f62230ac3c915f300c664312c11f-9\"")
        );
    }

    #[test]
    fn error_body_and_reset_codes() {
        let xml = br#"<Error><Code>InvalidPartOrder</Code><Message>out of order</Message></Error>"#;
        let err = parse_error(xml).unwrap();
        assert_eq!(err.code, "InvalidPartOrder");
        assert!(is_reset_code(&err.code));
        assert!(!is_reset_code("SlowDown"));
        assert!(parse_error(b"<CompleteMultipartUploadResult/>").is_none());
        assert!(parse_error(b"not xml at all").is_none());
    }
}
