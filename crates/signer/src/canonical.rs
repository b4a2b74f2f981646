//! SigV4 canonical request and string-to-sign construction.
//!
//! ```text
//! HTTPRequestMethod\n
//! CanonicalURI\n
//! CanonicalQueryString\n
//! CanonicalHeaders\n\n
//! SignedHeaders\n
//! HashedPayload
//! ```

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Everything except RFC 3986 unreserved characters is encoded.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn uri_encode(s: &str) -> String {
    utf8_percent_encode(s, URI_ENCODE_SET).to_string()
}

/// Encodes each path segment, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }
    let encoded = path.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{encoded}")
    }
}

/// Encodes and sorts query parameters.
pub fn encode_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort_unstable();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Returns `(canonical headers, signed headers)` for `headers`.
///
/// Names are lowercased, values trimmed with inner whitespace collapsed,
/// duplicate names joined with commas.
pub fn canonical_headers(headers: &[(String, String)]) -> (String, String) {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        map.entry(name.to_lowercase())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let canonical = map
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n");
    let signed = map.keys().cloned().collect::<Vec<_>>().join(";");
    (canonical, signed)
}

pub fn canonical_request(
    method: &str,
    path: &str,
    query: &[(String, String)],
    headers: &[(String, String)],
    payload_hash: &str,
) -> String {
    let (canonical_headers, signed_headers) = canonical_headers(headers);
    format!(
        "{method}\n{}\n{}\n{canonical_headers}\n\n{signed_headers}\n{payload_hash}",
        encode_path(path),
        encode_query(query)
    )
}

pub fn credential_scope(date: &str, region: &str) -> String {
    format!("{date}/{region}/s3/aws4_request")
}

pub fn string_to_sign(timestamp: &str, scope: &str, canonical_request: &str) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{timestamp}\n{scope}\n{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn h(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn aws_get_object_example() {
        let headers = vec![
            h("Host", "examplebucket.s3.amazonaws.com"),
            h("Range", "bytes=0-9"),
            h("x-amz-content-sha256", EMPTY_SHA256),
            h("x-amz-date", "20130524T000000Z"),
        ];
        let canonical = canonical_request("GET", "/test.txt", &[], &headers, EMPTY_SHA256);
        let sts = string_to_sign(
            "20130524T000000Z",
            &credential_scope("20130524", "us-east-1"),
            &canonical,
        );
        assert_eq!(
            sts,
            "AWS4-HMAC-SHA256\n20130524T000000Z\n20130524/us-east-1/s3/aws4_request\n\
             7344ae5b7ee6c3e7e6b0fe0640412a37625d1fbfff95c48bbb2dc43964946972"
        );
    }

    #[test]
    fn headers_sorted_and_collapsed() {
        let (canonical, signed) = canonical_headers(&[
            h("X-Amz-Meta-Name", "  a   b "),
            h("host", "h"),
            h("x-amz-meta-name", "c"),
        ]);
        assert_eq!(canonical, "host:h\nx-amz-meta-name:a b,c");
        assert_eq!(signed, "host;x-amz-meta-name");
    }

    #[test]
    fn path_segments_encoded() {
        assert_eq!(encode_path(""), "/");
        assert_eq!(encode_path("/a b/ü.jpg"), "/a%20b/%C3%BC.jpg");
        assert_eq!(encode_path("k+1"), "/k%2B1");
    }

    #[test]
    fn query_sorted_with_empty_values() {
        let q = vec![h("uploads", ""), h("a", "1 2")];
        assert_eq!(encode_query(&q), "a=1%202&uploads=");
    }
}
