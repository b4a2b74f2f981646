use crate::TransferError;

/// Longest object key storage services accept, in bytes.
const MAX_KEY_LEN: usize = 1024;

/// Validates an object key returned by a key resolver.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than 1024 bytes
/// - Leading `/` (would create an empty path segment)
/// - `.` or `..` path segments
/// - Control characters
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }

    if key.starts_with('/') {
        return Err(TransferError::InvalidKey(format!(
            "leading slash not allowed: {key}"
        )));
    }

    if key.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(TransferError::InvalidKey(format!(
            "relative path segment not allowed: {key}"
        )));
    }

    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidKey("control character in key".into()));
    }

    Ok(())
}
