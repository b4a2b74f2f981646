use std::io::SeekFrom;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::plan::ChunkDescriptor;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes MD5 of `data`, base64-encoded as `Content-MD5` expects.
pub fn md5_base64(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

// ---------------------------------------------------------------------------
// Range reads
// ---------------------------------------------------------------------------

/// Reads exactly the bytes covered by `descriptor` from `path`.
///
/// Fails with `UnexpectedEof` if the file shrank since it was planned.
pub async fn read_range(path: &Path, descriptor: &ChunkDescriptor) -> Result<Bytes, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(descriptor.start)).await?;

    let mut buf = vec![0u8; descriptor.size() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_known_value() {
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn md5_known_value() {
        assert_eq!(md5_base64(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[tokio::test]
    async fn read_middle_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).collect();
        std::fs::write(&path, &data).unwrap();

        let d = ChunkDescriptor {
            index: 1,
            start: 100,
            end: 150,
        };
        let bytes = read_range(&path, &d).await.unwrap();
        assert_eq!(bytes.len(), 50);
        assert_eq!(&bytes[..], &data[100..150]);
    }

    #[tokio::test]
    async fn read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let d = ChunkDescriptor {
            index: 0,
            start: 0,
            end: 10,
        };
        assert!(matches!(
            read_range(&path, &d).await,
            Err(TransferError::Io(_))
        ));
    }
}
