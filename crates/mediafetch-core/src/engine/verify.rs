//! Integrity checks run before a temp file is promoted to its final path

use crate::error::FetchError;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// SHA-256 of a file on disk, hex encoded
pub async fn sha256_file(path: &Path) -> Result<String, FetchError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let count = file.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check a file against an expected size and an optional checksum.
///
/// With `require_checksum` set, a missing checksum is reported as a
/// mismatch against an empty digest.
pub async fn verify_file(
    path: &Path,
    expected_size: Option<u64>,
    checksum: Option<&str>,
    require_checksum: bool,
) -> Result<u64, FetchError> {
    let actual = tokio::fs::metadata(path).await?.len();

    if let Some(expected) = expected_size {
        if expected != actual {
            return Err(FetchError::SizeMismatch { expected, actual });
        }
    }

    match checksum {
        Some(expected) => {
            let computed = sha256_file(path).await?;
            if !computed.eq_ignore_ascii_case(expected.trim()) {
                return Err(FetchError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: computed,
                });
            }
        }
        None if require_checksum => {
            return Err(FetchError::ChecksumMismatch {
                expected: String::new(),
                actual: sha256_file(path).await?,
            });
        }
        None => {}
    }

    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn checksum_comparison_ignores_case() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let size = verify_file(&path, Some(5), Some(&HELLO_SHA256.to_uppercase()), false)
            .await
            .unwrap();
        assert_eq!(size, 5);
    }

    #[tokio::test]
    async fn size_is_checked_before_hashing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        tokio::fs::write(&path, b"hell").await.unwrap();

        let err = verify_file(&path, Some(5), Some(HELLO_SHA256), false)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SizeMismatch { expected: 5, actual: 4 }));
    }

    #[tokio::test]
    async fn missing_checksum_fails_only_when_required() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert!(verify_file(&path, None, None, false).await.is_ok());
        let err = verify_file(&path, None, None, true).await.unwrap_err();
        assert!(err.is_verification());
    }
}
