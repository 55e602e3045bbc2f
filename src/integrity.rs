use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use sha2::{Sha256, Digest};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed sha256 digest: {0}")]
    MalformedDigest(String),
}

/// Compute SHA256 hash of a file asynchronously, as lowercase hex.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compares the file's digest against `expected` (hex, any case).
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<bool, IntegrityError> {
    let expected = expected.trim();
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IntegrityError::MalformedDigest(expected.to_string()));
    }
    let sum = sha256_sum(path).await?;
    Ok(sum.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn hashes_file_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        assert_eq!(sha256_sum(&path).await.unwrap(), HELLO);
        assert!(verify_sha256(&path, &HELLO.to_uppercase()).await.unwrap());
        assert!(!verify_sha256(&path, &"0".repeat(64)).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_malformed_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"x").await.unwrap();
        assert!(matches!(
            verify_sha256(&path, "abc").await,
            Err(IntegrityError::MalformedDigest(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            sha256_sum(&dir.path().join("nope")).await,
            Err(IntegrityError::Io(_))
        ));
    }
}
