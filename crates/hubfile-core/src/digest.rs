//! SHA-256 helpers.
//!
//! Digests travel as lowercase hex and are compared case-insensitively.

use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

const READ_BUF: usize = 256 * 1024;

/// Lowercase hex encoding.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Finish a hasher and hex-encode the digest.
#[must_use]
pub fn finish_hex(hasher: Sha256) -> String {
    to_hex(&hasher.finalize())
}

/// Case-insensitive digest comparison, ignoring surrounding whitespace.
#[must_use]
pub fn digest_matches(got: &str, expected: &str) -> bool {
    got.trim().eq_ignore_ascii_case(expected.trim())
}

/// Hash a whole file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(finish_hex(hasher))
}

/// Feed the first `len` bytes of `file` into `hasher`.
///
/// Used when a download resumes so the running digest covers the bytes
/// already on disk. Stops early at end of file. The file position is left
/// wherever reading stopped; callers seek afterwards.
///
/// # Errors
///
/// Returns an error if seeking or reading fails.
pub async fn hash_prefix(file: &mut File, hasher: &mut Sha256, len: u64) -> Result<()> {
    file.seek(std::io::SeekFrom::Start(0)).await?;
    let mut buf = vec![0u8; READ_BUF];
    let mut remain = len;
    while remain > 0 {
        let want = usize::try_from(remain).map_or(buf.len(), |r| r.min(buf.len()));
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remain -= n as u64;
    }
    Ok(())
}

/// Whether a staging file already holds exactly `size` bytes matching
/// `sha256` (an empty digest skips the content check).
pub async fn verify_part(path: &Path, size: u64, sha256: &str) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == size => {}
        _ => return false,
    }
    if sha256.trim().is_empty() {
        return true;
    }
    match sha256_file(path).await {
        Ok(got) => digest_matches(&got, sha256),
        Err(e) => {
            tracing::debug!(path = %path.display(), "Failed to hash staging file: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(to_hex(&[]), "");
    }

    #[test]
    fn test_digest_matches() {
        assert!(digest_matches(HELLO_SHA, &HELLO_SHA.to_uppercase()));
        assert!(!digest_matches(HELLO_SHA, "00"));
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("hello.txt");
        std::fs::write(&path, b"hello").expect("write");
        assert_eq!(sha256_file(&path).await.expect("hash"), HELLO_SHA);
    }

    #[tokio::test]
    async fn test_hash_prefix_matches_whole_hash() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"hello world").expect("write");

        let mut file = File::open(&path).await.expect("open");
        let mut hasher = Sha256::new();
        hash_prefix(&mut file, &mut hasher, 5).await.expect("prefix");
        assert_eq!(finish_hex(hasher), HELLO_SHA);
    }

    #[tokio::test]
    async fn test_verify_part() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("x.part");
        std::fs::write(&path, b"hello").expect("write");

        assert!(verify_part(&path, 5, HELLO_SHA).await);
        assert!(verify_part(&path, 5, "").await);
        assert!(!verify_part(&path, 6, "").await);
        assert!(!verify_part(&path, 5, "deadbeef").await);
        assert!(!verify_part(&temp.path().join("missing"), 5, "").await);
    }
}
