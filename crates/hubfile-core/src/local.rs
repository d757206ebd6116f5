//! Local answers to `list` and `read_text`.

use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::path::{normalize_dir, resolve_dir, resolve_paths, sanitize_dir};

/// Default preview size (64 KB).
pub const DEFAULT_TEXT_BYTES: u32 = 64 * 1024;

/// Largest preview size (256 KB).
pub const MAX_TEXT_BYTES: u32 = 256 * 1024;

/// Contents of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Cleaned directory that was listed
    pub dir: String,
    /// Subdirectory names, sorted
    pub dirs: Vec<String>,
    /// Other entry names, sorted
    pub files: Vec<String>,
}

/// Leading slice of a text file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextPreview {
    /// Decoded text
    pub text: String,
    /// Whether the file continues past `text`
    pub truncated: bool,
    /// Full file size
    pub size: u64,
}

/// List `dir` under `base`.
///
/// # Errors
///
/// Returns [`Error::InvalidDir`] for an unsafe directory and
/// [`Error::NotFound`] if it cannot be read.
pub async fn list(base: &Path, dir: &str) -> Result<Listing> {
    let dir = sanitize_dir(&normalize_dir(dir))?;
    let root = resolve_dir(base, &dir)?;

    let mut entries = tokio::fs::read_dir(&root)
        .await
        .map_err(|_| Error::NotFound(root.display().to_string()))?;

    let mut listing = Listing {
        dir,
        ..Listing::default()
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            listing.dirs.push(name);
        } else {
            listing.files.push(name);
        }
    }
    listing.dirs.sort();
    listing.files.sort();
    Ok(listing)
}

/// Read up to `max_bytes` of `dir/name` as UTF-8.
///
/// A `max_bytes` of zero means [`DEFAULT_TEXT_BYTES`]; values above
/// [`MAX_TEXT_BYTES`] are capped.
///
/// # Errors
///
/// Returns an error for an unsafe path, a missing file, or bytes that are
/// not valid UTF-8.
pub async fn read_text(base: &Path, dir: &str, name: &str, max_bytes: u32) -> Result<TextPreview> {
    let resolved = resolve_paths(base, &normalize_dir(dir), name)?;
    let meta = tokio::fs::metadata(&resolved.final_path)
        .await
        .map_err(|_| Error::NotFound(name.trim().to_string()))?;
    if meta.is_dir() {
        return Err(Error::NotFound(name.trim().to_string()));
    }
    let size = meta.len();

    let limit = match max_bytes {
        0 => DEFAULT_TEXT_BYTES,
        n => n.min(MAX_TEXT_BYTES),
    };
    let file = tokio::fs::File::open(&resolved.final_path).await?;
    let mut buf = Vec::with_capacity(limit as usize);
    file.take(u64::from(limit)).read_to_end(&mut buf).await?;

    let truncated = (buf.len() as u64) < size;
    let text = String::from_utf8(buf).map_err(|_| Error::NotText)?;
    Ok(TextPreview {
        text,
        truncated,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_sorted() {
        let temp = TempDir::new().expect("create temp dir");
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(docs.join("zeta")).expect("mkdir");
        std::fs::create_dir_all(docs.join("alpha")).expect("mkdir");
        std::fs::write(docs.join("b.txt"), b"b").expect("write");
        std::fs::write(docs.join("a.txt"), b"a").expect("write");

        let listing = list(temp.path(), "docs\\").await.expect("list");
        assert_eq!(listing.dir, "docs");
        assert_eq!(listing.dirs, vec!["alpha", "zeta"]);
        assert_eq!(listing.files, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_list_errors() {
        let temp = TempDir::new().expect("create temp dir");
        assert!(matches!(
            list(temp.path(), "missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            list(temp.path(), "../up").await,
            Err(Error::InvalidDir(_))
        ));
    }

    #[tokio::test]
    async fn test_read_text_truncates() {
        let temp = TempDir::new().expect("create temp dir");
        std::fs::write(temp.path().join("notes.txt"), b"hello world").expect("write");

        let preview = read_text(temp.path(), "", "notes.txt", 5).await.expect("read");
        assert_eq!(preview.text, "hello");
        assert!(preview.truncated);
        assert_eq!(preview.size, 11);

        let preview = read_text(temp.path(), "", "notes.txt", 0).await.expect("read");
        assert_eq!(preview.text, "hello world");
        assert!(!preview.truncated);
    }

    #[tokio::test]
    async fn test_read_text_rejects_binary() {
        let temp = TempDir::new().expect("create temp dir");
        std::fs::write(temp.path().join("blob.bin"), [0xff, 0xfe, 0x00]).expect("write");
        assert!(matches!(
            read_text(temp.path(), "", "blob.bin", 0).await,
            Err(Error::NotText)
        ));
        assert!(matches!(
            read_text(temp.path(), "", "absent.txt", 0).await,
            Err(Error::NotFound(_))
        ));
    }
}
