//! Path and name sanitization.
//!
//! Every filesystem access driven by a remote peer goes through
//! [`resolve_paths`], which guarantees the result stays inside the
//! configured base directory. Directories travel on the wire as
//! forward-slash relative paths; names are single path segments.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::PART_SUFFIX;

/// Final and staging locations for one transferred file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    /// Where the completed file lives.
    pub final_path: PathBuf,
    /// `<final_path>.part`, written while the transfer is in flight.
    pub part_path: PathBuf,
}

/// Validate a single file name.
///
/// Surrounding whitespace is trimmed. Empty names, `.`, `..`, and names
/// containing a separator or NUL are rejected.
pub fn sanitize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidName(name.to_string()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

/// Validate a relative directory and return its cleaned form.
///
/// `""` and `"."` both mean the base directory and come back as `""`.
/// Absolute paths, drive prefixes, backslashes, NUL, and anything that
/// climbs above the base after cleaning are rejected.
pub fn sanitize_dir(dir: &str) -> Result<String> {
    let dir = dir.trim();
    if dir.is_empty() || dir == "." {
        return Ok(String::new());
    }
    let invalid = || Error::InvalidDir(dir.to_string());

    if dir.contains('\0') || dir.starts_with('/') || dir.starts_with('\\') {
        return Err(invalid());
    }
    let bytes = dir.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(invalid());
    }
    if dir.contains('\\') {
        return Err(invalid());
    }

    let clean = clean_relative(dir);
    if clean == "." {
        return Ok(String::new());
    }
    if clean == ".." || clean.starts_with("../") {
        return Err(invalid());
    }
    Ok(clean)
}

/// Trim a directory and convert backslashes to forward slashes.
///
/// Applied to every directory arriving from a peer or the public API
/// before it is sanitized.
#[must_use]
pub fn normalize_dir(dir: &str) -> String {
    dir.trim().replace('\\', "/")
}

/// Resolve `base/dir/name` and its `.part` sibling.
///
/// `base` may be relative (an empty base means the working directory);
/// the returned paths are absolute.
pub fn resolve_paths(base: &Path, dir: &str, name: &str) -> Result<ResolvedPaths> {
    let name = sanitize_name(name)?;
    let dir = sanitize_dir(dir)?;
    let base = absolute_base(base)?;

    let mut joined = base.clone();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        joined.push(segment);
    }
    joined.push(&name);
    let final_path = lexical_normalize(&joined);

    if final_path.strip_prefix(&base).is_err() || final_path == base {
        return Err(Error::InvalidPath(final_path.display().to_string()));
    }

    let part_path = part_path_for(&final_path);
    Ok(ResolvedPaths {
        final_path,
        part_path,
    })
}

/// Resolve a directory under `base`, used for listings.
pub fn resolve_dir(base: &Path, dir: &str) -> Result<PathBuf> {
    let dir = sanitize_dir(dir)?;
    let base = absolute_base(base)?;
    let mut joined = base.clone();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        joined.push(segment);
    }
    let resolved = lexical_normalize(&joined);
    if resolved.strip_prefix(&base).is_err() {
        return Err(Error::InvalidPath(resolved.display().to_string()));
    }
    Ok(resolved)
}

/// Make the base directory absolute and lexically clean.
pub fn absolute_base(base: &Path) -> Result<PathBuf> {
    let base = if base.as_os_str().is_empty() {
        Path::new(".")
    } else {
        base
    };
    let abs = std::path::absolute(base)?;
    Ok(lexical_normalize(&abs))
}

/// Append the staging suffix to a final path.
#[must_use]
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut raw = final_path.as_os_str().to_os_string();
    raw.push(PART_SUFFIX);
    PathBuf::from(raw)
}

/// Whether a file name carries the staging suffix (case-insensitive).
#[must_use]
pub fn is_part_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(PART_SUFFIX)
}

/// Slash-path cleaning for relative paths: collapses empty and `.`
/// segments and folds `..` into its parent where one exists.
fn clean_relative(dir: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in dir.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|last| *last != "..") {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
