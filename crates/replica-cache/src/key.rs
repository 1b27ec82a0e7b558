//! Mapping between logical keys and local paths.
//!
//! The local file name *is* the cache index: `datasets/a.txt.v3` is version 3 of
//! `datasets/a.txt`, and a bare `datasets/a.txt` is implicitly version 1.

use crate::error::{CacheError, Result};
use std::path::{Path, PathBuf};

const VERSION_MARKER: &str = ".v";

/// Join `root` and `key`, appending `.v<version>` when a version is given.
///
/// Keys are `/`-separated and must stay under `root`: absolute keys and `..` segments are
/// rejected.
pub fn resolve_local_path(root: &Path, key: &str, version: Option<u64>) -> Result<PathBuf> {
    let segments = key_segments(key)?;
    let mut path = root.to_path_buf();
    let last = segments.len() - 1;
    for (idx, segment) in segments.into_iter().enumerate() {
        if idx == last {
            match version {
                Some(version) => path.push(versioned_name(segment, version)),
                None => path.push(segment),
            }
        } else {
            path.push(segment);
        }
    }
    Ok(path)
}

/// Validate `key` and return it in canonical `/`-joined form (no `.` or empty segments).
pub fn normalize_key(key: &str) -> Result<String> {
    Ok(key_segments(key)?.join("/"))
}

fn key_segments(key: &str) -> Result<Vec<&str>> {
    let invalid = |reason| CacheError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    if key.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if key.starts_with('/') || key.starts_with('\\') || Path::new(key).is_absolute() {
        return Err(invalid("absolute keys are not allowed"));
    }
    // `C:foo` style prefixes on Windows.
    if key.split(['/', '\\']).next().is_some_and(|first| first.contains(':')) {
        return Err(invalid("drive prefixes are not allowed"));
    }

    let mut segments = Vec::new();
    for segment in key.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return Err(invalid("path traversal outside the cache root")),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(invalid("key is empty"));
    }
    Ok(segments)
}

/// Version encoded in the trailing `.v<digits>` of a path's file name, or `1` if there is none.
pub fn extract_version(path: impl AsRef<Path>) -> u64 {
    let path = path.as_ref();
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy(),
        None => path.as_os_str().to_string_lossy(),
    };
    split_version(&name).1.unwrap_or(1)
}

/// Remove a trailing `.v<digits>` suffix. Idempotent.
pub fn strip_version(key: &str) -> &str {
    split_version(key).0
}

/// Split `key.vN` into (`key`, `Some(N)`); keys without a suffix come back unchanged.
///
/// Stacked suffixes (`m.v1.v2`) are all removed and the outermost version wins, which keeps
/// [`strip_version`] idempotent.
pub fn split_version(key: &str) -> (&str, Option<u64>) {
    let mut base = key;
    let mut outermost = None;
    while let Some((rest, version)) = split_one_version(base) {
        outermost.get_or_insert(version);
        base = rest;
    }
    (base, outermost)
}

fn split_one_version(key: &str) -> Option<(&str, u64)> {
    let idx = key.rfind(VERSION_MARKER)?;
    let (base, suffix) = key.split_at(idx);
    if base.is_empty() || base.ends_with(['/', '\\']) {
        return None;
    }
    let version = parse_version_digits(&suffix[VERSION_MARKER.len()..])?;
    Some((base, version))
}

/// `name.v<version>`.
pub fn versioned_name(name: &str, version: u64) -> String {
    format!("{name}{VERSION_MARKER}{version}")
}

/// If `file_name` is `base` or `base.v<N>`, return its version.
///
/// Anything else sharing the prefix (temporary download files, tombstones, `base.v2.zip`) does
/// not count as a cached version of `base`.
pub fn is_version_of(file_name: &str, base: &str) -> Option<u64> {
    if file_name == base {
        return Some(1);
    }
    let rest = file_name.strip_prefix(base)?;
    parse_version_digits(rest.strip_prefix(VERSION_MARKER)?)
}

fn parse_version_digits(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(version) => Some(version),
    }
}
