use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::error::{CacheError, Result};
use crate::util::is_temp_file_name;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Suffix of the marker left in place of an evicted file.
pub const TOMBSTONE_SUFFIX: &str = ".removed.txt";

/// Which files [`cleanup`] removes: large *and* not used recently.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvictionPolicy {
    pub max_file_size_mb: f64,
    pub last_usage_days: f64,
    /// Leave a `<file>.removed.txt` marker explaining the removal.
    pub replace_with_tombstone: bool,
    /// Folder names (exact match, any depth) that are never descended into.
    pub excluded_folder_names: BTreeSet<String>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_file_size_mb: 50.0,
            last_usage_days: 3.0,
            replace_with_tombstone: true,
            excluded_folder_names: BTreeSet::new(),
        }
    }
}

/// Size and staleness of one file, as seen by the eviction pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvictionCandidate {
    pub path: PathBuf,
    pub size_mb: f64,
    /// `None` when the filesystem exposes none of modified/accessed/created.
    pub last_used_days_ago: Option<f64>,
}

impl EvictionCandidate {
    pub fn evaluate(path: &Path, metadata: &fs::Metadata, now: SystemTime) -> Self {
        let last_used = [metadata.modified(), metadata.accessed(), metadata.created()]
            .into_iter()
            .filter_map(|time| time.ok())
            .max();
        let last_used_days_ago = last_used.map(|last_used| {
            // Timestamps in the future count as "used just now".
            let age = now.duration_since(last_used).unwrap_or(Duration::ZERO);
            age.as_secs_f64() / SECS_PER_DAY
        });

        Self {
            path: path.to_path_buf(),
            size_mb: metadata.len() as f64 / BYTES_PER_MB,
            last_used_days_ago,
        }
    }

    pub fn should_evict(&self, policy: &EvictionPolicy) -> bool {
        self.size_mb > policy.max_file_size_mb && self.is_stale(policy)
    }

    /// Last used more than `policy.last_usage_days` ago, or never known to be used.
    pub fn is_stale(&self, policy: &EvictionPolicy) -> bool {
        self.last_used_days_ago
            .map_or(true, |days| days > policy.last_usage_days)
    }

    fn tombstone_text(&self, policy: &EvictionPolicy) -> String {
        let staleness = match self.last_used_days_ago {
            Some(days) => format!(
                "last used {days:.1} days ago (threshold {} days)",
                policy.last_usage_days
            ),
            None => "last use unknown".to_string(),
        };
        format!(
            "{} was removed to free disk space: size {:.1} MB exceeds {} MB and {staleness}.\n\
             Request the file again to download a fresh copy.\n",
            self.path.display(),
            self.size_mb,
            policy.max_file_size_mb,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvictionFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result summary from a cleanup pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub removed_count: usize,
    pub reclaimed_mb: f64,
    pub removed: Vec<EvictionCandidate>,
    pub failed: Vec<EvictionFailure>,
}

/// Remove large, stale files under `root`. See [`cleanup_at`].
pub fn cleanup(root: &Path, policy: &EvictionPolicy) -> Result<EvictionReport> {
    cleanup_at(root, policy, SystemTime::now())
}

/// Remove every file under `root` that is larger than `policy.max_file_size_mb` and was last
/// used more than `policy.last_usage_days` before `now` (or whose last use is unknown).
///
/// Partial downloads orphaned by an interrupted writer (`<name>.tmp.<pid>.<n>`) are removed
/// once stale whatever their size, and never get a tombstone.
///
/// Symlinks are never followed. Errors on individual files are logged and reported in
/// [`EvictionReport::failed`]; only an unreadable `root` fails the whole pass.
pub fn cleanup_at(root: &Path, policy: &EvictionPolicy, now: SystemTime) -> Result<EvictionReport> {
    let mut report = EvictionReport::default();
    match fs::symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(CacheError::NotFound {
                path: root.to_path_buf(),
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(err) => return Err(err.into()),
    }

    let excluded = &policy.excluded_folder_names;
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !is_excluded(entry.file_name(), excluded)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                record_failure(&mut report, path, err.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(TOMBSTONE_SUFFIX) {
            continue;
        }
        let partial = is_temp_file_name(&name);

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                record_failure(&mut report, entry.path().to_path_buf(), err.to_string());
                continue;
            }
        };
        let candidate = EvictionCandidate::evaluate(entry.path(), &metadata, now);
        let evict = if partial {
            candidate.is_stale(policy)
        } else {
            candidate.should_evict(policy)
        };
        if !evict {
            continue;
        }

        if let Err(err) = fs::remove_file(entry.path()) {
            record_failure(&mut report, entry.path().to_path_buf(), err.to_string());
            continue;
        }

        if policy.replace_with_tombstone && !partial {
            let tombstone = tombstone_path(entry.path());
            if let Err(err) = fs::write(&tombstone, candidate.tombstone_text(policy)) {
                tracing::warn!(
                    target = "replica.cache",
                    path = %tombstone.display(),
                    error = %err,
                    "failed to write eviction tombstone"
                );
            }
        }

        tracing::info!(
            target = "replica.cache",
            path = %entry.path().display(),
            size_mb = candidate.size_mb,
            last_used_days_ago = candidate.last_used_days_ago,
            "evicted file"
        );
        report.removed_count += 1;
        report.reclaimed_mb += candidate.size_mb;
        report.removed.push(candidate);
    }

    Ok(report)
}

/// `<path>.removed.txt`.
pub fn tombstone_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TOMBSTONE_SUFFIX);
    PathBuf::from(name)
}

fn is_excluded(name: &OsStr, excluded: &BTreeSet<String>) -> bool {
    name.to_str().is_some_and(|name| excluded.contains(name))
}

fn record_failure(report: &mut EvictionReport, path: PathBuf, error: String) {
    tracing::warn!(
        target = "replica.cache",
        path = %path.display(),
        error = %error,
        "skipping file during eviction"
    );
    report.failed.push(EvictionFailure { path, error });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(size_mb: f64, days: Option<f64>) -> EvictionCandidate {
        EvictionCandidate {
            path: PathBuf::from("f"),
            size_mb,
            last_used_days_ago: days,
        }
    }

    #[test]
    fn eviction_rule_needs_both_size_and_staleness() {
        let policy = EvictionPolicy::default();
        assert!(candidate(51.0, Some(4.0)).should_evict(&policy));
        assert!(candidate(51.0, None).should_evict(&policy));
        assert!(!candidate(51.0, Some(1.0)).should_evict(&policy));
        assert!(!candidate(50.0, Some(30.0)).should_evict(&policy));
        assert!(!candidate(1.0, None).should_evict(&policy));
    }

    #[test]
    fn tombstone_path_appends_suffix() {
        assert_eq!(
            tombstone_path(Path::new("/c/p/datasets/a.bin.v2")),
            PathBuf::from("/c/p/datasets/a.bin.v2.removed.txt")
        );
    }

    #[test]
    fn missing_root_is_an_empty_report() {
        let tmp = tempfile::tempdir().unwrap();
        let report = cleanup(&tmp.path().join("nope"), &EvictionPolicy::default()).unwrap();
        assert_eq!(report, EvictionReport::default());
    }
}
