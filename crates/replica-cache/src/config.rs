use crate::error::CacheError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default project namespace when none is configured.
pub const DEFAULT_PROJECT: &str = "default";

/// Default chunk size for streamed transfers.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Where the local replica lives.
///
/// Files for a project are laid out as `<root_folder>/<project>/<data type>s/<file name>[.v<N>]`.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub root_folder: PathBuf,
    pub project: String,
    /// Read/write chunk size for streamed transfers. Not protocol-significant.
    pub chunk_size: usize,
}

impl CacheConfig {
    pub fn new(root_folder: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            root_folder: root_folder.into(),
            project: project.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Build a config from `REPLICA_CACHE_DIR` / `REPLICA_PROJECT`, falling back to
    /// `~/.replica/cache` and the `default` project.
    pub fn from_env() -> Result<Self, CacheError> {
        let root_folder = match std::env::var_os("REPLICA_CACHE_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_cache_root()?,
        };
        let project = std::env::var("REPLICA_PROJECT")
            .ok()
            .map(|project| project.trim().to_string())
            .filter(|project| !project.is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        Ok(Self::new(root_folder, project))
    }

    /// `<root_folder>/<project>`.
    pub fn project_folder(&self) -> PathBuf {
        self.root_folder.join(&self.project)
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }
}

/// Connection settings for [`crate::HttpRemoteStore`].
#[derive(Clone, Debug)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub project: String,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub token: Option<String>,
    /// Applied to connect and read operations. `None` leaves `ureq`'s defaults.
    pub timeout: Option<Duration>,
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project: project.into(),
            token: None,
            timeout: None,
        }
    }

    /// Reads `REPLICA_REMOTE_URL` (required), `REPLICA_PROJECT`, `REPLICA_TOKEN` and
    /// `REPLICA_TIMEOUT_SECS`. Returns `None` when no remote URL is configured, which puts the
    /// cache in local-only mode.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("REPLICA_REMOTE_URL").ok()?;
        let base_url = base_url.trim();
        if base_url.is_empty() {
            return None;
        }

        let project = std::env::var("REPLICA_PROJECT")
            .ok()
            .map(|project| project.trim().to_string())
            .filter(|project| !project.is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        let token = std::env::var("REPLICA_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        let timeout = match std::env::var("REPLICA_TIMEOUT_SECS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(err) => {
                    tracing::debug!(
                        target = "replica.cache",
                        raw = %raw,
                        error = %err,
                        "invalid REPLICA_TIMEOUT_SECS; using default timeouts"
                    );
                    None
                }
            },
            Err(_) => None,
        };

        Some(Self {
            base_url: base_url.to_string(),
            project,
            token,
            timeout,
        })
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".replica").join("cache"))
}
