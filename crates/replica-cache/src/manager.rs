//! The orchestrator: decides, per request, whether the local replica can be reused or must be
//! (re)downloaded, and packages folders before upload.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use replica_archive::{is_archive_name, pack, strip_archive_extension, unpack, PackOptions};
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::events::{EventBus, FileEvent};
use crate::evict::{self, EvictionPolicy, EvictionReport};
use crate::key::{is_version_of, normalize_key, resolve_local_path, split_version, versioned_name};
use crate::store::{RemoteFileMetadata, RemoteStore};
use crate::transfer::{no_progress, ProgressFn, TransferEngine};
use crate::util::{atomic_write_with, remove_file_best_effort};

/// The kinds of files a project stores. Each maps to a top-level remote prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Model,
    Dataset,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
        }
    }

    /// `models/` or `datasets/`.
    pub fn prefix(self) -> String {
        format!("{}s/", self.as_str())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "model" => Ok(Self::Model),
            "dataset" => Ok(Self::Dataset),
            _ => Err(CacheError::InvalidDataType {
                value: value.to_string(),
            }),
        }
    }
}

/// How a `get_file` request was answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    /// The local copy matches the remote (or is a materialized directory).
    LocalFresh,
    /// The remote holds newer or different content; it was downloaded.
    LocalStale,
    /// There was no local copy; it was downloaded.
    LocalMissing,
    /// The remote could not be consulted; the local copy was returned as is.
    RemoteUnavailable,
}

/// The outcome of [`CacheManager::get_file`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Local file, or the unpacked folder when unpacking was requested.
    pub path: PathBuf,
    /// Key of the returned copy relative to the project folder, version-qualified when the copy
    /// carries a version suffix.
    pub key: String,
    /// `None` for directories and plain URL downloads.
    pub version: Option<u64>,
    pub state: CacheState,
    /// Whether bytes were transferred over the network.
    pub downloaded: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub force_download: bool,
    /// Unpack archives into a sibling folder and return the folder.
    pub unpack: bool,
}

impl GetOptions {
    pub fn force_download(mut self) -> Self {
        self.force_download = true;
        self
    }

    pub fn unpack(mut self) -> Self {
        self.unpack = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// User metadata stored with the uploaded version.
    pub metadata: BTreeMap<String, String>,
    /// Remote file name. Defaults to the local file (or folder) name.
    pub file_name: Option<String>,
}

impl UploadOptions {
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug)]
struct LocalCopy {
    path: PathBuf,
    version: u64,
    size: u64,
}

/// Local replica of one project of the remote store.
///
/// Without a remote (or while [`RemoteStore::is_connected`] is `false`) the manager serves
/// whatever local copies exist and refuses uploads.
pub struct CacheManager {
    config: CacheConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    transfer: TransferEngine,
    events: Arc<EventBus>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("remote", &self.remote.is_some())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(config: CacheConfig, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self::with_events(config, remote, Arc::new(EventBus::new()))
    }

    /// Like [`CacheManager::new`], publishing to an existing [`EventBus`].
    pub fn with_events(
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        events: Arc<EventBus>,
    ) -> Self {
        let transfer = TransferEngine::new(config.chunk_size);
        Self {
            config,
            remote,
            transfer,
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// `<root_folder>/<project>`.
    pub fn project_folder(&self) -> PathBuf {
        self.config.project_folder()
    }

    pub fn is_connected(&self) -> bool {
        self.connected_store().is_some()
    }

    fn connected_store(&self) -> Option<&dyn RemoteStore> {
        self.remote.as_deref().filter(|store| store.is_connected())
    }

    fn require_store(&self) -> Result<&dyn RemoteStore> {
        self.connected_store().ok_or(CacheError::NotConnected)
    }

    /// Resolve `key` to a local path, downloading when the local copy is missing or stale.
    ///
    /// `key` may be a project key (`datasets/a.txt`), a pinned key (`datasets/a.txt.v3`) or an
    /// `http(s)` URL.
    pub fn get_file(&self, key: &str, options: GetOptions) -> Result<ResolvedFile> {
        self.get_file_with_progress(key, options, &mut no_progress())
    }

    pub fn get_file_with_progress(
        &self,
        key: &str,
        options: GetOptions,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<ResolvedFile> {
        if let Some(url) = parse_http_url(key) {
            return self.get_url(&url, options, on_progress);
        }

        let project = self.project_folder();
        let key = normalize_key(key)?;
        let (base_key, pinned) = split_version(&key);

        let plain_path = resolve_local_path(&project, base_key, None)?;
        if plain_path.is_dir() {
            tracing::debug!(
                target = "replica.cache",
                key = base_key,
                path = %plain_path.display(),
                "serving materialized directory"
            );
            self.events.fire(FileEvent::Requested, base_key);
            return Ok(ResolvedFile {
                path: plain_path,
                key: base_key.to_string(),
                version: None,
                state: CacheState::LocalFresh,
                downloaded: false,
            });
        }

        let local = find_local_copy(&plain_path, pinned)?;

        let Some(store) = self.connected_store() else {
            let Some(local) = local else {
                return Err(CacheError::FileNotAvailable { key });
            };
            tracing::debug!(
                target = "replica.cache",
                key = base_key,
                version = local.version,
                "not connected; serving local copy"
            );
            return self.finish(
                base_key,
                &plain_path,
                local,
                CacheState::RemoteUnavailable,
                false,
                options,
            );
        };

        let remote = match store.metadata(base_key) {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                return match local {
                    Some(local) if !options.force_download => {
                        tracing::debug!(
                            target = "replica.cache",
                            key = base_key,
                            "key unknown to the remote store; serving local copy"
                        );
                        self.finish(
                            base_key,
                            &plain_path,
                            local,
                            CacheState::LocalFresh,
                            false,
                            options,
                        )
                    }
                    _ => Err(CacheError::RemoteKeyNotFound { key }),
                };
            }
            // Forced downloads degrade to the local copy too.
            Err(err) if err.is_connectivity() && local.is_some() => {
                tracing::warn!(
                    target = "replica.cache",
                    key = base_key,
                    error = %err,
                    force = options.force_download,
                    "remote store unreachable; serving local copy"
                );
                let Some(local) = local else {
                    return Err(err);
                };
                return self.finish(
                    base_key,
                    &plain_path,
                    local,
                    CacheState::RemoteUnavailable,
                    false,
                    options,
                );
            }
            Err(err) => return Err(err),
        };

        let target_version = pinned.unwrap_or(remote.version);
        let state = decide_state(local.as_ref(), &remote, target_version);
        tracing::debug!(
            target = "replica.cache",
            key = base_key,
            local_version = local.as_ref().map(|local| local.version),
            remote_version = remote.version,
            ?state,
            force = options.force_download,
            "resolved cache state"
        );

        let (copy, downloaded) = match (local, state) {
            (Some(local), CacheState::LocalFresh) if !options.force_download => (local, false),
            _ => {
                let destination = resolve_local_path(&project, base_key, Some(target_version))?;
                let size = self.transfer.download(
                    store,
                    base_key,
                    Some(target_version),
                    &destination,
                    on_progress,
                )?;
                let copy = LocalCopy {
                    path: destination,
                    version: target_version,
                    size,
                };
                (copy, true)
            }
        };

        self.finish(base_key, &plain_path, copy, state, downloaded, options)
    }

    fn finish(
        &self,
        base_key: &str,
        plain_path: &Path,
        copy: LocalCopy,
        state: CacheState,
        downloaded: bool,
        options: GetOptions,
    ) -> Result<ResolvedFile> {
        let resolved_key = if copy.path == plain_path {
            base_key.to_string()
        } else {
            versioned_name(base_key, copy.version)
        };
        self.events.fire(FileEvent::Requested, &resolved_key);

        let path = if options.unpack {
            unpack_beside(&copy.path, plain_path, downloaded)?
        } else {
            copy.path
        };
        Ok(ResolvedFile {
            path,
            key: resolved_key,
            version: Some(copy.version),
            state,
            downloaded,
        })
    }

    fn get_url(
        &self,
        url: &Url,
        options: GetOptions,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<ResolvedFile> {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CacheError::InvalidKey {
                key: crate::store::redact_url(url.as_str()),
                reason: "URL path has no file name",
            })?;
        let name = normalize_key(name)?;
        let destination = resolve_local_path(&self.project_folder(), &name, None)?;
        let existed = destination.is_file();

        let fetched = self.transfer.fetch_url(
            url.as_str(),
            &destination,
            options.force_download,
            on_progress,
        )?;
        let state = match (fetched.downloaded, existed) {
            (false, _) => CacheState::LocalFresh,
            (true, true) => CacheState::LocalStale,
            (true, false) => CacheState::LocalMissing,
        };
        self.events.fire(FileEvent::Requested, &name);

        let path = if options.unpack {
            unpack_beside(&fetched.path, &fetched.path, fetched.downloaded)?
        } else {
            fetched.path
        };
        Ok(ResolvedFile {
            path,
            key: name,
            version: None,
            state,
            downloaded: fetched.downloaded,
        })
    }

    /// Upload a file as `<data type>s/<file name>`. Directories are packed first (see
    /// [`CacheManager::upload_folder`]).
    pub fn upload_file(
        &self,
        local_path: &Path,
        data_type: DataType,
        options: &UploadOptions,
    ) -> Result<RemoteFileMetadata> {
        self.upload_file_with_progress(local_path, data_type, options, &mut no_progress())
    }

    pub fn upload_file_with_progress(
        &self,
        local_path: &Path,
        data_type: DataType,
        options: &UploadOptions,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<RemoteFileMetadata> {
        if stat(local_path)?.is_dir() {
            return self.upload_folder(local_path, data_type, options, &PackOptions::default());
        }
        let store = self.require_store()?;
        let file_name = match &options.file_name {
            Some(name) => name.clone(),
            None => file_name_of(local_path)?,
        };
        self.upload_as(store, local_path, data_type, &file_name, options, on_progress)
    }

    /// Pack `folder` into a temporary archive and upload it as `<name>.zip` (or the extension
    /// of `pack_options.format`). Files redirect to [`CacheManager::upload_file`].
    ///
    /// The temporary archive is removed whether or not the upload succeeds.
    pub fn upload_folder(
        &self,
        folder: &Path,
        data_type: DataType,
        options: &UploadOptions,
        pack_options: &PackOptions,
    ) -> Result<RemoteFileMetadata> {
        if !stat(folder)?.is_dir() {
            return self.upload_file(folder, data_type, options);
        }
        let store = self.require_store()?;

        let archive_name = match &options.file_name {
            Some(name) => name.clone(),
            None => file_name_of(folder)?,
        };
        let pack_options = PackOptions {
            archive_name: Some(archive_name),
            ..pack_options.clone()
        };
        let packed = pack(folder, &pack_options)?;
        let remote_name = file_name_of(packed.path())?;
        tracing::debug!(
            target = "replica.cache",
            folder = %folder.display(),
            archive = %packed.path().display(),
            entries = packed.entries(),
            "packed folder for upload"
        );

        self.upload_as(
            store,
            packed.path(),
            data_type,
            &remote_name,
            options,
            &mut no_progress(),
        )
    }

    fn upload_as(
        &self,
        store: &dyn RemoteStore,
        local_path: &Path,
        data_type: DataType,
        file_name: &str,
        options: &UploadOptions,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<RemoteFileMetadata> {
        let key = normalize_key(&format!("{}{file_name}", data_type.prefix()))?;
        let uploaded = self
            .transfer
            .upload(store, local_path, &key, &options.metadata, on_progress)?;
        self.seed_replica(local_path, &uploaded);
        self.events.fire(FileEvent::Uploaded, &uploaded.key);
        Ok(uploaded)
    }

    /// Place the bytes just uploaded at `<key>.v<N>` so the next `get_file` needs no download.
    ///
    /// The remote already holds the file, so a failure here is logged and not returned.
    fn seed_replica(&self, source: &Path, uploaded: &RemoteFileMetadata) {
        let project = self.project_folder();
        let paths = (|| -> Result<(PathBuf, PathBuf)> {
            Ok((
                resolve_local_path(&project, &uploaded.key, Some(uploaded.version))?,
                resolve_local_path(&project, &uploaded.key, None)?,
            ))
        })();
        let (versioned, plain) = match paths {
            Ok(paths) => paths,
            Err(err) => {
                tracing::warn!(
                    target = "replica.cache",
                    key = %uploaded.key,
                    error = %err,
                    "cannot place uploaded file in the local replica"
                );
                return;
            }
        };
        // A bare file already counts as version 1.
        if same_file(source, &versioned) || (uploaded.version == 1 && same_file(source, &plain)) {
            return;
        }

        let copied = atomic_write_with(&versioned, |out| {
            let mut file = fs::File::open(source)?;
            Ok(io::copy(&mut file, out)?)
        });
        match copied {
            Ok(bytes) => tracing::debug!(
                target = "replica.cache",
                key = %uploaded.key,
                version = uploaded.version,
                path = %versioned.display(),
                bytes,
                "placed uploaded file in the local replica"
            ),
            Err(err) => tracing::warn!(
                target = "replica.cache",
                key = %uploaded.key,
                path = %versioned.display(),
                error = %err,
                "failed to place uploaded file in the local replica"
            ),
        }
    }

    /// Latest metadata of remote files under `<data type>s/<prefix>`.
    pub fn list_remote_files(
        &self,
        data_type: Option<DataType>,
        prefix: &str,
    ) -> Result<Vec<RemoteFileMetadata>> {
        let store = self.require_store()?;
        let mut combined = data_type.map(DataType::prefix).unwrap_or_default();
        combined.push_str(prefix);
        store.list(&combined)
    }

    /// Delete `version` of `key` on the remote (a pinned `key.vN` counts as `version`), every
    /// version but the latest when `keep_latest_version` is set, or the whole key.
    pub fn delete_remote_file(
        &self,
        key: &str,
        version: Option<u64>,
        keep_latest_version: bool,
    ) -> Result<()> {
        let store = self.require_store()?;
        let key = normalize_key(key)?;
        let (base_key, pinned) = split_version(&key);
        store.delete(base_key, version.or(pinned), keep_latest_version)?;
        tracing::info!(
            target = "replica.cache",
            key = base_key,
            version = version.or(pinned),
            keep_latest_version,
            "deleted remote file"
        );
        Ok(())
    }

    /// Remove every local version of `key`. Returns how many files were removed.
    pub fn delete_local_file(&self, key: &str) -> Result<usize> {
        let key = normalize_key(key)?;
        let plain_path = resolve_local_path(&self.project_folder(), split_version(&key).0, None)?;
        let mut removed = 0;
        for copy in local_versions(&plain_path)? {
            if remove_file_best_effort(&copy.path, "delete_local_file") {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Evict large, stale files from the project folder.
    pub fn cleanup(&self, policy: &EvictionPolicy) -> Result<EvictionReport> {
        evict::cleanup(&self.project_folder(), policy)
    }
}

fn parse_http_url(key: &str) -> Option<Url> {
    let url = Url::parse(key).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn decide_state(
    local: Option<&LocalCopy>,
    remote: &RemoteFileMetadata,
    target_version: u64,
) -> CacheState {
    match local {
        None => CacheState::LocalMissing,
        Some(local) if target_version > local.version => CacheState::LocalStale,
        Some(local) if remote.version == local.version && remote.size != local.size => {
            CacheState::LocalStale
        }
        Some(_) => CacheState::LocalFresh,
    }
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(err) => Err(err.into()),
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| CacheError::NotFound {
            path: path.to_path_buf(),
        })
}

/// Every regular file next to `plain_path` that is a version of it.
fn local_versions(plain_path: &Path) -> Result<Vec<LocalCopy>> {
    let (Some(parent), Some(base_name)) = (plain_path.parent(), plain_path.file_name()) else {
        return Ok(Vec::new());
    };
    let base_name = base_name.to_string_lossy();

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut copies = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(version) = name.to_str().and_then(|name| is_version_of(name, &base_name)) else {
            continue;
        };
        let path = entry.path();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => copies.push(LocalCopy {
                path,
                version,
                size: meta.len(),
            }),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(copies)
}

/// Newest local version of `plain_path`, or exactly `pinned` when given.
///
/// A bare file and an explicit `.v1` both count as version 1; the explicit one wins.
fn find_local_copy(plain_path: &Path, pinned: Option<u64>) -> Result<Option<LocalCopy>> {
    Ok(local_versions(plain_path)?
        .into_iter()
        .filter(|copy| pinned.map_or(true, |pinned| copy.version == pinned))
        .max_by_key(|copy| (copy.version, copy.path != plain_path)))
}

/// Unpack `archive` into a sibling folder named after `plain_path` with its archive extension
/// removed. Non-archives are returned unchanged.
fn unpack_beside(archive: &Path, plain_path: &Path, replace_existing: bool) -> Result<PathBuf> {
    let Some(name) = plain_path.file_name().map(|name| name.to_string_lossy()) else {
        return Ok(archive.to_path_buf());
    };
    if !is_archive_name(&name) {
        return Ok(archive.to_path_buf());
    }
    let folder = plain_path.with_file_name(strip_archive_extension(&name));
    let unpacked = unpack(archive, &folder, replace_existing)?;
    tracing::debug!(
        target = "replica.cache",
        archive = %archive.display(),
        folder = %unpacked.display(),
        "unpacked archive"
    );
    Ok(unpacked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(version: u64, size: u64) -> RemoteFileMetadata {
        RemoteFileMetadata {
            key: "datasets/a.txt".to_string(),
            version,
            size,
            metadata: BTreeMap::new(),
        }
    }

    fn local(version: u64, size: u64) -> LocalCopy {
        LocalCopy {
            path: PathBuf::from("a.txt"),
            version,
            size,
        }
    }

    #[test]
    fn data_type_parsing() {
        assert_eq!("dataset".parse::<DataType>().unwrap(), DataType::Dataset);
        assert_eq!(" Model ".parse::<DataType>().unwrap(), DataType::Model);
        assert_eq!(DataType::Model.prefix(), "models/");
        let err = "notebook".parse::<DataType>().unwrap_err();
        assert!(matches!(err, CacheError::InvalidDataType { ref value } if value == "notebook"));
    }

    #[test]
    fn staleness_rules() {
        assert_eq!(decide_state(None, &remote(1, 10), 1), CacheState::LocalMissing);
        assert_eq!(
            decide_state(Some(&local(1, 10)), &remote(2, 10), 2),
            CacheState::LocalStale
        );
        assert_eq!(
            decide_state(Some(&local(2, 10)), &remote(2, 11), 2),
            CacheState::LocalStale
        );
        assert_eq!(
            decide_state(Some(&local(2, 10)), &remote(2, 10), 2),
            CacheState::LocalFresh
        );
        // A local copy newer than the remote (e.g. after a remote delete) is kept.
        assert_eq!(
            decide_state(Some(&local(3, 10)), &remote(2, 99), 2),
            CacheState::LocalFresh
        );
        // Pinned to an old version: only that version matters.
        assert_eq!(
            decide_state(Some(&local(1, 10)), &remote(4, 99), 1),
            CacheState::LocalFresh
        );
    }

    #[test]
    fn url_detection() {
        assert!(parse_http_url("https://example.com/data/file.csv").is_some());
        assert!(parse_http_url("http://localhost:8080/x.zip").is_some());
        assert!(parse_http_url("datasets/a.txt").is_none());
        assert!(parse_http_url("s3://bucket/key").is_none());
        assert!(parse_http_url("C:/data/a.txt").is_none());
    }

    #[test]
    fn local_scan_ignores_temp_files_and_tombstones() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("datasets");
        fs::create_dir_all(&dir).unwrap();
        for name in [
            "a.txt",
            "a.txt.v3",
            "a.txt.v9.removed.txt",
            "a.txt.v12.tmp.1.0",
            "a.txt.bak",
            "b.txt.v20",
        ] {
            fs::write(dir.join(name), name).unwrap();
        }

        let plain = dir.join("a.txt");
        let newest = find_local_copy(&plain, None).unwrap().unwrap();
        assert_eq!((newest.version, newest.path.clone()), (3, dir.join("a.txt.v3")));

        let pinned = find_local_copy(&plain, Some(1)).unwrap().unwrap();
        assert_eq!(pinned.path, plain);
        assert!(find_local_copy(&plain, Some(2)).unwrap().is_none());
        assert!(find_local_copy(&dir.join("c.txt"), None).unwrap().is_none());
    }
}
