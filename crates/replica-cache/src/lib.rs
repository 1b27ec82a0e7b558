//! Local on-disk replica of a remote, versioned file store.
//!
//! [`CacheManager`] answers "give me the latest version of key X" from the local replica when it
//! can, and streams the file from the [`RemoteStore`] when the local copy is missing or stale.
//! Folders are packed into archives before upload (see `replica-archive`), and large files that
//! have not been used for a while can be evicted with [`cleanup`].
//!
//! ## On-disk layout
//!
//! A project's replica lives under `<root_folder>/<project>/`:
//! - `<data type>s/<file name>`: a file written locally (implicitly version 1)
//! - `<data type>s/<file name>.v<N>`: version `N` as downloaded from the remote
//! - `<data type>s/<archive stem>/`: an unpacked archive, served as is
//! - `<file>.removed.txt`: tombstone left by eviction
//!
//! The file names are the only index; there is no manifest to keep in sync.

mod config;
mod error;
mod events;
mod evict;
mod key;
mod manager;
mod store;
mod transfer;
mod util;

pub use config::{CacheConfig, HttpRemoteConfig, DEFAULT_CHUNK_SIZE, DEFAULT_PROJECT};
pub use error::{CacheError, Result};
pub use events::{EventBus, EventCallback, FileEvent};
pub use evict::{
    cleanup, cleanup_at, tombstone_path, EvictionCandidate, EvictionFailure, EvictionPolicy,
    EvictionReport, TOMBSTONE_SUFFIX,
};
pub use key::{
    extract_version, is_version_of, normalize_key, resolve_local_path, split_version,
    strip_version, versioned_name,
};
pub use manager::{CacheManager, CacheState, DataType, GetOptions, ResolvedFile, UploadOptions};
pub use replica_archive::{ArchiveFormat, PackOptions};
pub use store::{
    DirRemoteStore, HttpRemoteStore, RemoteDownload, RemoteFileMetadata, RemoteStore,
    METADATA_HEADER_PREFIX,
};
pub use transfer::{no_progress, ProgressFn, TransferEngine, UrlFetch};
