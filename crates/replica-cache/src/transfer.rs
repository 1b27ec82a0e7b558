//! Chunked, progress-reporting transfers between the remote store and local files.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{CacheError, Result};
use crate::store::{
    content_length, describe_ureq_error, redact_url, RemoteFileMetadata, RemoteStore,
};
use crate::util::atomic_write_with;

/// Progress callback: `(bytes_so_far, total_bytes)`. `total_bytes` is `None` when the other
/// side did not announce a length.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + 'a;

/// A progress callback that ignores every update.
pub fn no_progress() -> impl FnMut(u64, Option<u64>) {
    |_, _| {}
}

/// Result of [`TransferEngine::fetch_url`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlFetch {
    pub path: PathBuf,
    pub size: u64,
    /// `false` when an existing file of the same size was reused.
    pub downloaded: bool,
}

/// Stateless transport between the remote store and the local filesystem.
///
/// Downloads are streamed into a temporary sibling of the destination and renamed into place
/// once complete, so an interrupted transfer never leaves a truncated file under the final
/// name.
#[derive(Clone, Debug)]
pub struct TransferEngine {
    chunk_size: usize,
    agent: ureq::Agent,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl TransferEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            agent: ureq::Agent::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream `key` at `version` (latest when `None`) from `store` into `destination`.
    ///
    /// Returns the number of bytes written.
    pub fn download(
        &self,
        store: &dyn RemoteStore,
        key: &str,
        version: Option<u64>,
        destination: &Path,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<u64> {
        let download = store.download(key, version)?;
        let total = download.size;
        let mut reader = download.reader;

        let written = atomic_write_with(destination, |file| {
            self.copy_chunks(&mut reader, file, total, key, on_progress)
        })?;

        tracing::info!(
            target = "replica.cache",
            key,
            version,
            path = %destination.display(),
            bytes = written,
            "downloaded file"
        );
        Ok(written)
    }

    /// Stream `local_path` to `store` under `remote_key`.
    pub fn upload(
        &self,
        store: &dyn RemoteStore,
        local_path: &Path,
        remote_key: &str,
        metadata: &BTreeMap<String, String>,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<RemoteFileMetadata> {
        let file_meta = match std::fs::metadata(local_path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                return Err(CacheError::NotFound {
                    path: local_path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound {
                    path: local_path.to_path_buf(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let size = file_meta.len();

        let mut reader = ProgressReader {
            inner: File::open(local_path)?,
            chunk_size: self.chunk_size,
            done: 0,
            total: Some(size),
            on_progress,
        };

        let uploaded = store
            .upload(remote_key, &mut reader, size, metadata)
            .map_err(|err| match err {
                CacheError::Io(_) | CacheError::Transfer { .. } | CacheError::Json { .. } => {
                    CacheError::Upload {
                        key: remote_key.to_string(),
                        message: err.to_string(),
                    }
                }
                other => other,
            })?;

        tracing::info!(
            target = "replica.cache",
            key = %uploaded.key,
            version = uploaded.version,
            path = %local_path.display(),
            bytes = size,
            "uploaded file"
        );
        Ok(uploaded)
    }

    /// Download a plain HTTP(S) URL into `destination`, bypassing versioning.
    ///
    /// An existing `destination` whose size equals the announced `Content-Length` is reused
    /// unless `force` is set. The length is asked for with a `HEAD` request first, so a reuse
    /// never opens the body; servers that refuse `HEAD` get the check on the `GET` response.
    pub fn fetch_url(
        &self,
        url: &str,
        destination: &Path,
        force: bool,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<UrlFetch> {
        let safe_url = redact_url(url);
        let existing = match std::fs::metadata(destination) {
            Ok(meta) if meta.is_file() && !force => Some(meta.len()),
            _ => None,
        };

        if let Some(existing) = existing {
            match self.agent.head(url).call() {
                Ok(response) if content_length(&response) == Some(existing) => {
                    return Ok(reused(&safe_url, destination, existing));
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(
                    target = "replica.cache",
                    url = %safe_url,
                    error = %describe_ureq_error(&err),
                    "HEAD request failed; falling back to GET"
                ),
            }
        }

        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| CacheError::Transfer {
                target: safe_url.clone(),
                message: describe_ureq_error(&err),
            })?;
        let total = content_length(&response);
        if let (Some(existing), Some(total)) = (existing, total) {
            if existing == total {
                return Ok(reused(&safe_url, destination, existing));
            }
        }

        let mut reader = response.into_reader();
        let size = atomic_write_with(destination, |file| {
            self.copy_chunks(&mut reader, file, total, &safe_url, on_progress)
        })?;

        tracing::info!(
            target = "replica.cache",
            url = %safe_url,
            path = %destination.display(),
            bytes = size,
            "downloaded url"
        );
        Ok(UrlFetch {
            path: destination.to_path_buf(),
            size,
            downloaded: true,
        })
    }

    fn copy_chunks(
        &self,
        reader: &mut dyn Read,
        writer: &mut File,
        total: Option<u64>,
        target: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<u64> {
        let mut buf = vec![0_u8; self.chunk_size];
        let mut done = 0_u64;
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(CacheError::Transfer {
                        target: target.to_string(),
                        message: format!("stream failed after {done} bytes: {err}"),
                    })
                }
            };
            writer.write_all(&buf[..read])?;
            done += read as u64;
            on_progress(done, total);
        }

        if let Some(total) = total {
            if done != total {
                return Err(CacheError::Transfer {
                    target: target.to_string(),
                    message: format!("stream ended after {done} of {total} bytes"),
                });
            }
        }
        Ok(done)
    }
}

fn reused(safe_url: &str, destination: &Path, size: u64) -> UrlFetch {
    tracing::debug!(
        target = "replica.cache",
        url = %safe_url,
        path = %destination.display(),
        "reusing previously downloaded url"
    );
    UrlFetch {
        path: destination.to_path_buf(),
        size,
        downloaded: false,
    }
}

/// Caps each read at `chunk_size` and reports progress after every chunk.
struct ProgressReader<'p, 'f, R> {
    inner: R,
    chunk_size: usize,
    done: u64,
    total: Option<u64>,
    on_progress: &'p mut ProgressFn<'f>,
}

impl<R: Read> Read for ProgressReader<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = buf.len().min(self.chunk_size);
        let read = self.inner.read(&mut buf[..max])?;
        if read > 0 {
            self.done += read as u64;
            (self.on_progress)(self.done, self.total);
        }
        Ok(read)
    }
}
