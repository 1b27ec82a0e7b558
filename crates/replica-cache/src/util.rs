use crate::error::CacheError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "replica.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove file"
            );
            false
        }
    }
}

/// Write `path` by streaming into a unique sibling temp file and renaming it into place.
///
/// Readers never observe a partially written `path`: on failure the temp file is removed and
/// any previous contents of `path` are left alone.
pub(crate) fn atomic_write_with<T>(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<T, CacheError>,
) -> Result<T, CacheError> {
    let parent = parent_or_cwd(path)?;
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<T, CacheError> {
        let value = write(&mut file)?;
        file.sync_all()?;
        Ok(value)
    })();
    drop(file);

    let value = match write_result {
        Ok(value) => value,
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write_with.write_failed");
            return Err(err);
        }
    };

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write_with.rename_failed");
        return Err(err.into());
    }
    sync_dir_best_effort(parent);
    Ok(value)
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // On Windows, `rename` doesn't overwrite.
        Err(err)
            if cfg!(windows) && (err.kind() == io::ErrorKind::AlreadyExists || to.exists()) =>
        {
            match fs::remove_file(to) {
                Ok(()) => {}
                Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                Err(remove_err) => return Err(remove_err),
            }
            fs::rename(from, to)
        }
        Err(err) => Err(err),
    }
}

fn parent_or_cwd(path: &Path) -> Result<&Path, CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    Ok(if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    })
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static SYNC_DIR_ERROR_LOGGED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "replica.cache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

/// `true` if `name` has the exact `<name>.tmp.<pid>.<counter>` shape that
/// [`atomic_write_with`] gives its temp files.
pub(crate) fn is_temp_file_name(name: &str) -> bool {
    let mut parts = name.rsplitn(3, '.');
    let (Some(counter), Some(pid), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let is_number = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    is_number(counter)
        && is_number(pid)
        && rest
            .strip_suffix(".tmp")
            .is_some_and(|stem| !stem.is_empty())
}
