use crate::error::{ArchiveError, Result};
use crate::format::ArchiveFormat;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;

/// Unpack `archive` into `destination` and return `destination`.
///
/// When `destination` already exists and is non-empty it is treated as "already unpacked" and
/// returned untouched, unless `remove_existing` is set, in which case it is replaced.
///
/// Extraction goes to a sibling staging directory first, so a failed unpack leaves any
/// previous contents of `destination` in place.
pub fn unpack(archive: &Path, destination: &Path, remove_existing: bool) -> Result<PathBuf> {
    let existing = fs::symlink_metadata(destination).ok();
    if let Some(meta) = &existing {
        if meta.is_dir() {
            if !remove_existing && !is_empty_dir(destination)? {
                tracing::debug!(
                    target = "replica.archive",
                    destination = %destination.display(),
                    "destination already unpacked; keeping existing contents"
                );
                return Ok(destination.to_path_buf());
            }
        } else if !remove_existing {
            return Err(ArchiveError::NotADirectory {
                path: destination.to_path_buf(),
            });
        }
    }

    let format = ArchiveFormat::detect(archive)?;

    let parent = destination.parent().unwrap_or(Path::new("."));
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".replica-unpack-")
        .tempdir_in(parent)?;

    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Zip => extract_zip(archive, staging.path())?,
        ArchiveFormat::Tar => extract_tar(file, staging.path())?,
        ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(file), staging.path())?,
        ArchiveFormat::TarBz2 => extract_tar(bzip2::read::BzDecoder::new(file), staging.path())?,
        ArchiveFormat::TarZst => extract_tar(zstd::Decoder::new(file)?, staging.path())?,
    }

    // `tempfile` creates the staging directory owner-only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staging.path(), fs::Permissions::from_mode(0o755))?;
    }

    if let Some(meta) = existing {
        if meta.is_dir() {
            fs::remove_dir_all(destination)?;
        } else {
            fs::remove_file(destination)?;
        }
    }
    fs::rename(staging.path(), destination)?;
    // `staging` now points at a path that no longer exists; dropping it is a no-op.
    drop(staging);

    tracing::debug!(
        target = "replica.archive",
        archive = %archive.display(),
        destination = %destination.display(),
        ?format,
        "unpacked archive"
    );
    Ok(destination.to_path_buf())
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        let rel = PathBuf::from(entry.name());
        validate_entry_path(&rel)?;
        let out_path = dest.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn extract_tar(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        validate_entry_path(&rel)?;
        let out_path = dest.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out_path)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&out_path)?;
                io::copy(&mut entry, &mut out)?;
            }
            other => {
                tracing::debug!(
                    target = "replica.archive",
                    path = %rel.display(),
                    entry_type = ?other,
                    "skipping unsupported tar entry"
                );
            }
        }
    }
    Ok(())
}

/// Archive members must stay inside the destination: no absolute paths, no `..`.
pub(crate) fn validate_entry_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ArchiveError::InvalidEntryPath {
            path: path.to_path_buf(),
        });
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ArchiveError::InvalidEntryPath {
                    path: path.to_path_buf(),
                })
            }
        }
    }
    Ok(())
}
