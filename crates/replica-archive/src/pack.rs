use crate::error::{ArchiveError, Result};
use crate::format::ArchiveFormat;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Knobs for [`pack`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackOptions {
    /// Archive file name without extension. Defaults to the folder's name.
    pub archive_name: Option<String>,
    /// Files strictly larger than this many megabytes are left out.
    pub max_file_size_mb: Option<f64>,
    /// Folder names (exact match, any depth) whose contents are left out.
    pub excluded_folder_names: BTreeSet<String>,
    pub format: ArchiveFormat,
}

impl PackOptions {
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.excluded_folder_names.insert(name.into());
        self
    }

    pub fn max_file_size_mb(mut self, mb: f64) -> Self {
        self.max_file_size_mb = Some(mb);
        self
    }

    pub fn format(mut self, format: ArchiveFormat) -> Self {
        self.format = format;
        self
    }
}

/// An archive living in its own temporary directory.
///
/// The directory (and the archive in it) is removed when this value is dropped.
#[derive(Debug)]
pub struct PackedArchive {
    dir: TempDir,
    path: PathBuf,
    format: ArchiveFormat,
    entries: usize,
}

impl PackedArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Number of members (files and directories) written into the archive.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn temp_dir(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Debug)]
enum Member {
    Dir(String),
    File { name: String, disk_path: PathBuf },
}

/// Package every file under `folder` into a fresh temporary archive.
///
/// Member names are relative to `folder`; the folder itself is not nested in the archive.
pub fn pack(folder: &Path, options: &PackOptions) -> Result<PackedArchive> {
    if !folder.is_dir() {
        return Err(ArchiveError::NotADirectory {
            path: folder.to_path_buf(),
        });
    }

    let members = collect_members(folder, options)?;

    let base_name = match &options.archive_name {
        Some(name) => name.clone(),
        None => folder
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string()),
    };
    let extension = options.format.extension();
    let file_name = if base_name.ends_with(&format!(".{extension}")) {
        base_name
    } else {
        format!("{base_name}.{extension}")
    };

    let dir = tempfile::Builder::new().prefix("replica-pack-").tempdir()?;
    let path = dir.path().join(file_name);
    let out = File::create(&path)?;

    match options.format {
        ArchiveFormat::Zip => write_zip(out, &members)?,
        ArchiveFormat::Tar => {
            write_tar(out, &members)?.flush()?;
        }
        ArchiveFormat::TarGz => {
            let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            write_tar(encoder, &members)?.finish()?;
        }
        ArchiveFormat::TarBz2 => {
            let encoder = bzip2::write::BzEncoder::new(out, bzip2::Compression::default());
            write_tar(encoder, &members)?.finish()?;
        }
        ArchiveFormat::TarZst => {
            let encoder = zstd::Encoder::new(out, 0)?;
            write_tar(encoder, &members)?.finish()?;
        }
    }

    tracing::debug!(
        target = "replica.archive",
        folder = %folder.display(),
        archive = %path.display(),
        entries = members.len(),
        "packed folder"
    );

    Ok(PackedArchive {
        dir,
        path,
        format: options.format,
        entries: members.len(),
    })
}

fn collect_members(folder: &Path, options: &PackOptions) -> Result<Vec<Member>> {
    let max_bytes = options
        .max_file_size_mb
        .map(|mb| (mb * BYTES_PER_MB).max(0.0) as u64);
    let excluded = &options.excluded_folder_names;

    let walker = walkdir::WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !is_excluded(entry.file_name(), excluded)
        });

    let mut members = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(folder)
            .map_err(|_| ArchiveError::InvalidEntryPath {
                path: entry.path().to_path_buf(),
            })?;
        let name = rel.to_string_lossy().replace('\\', "/");

        let ty = entry.file_type();
        if ty.is_dir() {
            members.push(Member::Dir(name));
            continue;
        }
        if !ty.is_file() {
            tracing::debug!(
                target = "replica.archive",
                path = %entry.path().display(),
                "skipping non-regular file while packing"
            );
            continue;
        }

        if let Some(max_bytes) = max_bytes {
            let len = entry.metadata()?.len();
            if len > max_bytes {
                tracing::debug!(
                    target = "replica.archive",
                    path = %entry.path().display(),
                    size_bytes = len,
                    max_bytes,
                    "skipping file above archive size cap"
                );
                continue;
            }
        }

        members.push(Member::File {
            name,
            disk_path: entry.path().to_path_buf(),
        });
    }
    Ok(members)
}

fn is_excluded(name: &OsStr, excluded: &BTreeSet<String>) -> bool {
    name.to_str().is_some_and(|name| excluded.contains(name))
}

fn write_zip(out: File, members: &[Member]) -> Result<()> {
    let mut zip = zip::ZipWriter::new(out);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    for member in members {
        match member {
            Member::Dir(name) => zip.add_directory(format!("{name}/"), options)?,
            Member::File { name, disk_path } => {
                zip.start_file(name.as_str(), options)?;
                let mut file = File::open(disk_path)?;
                io::copy(&mut file, &mut zip)?;
            }
        }
    }

    zip.finish()?;
    Ok(())
}

fn write_tar<W: Write>(out: W, members: &[Member]) -> Result<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    for member in members {
        match member {
            Member::Dir(name) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder.append_data(&mut header, format!("{name}/"), io::empty())?;
            }
            Member::File { name, disk_path } => {
                builder.append_path_with_name(disk_path, name)?;
            }
        }
    }
    Ok(builder.into_inner()?)
}
