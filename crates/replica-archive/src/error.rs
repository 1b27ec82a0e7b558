use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors produced while packing or unpacking archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{path} is not a zip or (gzip/bzip2/zstd compressed) tar archive")]
    UnsupportedFormat { path: PathBuf },

    #[error("invalid archive entry path: {path:?}")]
    InvalidEntryPath { path: PathBuf },
}
