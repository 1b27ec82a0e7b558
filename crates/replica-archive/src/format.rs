use crate::error::{ArchiveError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const ZIP_MAGIC: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_BLOCK: usize = 512;

/// Extensions recognized by [`is_archive_name`], longest first so that
/// `.tar.gz` wins over `.gz`.
const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tar.zst", ".tgz", ".tbz2", ".tbz", ".tzst", ".zip", ".tar",
];

/// Container + compression combination of an archive on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarZst,
}

impl ArchiveFormat {
    /// Sniff the format of `path` from its leading bytes. The file extension is ignored.
    pub fn detect(path: &Path) -> Result<Self> {
        let mut header = Vec::with_capacity(TAR_BLOCK);
        File::open(path)?
            .take(TAR_BLOCK as u64)
            .read_to_end(&mut header)?;
        Self::from_magic(&header).ok_or_else(|| ArchiveError::UnsupportedFormat {
            path: path.to_path_buf(),
        })
    }

    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if ZIP_MAGIC.iter().any(|magic| header.starts_with(magic)) {
            return Some(Self::Zip);
        }
        if header.starts_with(GZIP_MAGIC) {
            return Some(Self::TarGz);
        }
        if header.starts_with(BZIP2_MAGIC) {
            return Some(Self::TarBz2);
        }
        if header.starts_with(ZSTD_MAGIC) {
            return Some(Self::TarZst);
        }
        let tar_magic = header.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len());
        if tar_magic == Some(TAR_MAGIC) {
            return Some(Self::Tar);
        }
        // A tar without members is just the zero-filled end-of-archive marker.
        if header.len() >= TAR_BLOCK && header[..TAR_BLOCK].iter().all(|&b| b == 0) {
            return Some(Self::Tar);
        }
        None
    }

    /// File extension (without the leading dot) used when packing.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarZst => "tar.zst",
        }
    }
}

/// Returns `true` when `name` ends with one of the archive extensions we can unpack.
pub fn is_archive_name(name: &str) -> bool {
    archive_extension(name).is_some()
}

/// Removes a trailing archive extension from `name`, if any.
///
/// `data.tar.gz` -> `data`, `model.zip` -> `model`, `notes.txt` -> `notes.txt`.
pub fn strip_archive_extension(name: &str) -> &str {
    match archive_extension(name) {
        Some(ext) => &name[..name.len() - ext.len()],
        None => name,
    }
}

fn archive_extension(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS
        .iter()
        .copied()
        .find(|ext| lower.len() > ext.len() && lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_formats_from_magic_bytes() {
        assert_eq!(
            ArchiveFormat::from_magic(b"PK\x03\x04rest"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_magic(b"PK\x05\x06"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_magic(&[0x1f, 0x8b, 0x08]),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_magic(b"BZh91AY"),
            Some(ArchiveFormat::TarBz2)
        );
        assert_eq!(
            ArchiveFormat::from_magic(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]),
            Some(ArchiveFormat::TarZst)
        );

        let mut tar_header = vec![0_u8; 512];
        tar_header[257..262].copy_from_slice(b"ustar");
        assert_eq!(ArchiveFormat::from_magic(&tar_header), Some(ArchiveFormat::Tar));

        assert_eq!(
            ArchiveFormat::from_magic(&[0_u8; 1024]),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(ArchiveFormat::from_magic(&[0_u8; 100]), None);

        assert_eq!(ArchiveFormat::from_magic(b"hello world"), None);
        assert_eq!(ArchiveFormat::from_magic(b""), None);
    }

    #[test]
    fn archive_extension_helpers() {
        assert!(is_archive_name("model.zip"));
        assert!(is_archive_name("data.TAR.GZ"));
        assert!(is_archive_name("data.tgz"));
        assert!(!is_archive_name("notes.txt"));
        assert!(!is_archive_name(".zip"));

        assert_eq!(strip_archive_extension("data.tar.gz"), "data");
        assert_eq!(strip_archive_extension("data.tar.bz2"), "data");
        assert_eq!(strip_archive_extension("model.zip"), "model");
        assert_eq!(strip_archive_extension("notes.txt"), "notes.txt");
    }
}
