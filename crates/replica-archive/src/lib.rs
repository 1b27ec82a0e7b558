//! Folder packaging for transfer.
//!
//! [`pack`] turns a directory tree into a single archive inside a scoped temporary directory
//! (size cap and excluded folder names applied), and [`unpack`] restores an archive into a
//! directory. Supported containers are zip and tar; tar may be gzip, bzip2 or zstd compressed.
//! The format of an existing archive is always sniffed from its magic bytes.

mod error;
mod format;
mod pack;
mod unpack;

pub use error::{ArchiveError, Result};
pub use format::{is_archive_name, strip_archive_extension, ArchiveFormat};
pub use pack::{pack, PackOptions, PackedArchive};
pub use unpack::unpack;
