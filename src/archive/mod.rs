//! Archive streaming
//!
//! Containers are read forward through the [`ArchiveSource`] callbacks,
//! one entry at a time, and selected entries are extracted into a
//! [`CachedBuffer`](crate::cache::CachedBuffer). Tar may be wrapped in
//! zstd, LZ4, gzip, bzip2 or xz; zip is read through its central directory.
//! The `.rpk` packed format can also be written.

mod container;
mod format;
mod fs;
mod reader;
mod source;
pub mod tar;
mod writer;

pub use container::ArchiveContainer;
pub use format::{
    CompressionMethod, EntryInfo, FileHeader, LocalEntryHeader, CD_ENTRY_SIZE,
    FORMAT_VERSION_MAJOR, FORMAT_VERSION_MINOR, HEADER_SIZE, LOCAL_ENTRY_SIGNATURE, MAGIC_NUMBER,
    MAX_PATH_LENGTH,
};
pub use fs::{split_container, ArchiveFile, ArchiveFilesystem, ArchiveSession, ArchiveStream};
pub use reader::{ArchiveEntry, ArchiveFormat, ArchiveReader, EntryKind, EntryReader, Filter};
pub use source::{ArchiveSource, SliceSource, StreamSource};
pub use writer::ArchiveWriter;

/// Names served by [`ArchiveFilesystem`]
///
/// Formats without a decoder are still claimed so that opening them reports
/// an unsupported format rather than handing out the raw container.
pub const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar", ".tar.zst", ".tzst", ".tar.lz4", ".rpk", ".zst", ".lz4", ".zip", ".7z", ".rar",
    ".iso", ".gz", ".tgz", ".bz2", ".tbz2", ".xz", ".txz", ".lha", ".lzh", ".cab",
];
