//! Virtual files and streams
//!
//! Every backend supplies a [`VFile`] implementation for metadata and
//! directory navigation and a [`VStream`] implementation for byte access.
//! Callers go through [`Vfs::get_file`] and never name a backend type.

mod registry;
mod stream;

pub use registry::{by_extension, Filesystem, FilesystemRegistry, Vfs, VfsBuilder};
pub use stream::{emulate_seek, BufferStream, DirCursor, SequentialSource, StreamCore, StreamReader};

use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use std::io::SeekFrom;
use std::ops::BitOr;
use std::time::SystemTime;

/// How a stream is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OpenMode(u8);

impl OpenMode {
    /// Read
    pub const IN: OpenMode = OpenMode(0b0001);
    /// Write, creating the target
    pub const OUT: OpenMode = OpenMode(0b0010);
    /// Discard existing content
    pub const TRUNC: OpenMode = OpenMode(0b0100);
    /// Write at the end
    pub const APP: OpenMode = OpenMode(0b1000);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_read(self) -> bool {
        self.contains(Self::IN)
    }

    pub fn is_write(self) -> bool {
        self.contains(Self::OUT) || self.contains(Self::APP)
    }

    pub fn is_append(self) -> bool {
        self.contains(Self::APP)
    }

    pub fn is_truncate(self) -> bool {
        self.contains(Self::TRUNC)
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// An open byte channel on a file
///
/// `read` and `write` advance the position by exactly the bytes transferred.
/// Failures are returned and also recorded as the stream's [`error`](VStream::error).
pub trait VStream: Send {
    fn url(&self) -> &Url;

    fn open(&mut self, mode: OpenMode) -> Result<()>;

    /// Flush and release the backend handle; idempotent
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Move to an absolute position
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Total size, 0 when unknown
    fn size(&self) -> u64;

    fn position(&self) -> u64;

    /// Last recorded error code
    fn error(&self) -> Errno;

    /// True when `seek` does not need to re-read data
    fn is_random_access(&self) -> bool {
        false
    }

    /// Bytes between position and end, when the size is known
    fn available(&self) -> u64 {
        self.size().saturating_sub(self.position())
    }

    /// Seek with a whence; returns the new absolute position
    fn seek_from(&mut self, from: SeekFrom) -> Result<u64> {
        let target = match from {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::Current(delta) => self.position().checked_add_signed(delta),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| RelayError::errno(Errno::EINVAL, "seek before start"))?;
        self.seek(target)?;
        Ok(self.position())
    }
}

/// A URL-addressed resource
///
/// Files are cheap to construct and hold no native handles of their own;
/// streams do. Directory iteration is forward-only: `rewind_directory`
/// restarts it and `next_in_dir` returns `None` once entries run out.
pub trait VFile: Send {
    fn url(&self) -> &Url;

    /// Decoded last path segment
    fn name(&self) -> String {
        let base = self.url().basename();
        urlencoding::decode(base)
            .map(|name| name.into_owned())
            .unwrap_or_else(|_| base.to_string())
    }

    fn exists(&mut self) -> bool;

    fn is_directory(&mut self) -> bool;

    /// Size in bytes, 0 for directories and unknown sizes
    fn size(&mut self) -> u64;

    fn last_write(&mut self) -> Option<SystemTime> {
        None
    }

    fn creation_time(&mut self) -> Option<SystemTime> {
        None
    }

    fn mkdir(&mut self) -> Result<()> {
        Err(RelayError::errno(Errno::ENOSYS, format!("mkdir {}", self.url())))
    }

    fn remove(&mut self) -> Result<()> {
        Err(RelayError::errno(Errno::ENOSYS, format!("remove {}", self.url())))
    }

    fn rename(&mut self, dest: &str) -> Result<()> {
        Err(RelayError::errno(
            Errno::ENOSYS,
            format!("rename {} to {}", self.url(), dest),
        ))
    }

    fn rewind_directory(&mut self) -> Result<()> {
        Err(RelayError::errno(Errno::ENOTDIR, self.url().to_string()))
    }

    fn next_in_dir(&mut self) -> Option<Box<dyn VFile>> {
        None
    }

    /// An already opened stream on this file
    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>>;
}

/// Upper bound on what [`read_all`] reserves ahead of reading
const READ_ALL_RESERVE: u64 = 64 * 1024;

/// Read a whole stream into memory
pub fn read_all(stream: &mut dyn VStream) -> Result<Vec<u8>> {
    // Sizes can come from the remote end; grow past this as data arrives
    let reserve = stream.available().min(READ_ALL_RESERVE);
    let mut out = Vec::with_capacity(reserve as usize);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Write all of `data`, failing on a zero-length write
pub fn write_all(stream: &mut dyn VStream, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = stream.write(data)?;
        if n == 0 {
            return Err(RelayError::errno(Errno::ENOSPC, format!("write {}", stream.url())));
        }
        data = &data[n..];
    }
    Ok(())
}
