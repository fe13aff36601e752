//! Byte sources feeding the archive engine
//!
//! The engine pulls its input through three callbacks: `read` hands out the
//! next block, `skip` advances without reading, `seek` jumps to an absolute
//! offset. [`StreamSource`] implements them on top of any [`VStream`].
//! Formats with a trailing directory (zip) also ask for the total size.

use crate::error::Result;
use crate::vfs::VStream;
use tracing::trace;

/// Pull-style input of an archive
pub trait ArchiveSource {
    /// Next block of bytes; empty at end of data
    fn read(&mut self) -> Result<&[u8]>;

    /// Advance by up to `count` bytes. Returns the bytes actually skipped;
    /// the engine reads through whatever is left.
    fn skip(&mut self, count: u64) -> Result<u64>;

    /// Move to the absolute `offset`; returns the new absolute position
    fn seek(&mut self, offset: u64) -> Result<u64>;

    /// Total length when the source knows it
    fn size(&self) -> Option<u64> {
        None
    }
}

/// Archive input over a borrowed stream
///
/// Closing the archive does not close the stream; ownership stays with the
/// caller, who gets it back through [`into_inner`](Self::into_inner).
pub struct StreamSource<'a> {
    stream: &'a mut dyn VStream,
    scratch: Vec<u8>,
}

impl<'a> StreamSource<'a> {
    pub fn new(stream: &'a mut dyn VStream, scratch_size: usize) -> Self {
        Self {
            stream,
            scratch: vec![0u8; scratch_size.max(512)],
        }
    }

    pub fn stream(&self) -> &dyn VStream {
        &*self.stream
    }

    pub fn into_inner(self) -> &'a mut dyn VStream {
        self.stream
    }
}

impl ArchiveSource for StreamSource<'_> {
    fn read(&mut self) -> Result<&[u8]> {
        let n = self.stream.read(&mut self.scratch)?;
        Ok(&self.scratch[..n])
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        if count == 0 || !self.stream.is_random_access() {
            return Ok(0);
        }
        let start = self.stream.position();
        let mut target = start.saturating_add(count);
        let size = self.stream.size();
        if size > 0 {
            target = target.min(size);
        }
        self.stream.seek(target)?;
        let skipped = self.stream.position() - start;
        trace!(skipped, "source skip");
        Ok(skipped)
    }

    fn seek(&mut self, offset: u64) -> Result<u64> {
        self.stream.seek(offset)?;
        Ok(self.stream.position())
    }

    fn size(&self) -> Option<u64> {
        let size = self.stream.size();
        (size > 0).then_some(size)
    }
}

/// Archive input over bytes already in memory
pub struct SliceSource<'a> {
    data: &'a [u8],
    position: usize,
    block: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_block(data, 4096)
    }

    /// Hand out at most `block` bytes per read
    pub fn with_block(data: &'a [u8], block: usize) -> Self {
        Self {
            data,
            position: 0,
            block: block.max(1),
        }
    }
}

impl ArchiveSource for SliceSource<'_> {
    fn read(&mut self) -> Result<&[u8]> {
        let end = (self.position + self.block).min(self.data.len());
        let chunk = &self.data[self.position..end];
        self.position = end;
        Ok(chunk)
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        let left = (self.data.len() - self.position) as u64;
        let n = count.min(left);
        self.position += n as usize;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<u64> {
        self.position = offset.min(self.data.len() as u64) as usize;
        Ok(self.position as u64)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
