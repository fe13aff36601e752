use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use crate::vfs::{OpenMode, VStream};
use std::io::{self, Read, Seek, SeekFrom};
use tracing::trace;

/// Position, size, mode and error bookkeeping shared by stream implementations
#[derive(Debug, Clone)]
pub struct StreamCore {
    pub url: Url,
    pub mode: OpenMode,
    pub position: u64,
    pub size: u64,
    pub error: Errno,
    pub open: bool,
}

impl StreamCore {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            mode: OpenMode::IN,
            position: 0,
            size: 0,
            error: Errno::NONE,
            open: false,
        }
    }

    /// Record the failure code and hand the error back
    pub fn fail<T>(&mut self, err: RelayError) -> Result<T> {
        self.error = err.code();
        Err(err)
    }

    /// Record the code of a failed result
    pub fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.error = err.code();
        }
        result
    }

    /// Error for an operation on a closed stream
    pub fn require_open(&mut self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            self.fail(RelayError::errno(Errno::EBADF, format!("stream closed: {}", self.url)))
        }
    }

    /// Advance after a transfer, growing the size when writing past the end
    pub fn advance(&mut self, n: usize) {
        self.position += n as u64;
        if self.position > self.size && self.mode.is_write() {
            self.size = self.position;
        }
    }
}

/// A stream that can only move forward and restart from the beginning
pub trait SequentialSource {
    /// Restart at position 0
    fn reopen(&mut self) -> Result<()>;

    /// Read the next bytes, 0 at end
    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Reach `target` on a forward-only source currently at `current`.
///
/// Backward targets reopen the source; the gap is then read and discarded.
/// Returns the reached position, which equals `target` on success.
pub fn emulate_seek<S: SequentialSource + ?Sized>(source: &mut S, current: u64, target: u64) -> Result<u64> {
    let mut position = current;
    if target < position {
        trace!(from = position, to = target, "seek backwards, reopening");
        source.reopen()?;
        position = 0;
    }

    let mut scratch = [0u8; 4096];
    while position < target {
        let want = ((target - position) as usize).min(scratch.len());
        let n = source.read_next(&mut scratch[..want])?;
        if n == 0 {
            return Err(RelayError::errno(
                Errno::EINVAL,
                format!("seek to {} beyond end at {}", target, position),
            ));
        }
        position += n as u64;
    }
    Ok(position)
}

/// `std::io` view of a virtual stream
pub struct StreamReader<'a> {
    stream: &'a mut dyn VStream,
}

impl<'a> StreamReader<'a> {
    pub fn new(stream: &'a mut dyn VStream) -> Self {
        Self { stream }
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.stream.read(buf)?)
    }
}

impl Seek for StreamReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.stream.seek_from(pos)?)
    }
}

/// Stream over bytes held in memory
///
/// Used for rendered content (reports, digests) and as a stand-in stream in
/// tests. A forward-only buffer emulates seeks the way sequential network
/// backends do.
pub struct BufferStream {
    core: StreamCore,
    data: Vec<u8>,
    seekable: bool,
    reopens: usize,
}

impl BufferStream {
    /// Stream opened for reading
    pub fn new(url: Url, data: Vec<u8>) -> Self {
        let mut core = StreamCore::new(url);
        core.size = data.len() as u64;
        core.open = true;
        Self {
            core,
            data,
            seekable: true,
            reopens: 0,
        }
    }

    /// Reject random access: backward seeks restart, forward seeks read through
    pub fn forward_only(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Restarts caused by backward seeks
    pub fn reopen_count(&self) -> usize {
        self.reopens
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl SequentialSource for BufferStream {
    fn reopen(&mut self) -> Result<()> {
        self.core.position = 0;
        self.reopens += 1;
        Ok(())
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize> {
        let at = self.core.position as usize;
        let n = buf.len().min(self.data.len().saturating_sub(at));
        buf[..n].copy_from_slice(&self.data[at..at + n]);
        self.core.position += n as u64;
        Ok(n)
    }
}

impl VStream for BufferStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        if mode.is_truncate() {
            self.data.clear();
        }
        self.core.mode = mode;
        self.core.size = self.data.len() as u64;
        self.core.position = if mode.is_append() { self.core.size } else { 0 };
        self.core.error = Errno::NONE;
        self.core.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.core.require_open()?;
        self.read_next(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.core.require_open()?;
        if !self.core.mode.is_write() {
            return self.core.fail(RelayError::errno(Errno::EBADF, "stream not open for writing"));
        }
        let at = self.core.position as usize;
        let end = at + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[at..end].copy_from_slice(buf);
        self.core.advance(buf.len());
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.core.require_open()?;
        if pos > self.core.size {
            return self.core.fail(RelayError::errno(
                Errno::EINVAL,
                format!("seek to {} past size {}", pos, self.core.size),
            ));
        }
        if self.seekable {
            self.core.position = pos;
            return Ok(());
        }
        let current = self.core.position;
        let reached = emulate_seek(self, current, pos);
        self.core.track(reached).map(|_| ())
    }

    fn size(&self) -> u64 {
        self.core.size
    }

    fn position(&self) -> u64 {
        self.core.position
    }

    fn error(&self) -> Errno {
        self.core.error
    }

    fn is_random_access(&self) -> bool {
        self.seekable
    }
}

/// Forward-only cursor over directory entries loaded on rewind
#[derive(Debug, Default)]
pub struct DirCursor<T> {
    entries: Vec<T>,
    index: usize,
    loaded: bool,
}

impl<T> DirCursor<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: 0,
            loaded: false,
        }
    }

    pub fn reset(&mut self, entries: Vec<T>) {
        self.entries = entries;
        self.index = 0;
        self.loaded = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn next_entry(&mut self) -> Option<&T> {
        let entry = self.entries.get(self.index)?;
        self.index += 1;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
