use crate::archive::reader::{ArchiveEntry, ArchiveFormat, ArchiveReader};
use crate::archive::source::StreamSource;
use crate::cache::{CachePolicy, CachedBuffer};
use crate::config::ArchiveConfig;
use crate::error::{Errno, RelayError, Result};
use crate::url::compare_filename;
use crate::vfs::VStream;
use tracing::{debug, warn};

/// Entry iteration and extraction over a borrowed stream
///
/// `Closed -> Open -> Positioned -> Closed`. Opening binds the stream at
/// offset 0; closing drops the decoder state and leaves the stream to its
/// owner.
pub struct ArchiveContainer<'a> {
    name: String,
    scratch_size: usize,
    idle: Option<&'a mut dyn VStream>,
    reader: Option<ArchiveReader<StreamSource<'a>>>,
    current: Option<ArchiveEntry>,
    /// Regular files passed since the last rewind
    files_seen: usize,
}

impl<'a> ArchiveContainer<'a> {
    /// `name` is the container's URL or file name
    pub fn new(stream: &'a mut dyn VStream, name: impl Into<String>, config: &ArchiveConfig) -> Self {
        Self {
            name: name.into(),
            scratch_size: config.scratch_size,
            idle: Some(stream),
            reader: None,
            current: None,
            files_seen: 0,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.close();
        let stream = self
            .idle
            .take()
            .ok_or_else(|| RelayError::errno(Errno::EBADF, format!("{} lost its stream", self.name)))?;
        if stream.position() != 0 {
            if let Err(err) = stream.seek(0) {
                self.idle = Some(stream);
                return Err(err);
            }
        }
        let reader = ArchiveReader::open(StreamSource::new(stream, self.scratch_size), &self.name)?;
        debug!(container = %self.name, format = ?reader.format(), "container open");
        self.reader = Some(reader);
        Ok(())
    }

    /// Release the decoder; the stream stays open
    pub fn close(&mut self) {
        self.current = None;
        self.files_seen = 0;
        if let Some(reader) = self.reader.take() {
            match reader.into_source() {
                Some(source) => self.idle = Some(source.into_inner()),
                None => warn!(container = %self.name, "stream lost while closing"),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    pub fn format(&self) -> Option<ArchiveFormat> {
        self.reader.as_ref().map(|r| r.format())
    }

    /// Entry the container is positioned on
    pub fn entry(&self) -> Option<&ArchiveEntry> {
        self.current.as_ref()
    }

    /// Position on the regular file with the given index (from 1).
    ///
    /// Moving forward reads the next headers; moving backward restarts the
    /// container. Returns false when the container has fewer files; index 0
    /// is rejected.
    pub fn seek_entry_index(&mut self, index: usize) -> Result<bool> {
        if index == 0 {
            return Err(RelayError::errno(
                Errno::EINVAL,
                format!("{}: entry indices start at 1", self.name),
            ));
        }
        if self.current.is_some() && index == self.files_seen {
            return Ok(true);
        }
        if index <= self.files_seen {
            self.rewind()?;
        }
        while self.files_seen < index {
            if !self.next_file()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Restart and position on the first regular file whose path or base
    /// name matches `pattern` (case-insensitive, `*` and `?` wildcards)
    pub fn seek_entry_name(&mut self, pattern: &str) -> Result<bool> {
        self.rewind()?;
        let pattern = pattern.trim_start_matches('/');
        while self.next_file()? {
            if let Some(entry) = &self.current {
                if compare_filename(&entry.name, pattern) || compare_filename(entry.basename(), pattern) {
                    debug!(container = %self.name, entry = %entry.name, "entry found");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// All regular files, from the start; leaves the container rewound
    pub fn list(&mut self) -> Result<Vec<ArchiveEntry>> {
        self.rewind()?;
        let mut entries = Vec::new();
        while self.next_file()? {
            if let Some(entry) = self.current.take() {
                entries.push(entry);
            }
        }
        self.rewind()?;
        Ok(entries)
    }

    /// Copy the positioned entry into a buffer of exactly its size.
    ///
    /// A short read or decode error drops the buffer; nothing partial is
    /// returned.
    pub fn extract(&mut self, policy: &CachePolicy) -> Result<CachedBuffer> {
        let entry = self
            .current
            .take()
            .ok_or_else(|| RelayError::errno(Errno::EINVAL, format!("{}: no entry selected", self.name)))?;
        let reader = self.reader_mut()?;
        let result = CachedBuffer::from_reader(entry.size, policy, reader.entry_reader());
        match &result {
            Ok(buffer) => debug!(entry = %entry.name, size = entry.size, paged = buffer.is_paged(), "entry extracted"),
            Err(err) => warn!(entry = %entry.name, error = %err, "extraction failed"),
        }
        result
    }

    fn rewind(&mut self) -> Result<()> {
        self.current = None;
        self.files_seen = 0;
        self.reader_mut()?.rewind()
    }

    /// Advance to the next regular file, skipping directories and specials
    fn next_file(&mut self) -> Result<bool> {
        loop {
            let next = self.reader_mut()?.next_entry()?;
            match next {
                None => {
                    self.current = None;
                    return Ok(false);
                }
                Some(entry) if entry.is_file() => {
                    self.files_seen += 1;
                    self.current = Some(entry);
                    return Ok(true);
                }
                Some(_) => continue,
            }
        }
    }

    fn reader_mut(&mut self) -> Result<&mut ArchiveReader<StreamSource<'a>>> {
        self.reader
            .as_mut()
            .ok_or_else(|| RelayError::errno(Errno::EBADF, format!("{} is not open", self.name)))
    }
}

impl Drop for ArchiveContainer<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
