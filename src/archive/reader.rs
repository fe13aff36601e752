//! Pull-based extraction engine
//!
//! [`ArchiveReader`] walks the entries of a container fed through an
//! [`ArchiveSource`]. Tar archives are read front to back and skipped over
//! with the source's `skip`; packed containers are read with absolute
//! seeks through their central directory, and zip archives through the
//! `zip` crate over a seekable view of the source. A zstd, LZ4, gzip, bzip2
//! or xz filter may sit between the source and a tar or single-file format;
//! filtered input only moves forward and restarts by rebuilding the decoder.

use crate::archive::format::{CompressionMethod, EntryInfo, FileHeader, LocalEntryHeader, MAGIC_NUMBER};
use crate::archive::source::ArchiveSource;
use crate::archive::tar::{self, TarHeader, TarKind, BLOCK_SIZE};
use crate::error::{Errno, RelayError, Result};
use crate::url::extension_of;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use tracing::{debug, trace};
use zip::result::ZipError;
use zip::ZipArchive;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0];
const ZIP_LOCAL_MAGIC: [u8; 4] = *b"PK\x03\x04";
/// End of central directory first: an empty zip
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// Longest GNU long name or pax header accepted
const MAX_META_SIZE: u64 = 64 * 1024;

/// Container layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    /// Central-directory container written by [`ArchiveWriter`](crate::archive::ArchiveWriter)
    Packed,
    /// A compressed file holding one entry
    Single,
    Zip,
}

/// Compression wrapped around the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    None,
    Zstd,
    Lz4,
    Gzip,
    Bzip2,
    Xz,
}

impl Filter {
    fn detect(head: &[u8]) -> Self {
        if head.starts_with(&ZSTD_MAGIC) {
            Filter::Zstd
        } else if head.starts_with(&LZ4_MAGIC) {
            Filter::Lz4
        } else if head.starts_with(&GZIP_MAGIC) {
            Filter::Gzip
        } else if head.starts_with(&BZIP2_MAGIC) {
            Filter::Bzip2
        } else if head.starts_with(&XZ_MAGIC) {
            Filter::Xz
        } else {
            Filter::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// One entry of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
    /// Position among all entries, from 0
    pub ordinal: usize,
}

impl ArchiveEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Last path component
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Buffered view over the source callbacks
///
/// Tracks the logical position so skips can be served from the current block
/// before asking the source.
pub(crate) struct Pull<S> {
    source: S,
    block: Vec<u8>,
    at: usize,
    position: u64,
    eof: bool,
}

impl<S: ArchiveSource> Pull<S> {
    fn new(source: S) -> Self {
        Self {
            source,
            block: Vec::new(),
            at: 0,
            position: 0,
            eof: false,
        }
    }

    /// Up to `n` bytes ahead of the position, without consuming them
    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        if self.at > 0 {
            self.block.drain(..self.at);
            self.at = 0;
        }
        while self.block.len() < n && !self.eof {
            let chunk = self.source.read()?;
            if chunk.is_empty() {
                self.eof = true;
            } else {
                self.block.extend_from_slice(chunk);
            }
        }
        Ok(&self.block[..self.block.len().min(n)])
    }

    fn fill(&mut self) -> Result<&[u8]> {
        if self.at >= self.block.len() && !self.eof {
            self.block.clear();
            self.at = 0;
            let chunk = self.source.read()?;
            if chunk.is_empty() {
                self.eof = true;
            } else {
                self.block.extend_from_slice(chunk);
            }
        }
        Ok(&self.block[self.at..])
    }

    fn advance(&mut self, n: usize) {
        self.at += n;
        self.position += n as u64;
    }

    /// Skip `count` bytes: buffered bytes first, then the source's skip,
    /// then reads for whatever the source did not skip
    fn skip(&mut self, count: u64) -> Result<u64> {
        let buffered = (self.block.len() - self.at) as u64;
        let from_block = buffered.min(count);
        self.advance(from_block as usize);
        let mut left = count - from_block;

        if left > 0 && !self.eof {
            let skipped = self.source.skip(left)?.min(left);
            self.position += skipped;
            left -= skipped;
        }

        while left > 0 {
            let available = self.fill()?.len();
            if available == 0 {
                break;
            }
            let n = (available as u64).min(left) as usize;
            self.advance(n);
            left -= n as u64;
        }
        Ok(count - left)
    }

    fn seek(&mut self, offset: u64) -> Result<u64> {
        self.block.clear();
        self.at = 0;
        self.eof = false;
        self.position = self.source.seek(offset)?;
        Ok(self.position)
    }

    /// Total length: from the source, or by reading to the end
    fn end(&mut self) -> Result<u64> {
        if let Some(size) = self.source.size() {
            return Ok(size);
        }
        while !self.fill()?.is_empty() {
            let n = self.block.len() - self.at;
            self.advance(n);
        }
        Ok(self.position)
    }
}

impl<S: ArchiveSource> Read for Pull<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<S: ArchiveSource> BufRead for Pull<S> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(self.fill()?)
    }

    fn consume(&mut self, amt: usize) {
        self.advance(amt);
    }
}

/// `Read + Seek` view of the raw source for the zip directory reader
struct SeekPull<S: ArchiveSource> {
    pull: Pull<S>,
}

impl<S: ArchiveSource> Read for SeekPull<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pull.read(buf)
    }
}

impl<S: ArchiveSource> Seek for SeekPull<S> {
    fn seek(&mut self, to: SeekFrom) -> io::Result<u64> {
        let target = match to {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pull.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.pull.end()?.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        if target == self.pull.position {
            return Ok(target);
        }
        Ok(self.pull.seek(target)?)
    }
}

/// Source plus the decompression filter in front of it
enum Input<S: ArchiveSource> {
    Raw(Pull<S>),
    Zstd(zstd::stream::read::Decoder<'static, Pull<S>>),
    Lz4(lz4_flex::frame::FrameDecoder<Pull<S>>),
    Gzip(flate2::bufread::MultiGzDecoder<Pull<S>>),
    Bzip2(bzip2::bufread::MultiBzDecoder<Pull<S>>),
    Xz(xz2::bufread::XzDecoder<Pull<S>>),
}

impl<S: ArchiveSource> Input<S> {
    fn open(pull: Pull<S>, filter: Filter) -> Result<Self> {
        Ok(match filter {
            Filter::None => Input::Raw(pull),
            Filter::Zstd => Input::Zstd(zstd::stream::read::Decoder::with_buffer(pull)?),
            Filter::Lz4 => Input::Lz4(lz4_flex::frame::FrameDecoder::new(pull)),
            Filter::Gzip => Input::Gzip(flate2::bufread::MultiGzDecoder::new(pull)),
            Filter::Bzip2 => Input::Bzip2(bzip2::bufread::MultiBzDecoder::new(pull)),
            Filter::Xz => Input::Xz(xz2::bufread::XzDecoder::new_multi_decoder(pull)),
        })
    }

    fn into_pull(self) -> Pull<S> {
        match self {
            Input::Raw(pull) => pull,
            Input::Zstd(decoder) => decoder.finish(),
            Input::Lz4(decoder) => decoder.into_inner(),
            Input::Gzip(decoder) => decoder.into_inner(),
            Input::Bzip2(decoder) => decoder.into_inner(),
            Input::Xz(decoder) => decoder.into_inner(),
        }
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        match self {
            Input::Raw(pull) => pull.skip(count),
            _ => Ok(io::copy(&mut self.by_ref().take(count), &mut io::sink())?),
        }
    }

    fn seek(&mut self, offset: u64) -> Result<u64> {
        match self {
            Input::Raw(pull) => pull.seek(offset),
            _ => Err(RelayError::errno(Errno::ESPIPE, "seek on compressed input")),
        }
    }
}

impl<S: ArchiveSource> Read for Input<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::Raw(pull) => pull.read(buf),
            Input::Zstd(decoder) => decoder.read(buf),
            Input::Lz4(decoder) => decoder.read(buf),
            Input::Gzip(decoder) => decoder.read(buf),
            Input::Bzip2(decoder) => decoder.read(buf),
            Input::Xz(decoder) => decoder.read(buf),
        }
    }
}

enum Layout<S: ArchiveSource> {
    Tar {
        /// First header, consumed while detecting the format
        pending: Option<Vec<u8>>,
        padding: u64,
    },
    Packed {
        directory: Vec<EntryInfo>,
        next: usize,
    },
    Single {
        name: String,
        size: u64,
        emitted: bool,
    },
    /// Holds the source while open; entries are inflated on first read
    Zip {
        archive: Box<ZipArchive<SeekPull<S>>>,
        next: usize,
    },
}

struct CrcCheck {
    hasher: crc32fast::Hasher,
    expected: u32,
}

/// Unread data of the current entry
enum Data {
    Empty,
    Stream { remaining: u64, check: Option<CrcCheck> },
    /// Compressed payload at the input position, decoded on first read
    Deferred(EntryInfo),
    /// Zip entry by index, inflated on first read
    Zipped(usize),
    Memory(io::Cursor<Vec<u8>>),
}

/// Walks and extracts the entries of one container
pub struct ArchiveReader<S: ArchiveSource> {
    input: Option<Input<S>>,
    filter: Filter,
    format: ArchiveFormat,
    layout: Layout<S>,
    data: Data,
    ordinal: usize,
}

impl<S: ArchiveSource> ArchiveReader<S> {
    /// Detect the format and prepare to read the first entry.
    ///
    /// `name` is the container's file name; it names the entry of a bare
    /// compressed file and explains rejected formats.
    pub fn open(source: S, name: &str) -> Result<Self> {
        let mut pull = Pull::new(source);
        let head = pull.peek(BLOCK_SIZE)?.to_vec();

        if head.starts_with(&ZIP_LOCAL_MAGIC) || head.starts_with(&ZIP_EMPTY_MAGIC) {
            return Self::open_zip(pull, name);
        }
        let filter = Filter::detect(&head);

        let mut input = Input::open(pull, filter)?;
        let (format, layout) = match filter {
            Filter::None if head.starts_with(&MAGIC_NUMBER) => {
                (ArchiveFormat::Packed, Self::read_directory(&mut input)?)
            }
            Filter::None if tar::is_header(&head) => (
                ArchiveFormat::Tar,
                Layout::Tar {
                    pending: None,
                    padding: 0,
                },
            ),
            Filter::None => return Err(Self::unrecognised(&head, name)),
            _ => {
                let mut inner = Vec::with_capacity(BLOCK_SIZE);
                input.by_ref().take(BLOCK_SIZE as u64).read_to_end(&mut inner)?;
                if tar::is_header(&inner) {
                    (
                        ArchiveFormat::Tar,
                        Layout::Tar {
                            pending: Some(inner),
                            padding: 0,
                        },
                    )
                } else {
                    (
                        ArchiveFormat::Single,
                        Layout::Single {
                            name: single_entry_name(name),
                            size: 0,
                            emitted: false,
                        },
                    )
                }
            }
        };

        let mut reader = Self {
            input: Some(input),
            filter,
            format,
            layout,
            data: Data::Empty,
            ordinal: 0,
        };

        if format == ArchiveFormat::Single {
            reader.restart()?;
            let counted = io::copy(reader.input()?, &mut io::sink())?;
            reader.restart()?;
            if let Layout::Single { size, .. } = &mut reader.layout {
                *size = counted;
            }
        }

        debug!(?format, ?filter, name, "archive opened");
        Ok(reader)
    }

    fn open_zip(pull: Pull<S>, name: &str) -> Result<Self> {
        let archive = ZipArchive::new(SeekPull { pull }).map_err(|err| zip_error(name, err))?;
        debug!(name, entries = archive.len(), "zip opened");
        Ok(Self {
            input: None,
            filter: Filter::None,
            format: ArchiveFormat::Zip,
            layout: Layout::Zip {
                archive: Box::new(archive),
                next: 0,
            },
            data: Data::Empty,
            ordinal: 0,
        })
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    /// Hand back the source; `None` when a failed restart lost it
    pub fn into_source(self) -> Option<S> {
        match self.layout {
            Layout::Zip { archive, .. } => Some(archive.into_inner().pull.source),
            _ => self.input.map(|input| input.into_pull().source),
        }
    }

    /// Return to the first entry
    pub fn rewind(&mut self) -> Result<()> {
        self.data = Data::Empty;
        self.ordinal = 0;
        match &mut self.layout {
            Layout::Packed { next, .. } | Layout::Zip { next, .. } => {
                *next = 0;
                return Ok(());
            }
            Layout::Tar { pending, padding } => {
                *pending = None;
                *padding = 0;
            }
            Layout::Single { emitted, .. } => *emitted = false,
        }
        self.restart()
    }

    /// Advance to the next entry of any kind; `None` at the end
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        self.finish_entry()?;

        let entry = match &mut self.layout {
            Layout::Tar { pending, padding } => {
                let input = self.input.as_mut().ok_or_else(input_lost)?;
                let Some(header) = next_tar_header(input, pending)? else {
                    return Ok(None);
                };
                *padding = TarHeader::padding(header.size);
                self.data = Data::Stream {
                    remaining: header.size,
                    check: None,
                };
                let kind = match header.kind {
                    TarKind::File => EntryKind::File,
                    TarKind::Directory => EntryKind::Directory,
                    _ => EntryKind::Other,
                };
                ArchiveEntry {
                    name: header.name,
                    size: header.size,
                    kind,
                    ordinal: self.ordinal,
                }
            }
            Layout::Packed { directory, next } => {
                let Some(info) = directory.get(*next).cloned() else {
                    return Ok(None);
                };
                *next += 1;
                let input = self.input.as_mut().ok_or_else(input_lost)?;
                input.seek(info.data_offset)?;
                let local = LocalEntryHeader::read_from(&mut *input)?;
                if !local.matches(&info) {
                    return Err(RelayError::InvalidFormat(format!(
                        "local header disagrees with directory for {}",
                        info.path
                    )));
                }
                let entry = ArchiveEntry {
                    name: info.path.clone(),
                    size: info.uncompressed_size,
                    kind: EntryKind::File,
                    ordinal: self.ordinal,
                };
                self.data = match info.compression {
                    CompressionMethod::None => Data::Stream {
                        remaining: info.compressed_size,
                        check: Some(CrcCheck {
                            hasher: crc32fast::Hasher::new(),
                            expected: info.crc32,
                        }),
                    },
                    _ => Data::Deferred(info),
                };
                entry
            }
            Layout::Single {
                name,
                size,
                emitted,
            } => {
                if *emitted {
                    return Ok(None);
                }
                *emitted = true;
                self.data = Data::Stream {
                    remaining: *size,
                    check: None,
                };
                ArchiveEntry {
                    name: name.clone(),
                    size: *size,
                    kind: EntryKind::File,
                    ordinal: 0,
                }
            }
            Layout::Zip { archive, next } => {
                if *next >= archive.len() {
                    return Ok(None);
                }
                let index = *next;
                *next += 1;
                let file = archive
                    .by_index_raw(index)
                    .map_err(|err| zip_error(&format!("entry {}", index), err))?;
                let kind = if file.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                let entry = ArchiveEntry {
                    name: file.name().trim_end_matches('/').to_string(),
                    size: file.size(),
                    kind,
                    ordinal: self.ordinal,
                };
                drop(file);
                if kind == EntryKind::File {
                    self.data = Data::Zipped(index);
                }
                entry
            }
        };

        self.ordinal += 1;
        trace!(name = %entry.name, size = entry.size, "entry");
        Ok(Some(entry))
    }

    /// Read data of the current entry; 0 once it is exhausted
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &self.data {
            Data::Deferred(info) => {
                let input = self.input.as_mut().ok_or_else(input_lost)?;
                let decoded = decode_payload(input, info)?;
                self.data = Data::Memory(io::Cursor::new(decoded));
            }
            Data::Zipped(index) => {
                let index = *index;
                let decoded = self.inflate_zip_entry(index)?;
                self.data = Data::Memory(io::Cursor::new(decoded));
            }
            _ => {}
        }

        match &mut self.data {
            Data::Empty | Data::Deferred(_) | Data::Zipped(_) => Ok(0),
            Data::Memory(cursor) => Ok(cursor.read(buf)?),
            Data::Stream { remaining, check } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let input = self.input.as_mut().ok_or_else(input_lost)?;
                let want = (*remaining).min(buf.len() as u64) as usize;
                let n = input.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(RelayError::InvalidFormat(format!(
                        "entry data truncated, {} bytes missing",
                        remaining
                    )));
                }
                *remaining -= n as u64;
                if let Some(crc) = check {
                    crc.hasher.update(&buf[..n]);
                    if *remaining == 0 {
                        let actual = crc.hasher.clone().finalize();
                        if actual != crc.expected {
                            return Err(RelayError::CrcMismatch {
                                expected: crc.expected,
                                actual,
                            });
                        }
                    }
                }
                Ok(n)
            }
        }
    }

    /// `std::io` view of the current entry's data
    pub fn entry_reader(&mut self) -> EntryReader<'_, S> {
        EntryReader { reader: self }
    }

    fn input(&mut self) -> Result<&mut Input<S>> {
        self.input.as_mut().ok_or_else(input_lost)
    }

    /// Decompress one zip entry; the zip reader checks its CRC
    fn inflate_zip_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let Layout::Zip { archive, .. } = &mut self.layout else {
            return Err(input_lost());
        };
        let mut file = archive
            .by_index(index)
            .map_err(|err| zip_error(&format!("entry {}", index), err))?;
        let name = file.name().to_string();
        let expected = file.size();
        let mut data = Vec::with_capacity(expected.min(MAX_ZIP_RESERVE) as usize);
        file.read_to_end(&mut data)
            .map_err(|err| RelayError::DecompressionFailed(format!("{}: {}", name, err)))?;
        if data.len() as u64 != expected {
            return Err(RelayError::DecompressionFailed(format!(
                "{} decoded to {} bytes, expected {}",
                name,
                data.len(),
                expected
            )));
        }
        Ok(data)
    }

    /// Rebuild the input at offset 0
    fn restart(&mut self) -> Result<()> {
        let input = self.input.take().ok_or_else(input_lost)?;
        let mut pull = input.into_pull();
        if let Err(err) = pull.seek(0) {
            self.input = Some(Input::Raw(pull));
            return Err(err);
        }
        self.input = Some(Input::open(pull, self.filter)?);
        Ok(())
    }

    /// Skip the unread part of the current entry
    fn finish_entry(&mut self) -> Result<()> {
        let unread = match std::mem::replace(&mut self.data, Data::Empty) {
            Data::Stream { remaining, .. } => remaining,
            _ => 0,
        };
        let Layout::Tar { padding, .. } = &mut self.layout else {
            return Ok(());
        };
        let count = unread + std::mem::take(padding);
        if count == 0 {
            return Ok(());
        }
        let input = self.input.as_mut().ok_or_else(input_lost)?;
        let skipped = input.skip(count)?;
        if skipped < count {
            return Err(RelayError::InvalidFormat(format!(
                "archive truncated: skipped {} of {} bytes",
                skipped, count
            )));
        }
        Ok(())
    }

    fn read_directory(input: &mut Input<S>) -> Result<Layout<S>> {
        let header = FileHeader::read_from(&mut *input)?;
        input.seek(header.central_directory_offset)?;
        let mut directory = Vec::with_capacity(header.entry_count.min(1024) as usize);
        for _ in 0..header.entry_count {
            directory.push(EntryInfo::read_from(&mut *input)?);
        }
        Ok(Layout::Packed { directory, next: 0 })
    }

    fn unrecognised(head: &[u8], name: &str) -> RelayError {
        let known = match head {
            [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C, ..] => Some("7z"),
            [b'R', b'a', b'r', b'!', ..] => Some("rar"),
            [b'M', b'S', b'C', b'F', ..] => Some("cab"),
            [_, _, b'-', b'l', b'h', _, b'-', ..] => Some("lha"),
            _ if head.len() == BLOCK_SIZE && name.to_ascii_lowercase().ends_with(".iso") => Some("iso"),
            _ => None,
        };
        match known {
            Some(kind) => RelayError::UnsupportedFormat(format!("{} ({})", name, kind)),
            None if head.is_empty() => RelayError::InvalidFormat(format!("{} is empty", name)),
            None => RelayError::InvalidFormat(format!("{} is not a recognised archive", name)),
        }
    }
}

/// `std::io::Read` over the current entry
pub struct EntryReader<'r, S: ArchiveSource> {
    reader: &'r mut ArchiveReader<S>,
}

impl<S: ArchiveSource> Read for EntryReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.reader.read_data(buf)?)
    }
}

/// Largest up-front reservation for an inflated zip entry
const MAX_ZIP_RESERVE: u64 = 1 << 20;

fn input_lost() -> RelayError {
    RelayError::errno(Errno::EBADF, "archive input lost")
}

fn zip_error(name: &str, err: ZipError) -> RelayError {
    match err {
        ZipError::Io(err) => err.into(),
        ZipError::UnsupportedArchive(what) => RelayError::UnsupportedFormat(format!("{}: {}", name, what)),
        other => RelayError::InvalidFormat(format!("{}: {}", name, other)),
    }
}

/// Read the next real header, folding GNU long names and pax paths into it
fn next_tar_header<S: ArchiveSource>(
    input: &mut Input<S>,
    pending: &mut Option<Vec<u8>>,
) -> Result<Option<TarHeader>> {
    let mut name_override: Option<String> = None;
    loop {
        let block = match pending.take() {
            Some(block) => block,
            None => match read_block(input)? {
                Some(block) => block,
                None => return Ok(None),
            },
        };
        let Some(mut header) = tar::parse_header(&block)? else {
            return Ok(None);
        };

        match header.kind {
            TarKind::LongName | TarKind::Pax | TarKind::Meta => {
                let padded = header.size + TarHeader::padding(header.size);
                if header.kind == TarKind::Meta || header.size > MAX_META_SIZE {
                    skip_exact(input, padded)?;
                    continue;
                }
                let mut data = vec![0u8; header.size as usize];
                input.read_exact(&mut data)?;
                skip_exact(input, TarHeader::padding(header.size))?;
                let name = if header.kind == TarKind::LongName {
                    Some(tar::long_name(&data))
                } else {
                    tar::pax_path(&data)
                };
                if name.is_some() {
                    name_override = name;
                }
            }
            _ => {
                if let Some(name) = name_override.take() {
                    header.name = name;
                }
                return Ok(Some(header));
            }
        }
    }
}

/// One 512-byte block; `None` at a clean end of input
fn read_block<S: ArchiveSource>(input: &mut Input<S>) -> Result<Option<Vec<u8>>> {
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    input.by_ref().take(BLOCK_SIZE as u64).read_to_end(&mut block)?;
    match block.len() {
        0 => Ok(None),
        BLOCK_SIZE => Ok(Some(block)),
        n => Err(RelayError::InvalidFormat(format!("partial tar block of {} bytes", n))),
    }
}

fn skip_exact<S: ArchiveSource>(input: &mut Input<S>, count: u64) -> Result<()> {
    if input.skip(count)? < count {
        return Err(RelayError::InvalidFormat("archive truncated".to_string()));
    }
    Ok(())
}

fn decode_payload<S: ArchiveSource>(input: &mut Input<S>, info: &EntryInfo) -> Result<Vec<u8>> {
    let mut packed = Vec::new();
    input.by_ref().take(info.compressed_size).read_to_end(&mut packed)?;
    if packed.len() as u64 != info.compressed_size {
        return Err(RelayError::InvalidFormat(format!(
            "payload of {} truncated",
            info.path
        )));
    }
    let data = info.compression.decompress(packed)?;
    if data.len() as u64 != info.uncompressed_size {
        return Err(RelayError::DecompressionFailed(format!(
            "{} decoded to {} bytes, expected {}",
            info.path,
            data.len(),
            info.uncompressed_size
        )));
    }
    let actual = crc32fast::hash(&data);
    if actual != info.crc32 {
        return Err(RelayError::CrcMismatch {
            expected: info.crc32,
            actual,
        });
    }
    Ok(data)
}

/// Entry name of a bare compressed file: its name without the compression suffix
fn single_entry_name(container: &str) -> String {
    let base = container.rsplit('/').next().unwrap_or(container);
    let stem = match extension_of(base).as_deref() {
        Some(".zst") | Some(".zstd") | Some(".lz4") | Some(".gz") | Some(".bz2") | Some(".xz") => {
            &base[..base.rfind('.').unwrap_or(base.len())]
        }
        _ => base,
    };
    if stem.is_empty() {
        "data".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::source::SliceSource;
    use crate::archive::tar::TarBuilder;
    use crate::archive::{ArchiveWriter, CompressionMethod};
    use std::io::{Cursor, Write};

    fn sample_tar() -> Vec<u8> {
        let mut builder = TarBuilder::new();
        builder.add_dir("docs").unwrap();
        builder.add_file("docs/readme.txt", b"hello tar").unwrap();
        builder.add_file("prg/game.prg", &[7u8; 1500]).unwrap();
        builder.finish()
    }

    fn names<S: ArchiveSource>(reader: &mut ArchiveReader<S>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            out.push(entry.name);
        }
        out
    }

    #[test]
    fn test_tar_walk_and_read() {
        let bytes = sample_tar();
        let mut reader = ArchiveReader::open(SliceSource::with_block(&bytes, 700), "a.tar").unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Tar);

        let dir = reader.next_entry().unwrap().unwrap();
        assert_eq!(dir.kind, EntryKind::Directory);
        let readme = reader.next_entry().unwrap().unwrap();
        assert_eq!(readme.basename(), "readme.txt");
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello tar");

        // Unread data is skipped
        let game = reader.next_entry().unwrap().unwrap();
        assert_eq!(game.size, 1500);
        assert_eq!(game.ordinal, 2);
        assert!(reader.next_entry().unwrap().is_none());

        reader.rewind().unwrap();
        assert_eq!(names(&mut reader), vec!["docs", "docs/readme.txt", "prg/game.prg"]);
    }

    #[test]
    fn test_zstd_tar() {
        let bytes = zstd::encode_all(&sample_tar()[..], 3).unwrap();
        let mut reader = ArchiveReader::open(SliceSource::new(&bytes), "a.tar.zst").unwrap();
        assert_eq!(reader.filter(), Filter::Zstd);
        assert_eq!(reader.format(), ArchiveFormat::Tar);
        assert_eq!(names(&mut reader).len(), 3);
        reader.rewind().unwrap();
        assert_eq!(names(&mut reader).len(), 3);
    }

    #[test]
    fn test_lz4_single_file() {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(&b"0123456789".repeat(300)).unwrap();
        let bytes = encoder.finish().unwrap();

        let mut reader = ArchiveReader::open(SliceSource::new(&bytes), "/x/Disk.D64.lz4").unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Single);
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.name, "Disk.D64");
        assert_eq!(entry.size, 3000);
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 3000);
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_packed_container() {
        let mut writer = ArchiveWriter::new(Cursor::new(Vec::new())).unwrap();
        writer.add_file("one.txt", &b"first ".repeat(2000)).unwrap();
        writer
            .add_file_with_compression("two.bin", &[3u8; 100], CompressionMethod::None)
            .unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let mut reader = ArchiveReader::open(SliceSource::new(&bytes), "pack.rpk").unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Packed);
        let one = reader.next_entry().unwrap().unwrap();
        assert_eq!(one.size, 12000);
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"first ".repeat(2000));

        let two = reader.next_entry().unwrap().unwrap();
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!((two.name.as_str(), data.len()), ("two.bin", 100));
    }

    #[test]
    fn test_packed_crc_mismatch() {
        let mut writer = ArchiveWriter::new(Cursor::new(Vec::new())).unwrap();
        writer
            .add_file_with_compression("a", b"payload", CompressionMethod::None)
            .unwrap();
        let mut bytes = writer.finish().unwrap().into_inner();
        let payload_at = 64 + LocalEntryHeader::encoded_len(1);
        bytes[payload_at] ^= 0xFF;

        let mut reader = ArchiveReader::open(SliceSource::new(&bytes), "a.rpk").unwrap();
        reader.next_entry().unwrap();
        let mut data = Vec::new();
        let result = reader.entry_reader().read_to_end(&mut data);
        assert!(result.is_err());
    }

    #[test]
    fn test_gzip_tar() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&sample_tar()).unwrap();
        let bytes = encoder.finish().unwrap();

        let mut reader = ArchiveReader::open(SliceSource::with_block(&bytes, 300), "a.tgz").unwrap();
        assert_eq!(reader.filter(), Filter::Gzip);
        assert_eq!(reader.format(), ArchiveFormat::Tar);
        reader.next_entry().unwrap();
        let readme = reader.next_entry().unwrap().unwrap();
        assert_eq!(readme.name, "docs/readme.txt");
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello tar");
        reader.rewind().unwrap();
        assert_eq!(names(&mut reader).len(), 3);
    }

    #[test]
    fn test_bzip2_and_xz_single_files() {
        let text = b"READY.\n".repeat(500);
        let mut bz = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        bz.write_all(&text).unwrap();
        let bz = bz.finish().unwrap();
        let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
        xz.write_all(&text).unwrap();
        let xz = xz.finish().unwrap();

        for (bytes, name, filter) in [(bz, "notes.txt.bz2", Filter::Bzip2), (xz, "notes.txt.xz", Filter::Xz)] {
            let mut reader = ArchiveReader::open(SliceSource::new(&bytes), name).unwrap();
            assert_eq!(reader.filter(), filter);
            assert_eq!(reader.format(), ArchiveFormat::Single);
            let entry = reader.next_entry().unwrap().unwrap();
            assert_eq!((entry.name.as_str(), entry.size), ("notes.txt", text.len() as u64));
            let mut data = Vec::new();
            reader.entry_reader().read_to_end(&mut data).unwrap();
            assert_eq!(data, text);
        }
    }

    fn sample_zip() -> Vec<u8> {
        use zip::write::SimpleFileOptions;
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let deflated = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        writer.add_directory("disk1/", stored).unwrap();
        writer.start_file("disk1/elite.prg", deflated).unwrap();
        writer.write_all(&b"ELITE".repeat(400)).unwrap();
        writer.start_file("readme.txt", stored).unwrap();
        writer.write_all(b"read me").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_zip_walk_and_read() {
        let bytes = sample_zip();
        let mut reader = ArchiveReader::open(SliceSource::with_block(&bytes, 256), "games.zip").unwrap();
        assert_eq!(reader.format(), ArchiveFormat::Zip);

        let dir = reader.next_entry().unwrap().unwrap();
        assert_eq!((dir.name.as_str(), dir.kind), ("disk1", EntryKind::Directory));
        let elite = reader.next_entry().unwrap().unwrap();
        assert_eq!(elite.size, 2000);
        // Skipped without reading
        let readme = reader.next_entry().unwrap().unwrap();
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!((readme.ordinal, data.as_slice()), (2, &b"read me"[..]));
        assert!(reader.next_entry().unwrap().is_none());

        reader.rewind().unwrap();
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        let mut data = Vec::new();
        reader.entry_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"ELITE".repeat(400));
        assert!(reader.into_source().is_some());
    }

    #[test]
    fn test_zip_crc_mismatch() {
        let mut bytes = sample_zip();
        let at = bytes.windows(7).position(|w| w == b"read me").unwrap();
        bytes[at] = b'R';
        let mut reader = ArchiveReader::open(SliceSource::new(&bytes), "games.zip").unwrap();
        for _ in 0..3 {
            reader.next_entry().unwrap();
        }
        let mut data = Vec::new();
        assert!(reader.entry_reader().read_to_end(&mut data).is_err());
    }

    #[test]
    fn test_rejected_formats() {
        let seven = b"7z\xBC\xAF\x27\x1Crest of a 7z archive";
        assert!(matches!(
            ArchiveReader::open(SliceSource::new(seven), "a.7z"),
            Err(RelayError::UnsupportedFormat(_))
        ));
        let rar = b"Rar!\x1A\x07\x00rest";
        assert!(matches!(
            ArchiveReader::open(SliceSource::new(rar), "a.rar"),
            Err(RelayError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            ArchiveReader::open(SliceSource::new(b"plain text"), "a.tar"),
            Err(RelayError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_truncated_tar() {
        let bytes = sample_tar();
        let cut = &bytes[..1024 + 600];
        let mut reader = ArchiveReader::open(SliceSource::new(cut), "a.tar").unwrap();
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        assert!(reader.next_entry().is_err());
    }

    #[test]
    fn test_single_entry_name() {
        assert_eq!(single_entry_name("http://h/games/Elite.d64.zst"), "Elite.d64");
        assert_eq!(single_entry_name("ftp://h/notes.txt.gz"), "notes.txt");
        assert_eq!(single_entry_name(".zst"), "data");
        assert_eq!(single_entry_name("plain"), "plain");
    }
}
