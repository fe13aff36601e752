use crate::archive::format::{CompressionMethod, EntryInfo, FileHeader, LocalEntryHeader, CD_ENTRY_SIZE, HEADER_SIZE};
use crate::error::{RelayError, Result};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Normalize path to forward slashes
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Builds a packed container
///
/// The header is written as a placeholder and rewritten by [`finish`](Self::finish)
/// once the central directory position is known.
pub struct ArchiveWriter<W: Write + Seek> {
    writer: W,
    entries: Vec<EntryInfo>,
    current_offset: u64,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create a container file on disk
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write + Seek> ArchiveWriter<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        FileHeader::new().write_to(&mut writer)?;
        Ok(Self {
            writer,
            entries: Vec::new(),
            current_offset: HEADER_SIZE as u64,
        })
    }

    /// Add an entry, choosing compression from its name and size
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let compression = CompressionMethod::choose_for_file(path, data.len() as u64);
        self.add_file_with_compression(path, data, compression)
    }

    /// Add an entry; falls back to storing when compression does not help
    pub fn add_file_with_compression(
        &mut self,
        path: &str,
        data: &[u8],
        compression: CompressionMethod,
    ) -> Result<()> {
        let path = normalize_path(path);
        if self.entries.iter().any(|e| e.path == path) {
            return Err(RelayError::PathError(format!("duplicate entry: {}", path)));
        }

        let (payload, compression) = match compression.compress(data)? {
            Some(packed) => (packed, compression),
            None => (data.to_vec(), CompressionMethod::None),
        };
        let crc32 = crc32fast::hash(data);
        let modified_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let local = LocalEntryHeader {
            uncompressed_size: data.len() as u64,
            compressed_size: payload.len() as u64,
            crc32,
            compression,
            path: path.clone(),
        };

        let entry = EntryInfo {
            path,
            data_offset: self.current_offset,
            uncompressed_size: data.len() as u64,
            compressed_size: payload.len() as u64,
            crc32,
            modified_time,
            compression,
            flags: 0,
        };
        // Reject overlong paths before anything reaches the output
        entry.write_to(std::io::sink())?;

        self.current_offset += local.write_to(&mut self.writer)? as u64;
        self.writer.write_all(&payload)?;
        self.current_offset += payload.len() as u64;
        self.entries.push(entry);
        Ok(())
    }

    /// Add a file from disk under `archive_path`
    pub fn add_file_from_disk(&mut self, archive_path: &str, disk_path: &Path) -> Result<()> {
        let data = std::fs::read(disk_path)?;
        self.add_file(archive_path, &data)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Write the central directory, rewrite the header, return the sink
    pub fn finish(mut self) -> Result<W> {
        let cd_offset = self.current_offset;
        for entry in &self.entries {
            entry.write_to(&mut self.writer)?;
        }

        let mut header = FileHeader::new();
        header.central_directory_offset = cd_offset;
        header.central_directory_size = (self.entries.len() * CD_ENTRY_SIZE) as u64;
        header.entry_count = self.entries.len() as u32;

        self.writer.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.writer)?;
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;

        debug!(entries = self.entries.len(), directory = cd_offset, "container written");
        Ok(self.writer)
    }
}
