//! Packed container layout
//!
//! ```text
//! [header 64 bytes][LOCA header + payload]...[central directory: 320 bytes per entry]
//! ```
//!
//! The central directory gives every entry's offset, so the container is read
//! with absolute seeks and never scanned.

use crate::error::{RelayError, Result};
use std::io::{Read, Write};

/// 0x89 'R' 'P' 'K' 0x0D 0x0A 0x1A 0x0A, PNG-style so text-mode transfers are detected
pub const MAGIC_NUMBER: [u8; 8] = [0x89, b'R', b'P', b'K', 0x0D, 0x0A, 0x1A, 0x0A];

pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 0;

pub const HEADER_SIZE: usize = 64;

/// Central directory entry size in bytes
pub const CD_ENTRY_SIZE: usize = 320;

/// Maximum path length in bytes (UTF-8)
pub const MAX_PATH_LENGTH: usize = 255;

const CD_SIGNATURE: [u8; 4] = *b"CENT";

/// Signature of the header in front of each payload
pub const LOCAL_ENTRY_SIGNATURE: [u8; 4] = *b"LOCA";

/// Per-entry compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            _ => Err(RelayError::InvalidCompression(value)),
        }
    }

    /// Pick a method from the entry name and size
    pub fn choose_for_file(path: &str, size: u64) -> Self {
        if size < 4096 {
            return Self::None;
        }

        let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            // Already compressed
            "png" | "jpg" | "jpeg" | "gif" | "mp3" | "mp4" | "zip" | "gz" | "7z" | "zst" | "lz4" => {
                Self::None
            }
            // Disk and cartridge images favour decode speed
            "d64" | "d71" | "d81" | "t64" | "tap" | "prg" | "crt" | "bin" | "img" => Self::Lz4,
            _ => Self::Zstd,
        }
    }

    /// Decode a payload of this method
    pub fn decompress(self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data),
            Self::Lz4 => lz4_flex::decompress_size_prepended(&data).map_err(|e| {
                RelayError::DecompressionFailed(format!("LZ4 decompression failed: {}", e))
            }),
            Self::Zstd => zstd::decode_all(&data[..]).map_err(|e| {
                RelayError::DecompressionFailed(format!("Zstd decompression failed: {}", e))
            }),
        }
    }

    /// Encode `data`; `None` when compression does not shrink it
    pub fn compress(self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let packed = match self {
            Self::None => return Ok(None),
            Self::Lz4 => lz4_flex::compress_prepend_size(data),
            Self::Zstd => zstd::encode_all(data, 6).map_err(|e| {
                RelayError::CompressionFailed(format!("Zstd compression failed: {}", e))
            })?,
        };
        Ok((packed.len() < data.len()).then_some(packed))
    }
}

/// Fixed header at offset 0
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub central_directory_offset: u64,
    pub central_directory_size: u64,
    pub entry_count: u32,
    pub flags: u32,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            version_major: FORMAT_VERSION_MAJOR,
            version_minor: FORMAT_VERSION_MINOR,
            central_directory_offset: 0,
            central_directory_size: 0,
            entry_count: 0,
            flags: 0,
        }
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&MAGIC_NUMBER)?;
        writer.write_all(&self.version_major.to_le_bytes())?;
        writer.write_all(&self.version_minor.to_le_bytes())?;
        writer.write_all(&self.central_directory_offset.to_le_bytes())?;
        writer.write_all(&self.central_directory_size.to_le_bytes())?;
        writer.write_all(&self.entry_count.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        // Reserved
        writer.write_all(&[0u8; 24])?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_NUMBER {
            return Err(RelayError::InvalidFormat("bad container magic".to_string()));
        }

        let version_major = read_u16(&mut reader)?;
        let version_minor = read_u16(&mut reader)?;
        let central_directory_offset = read_u64(&mut reader)?;
        let central_directory_size = read_u64(&mut reader)?;
        let entry_count = read_u32(&mut reader)?;
        let flags = read_u32(&mut reader)?;

        let mut reserved = [0u8; 24];
        reader.read_exact(&mut reserved)?;

        let header = Self {
            version_major,
            version_minor,
            central_directory_offset,
            central_directory_size,
            entry_count,
            flags,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.version_major > FORMAT_VERSION_MAJOR {
            return Err(RelayError::UnsupportedFormat(format!(
                "container version {}.{}",
                self.version_major, self.version_minor
            )));
        }
        if self.central_directory_offset < HEADER_SIZE as u64 {
            return Err(RelayError::InvalidFormat(format!(
                "central directory offset {} inside header",
                self.central_directory_offset
            )));
        }
        let expected = self.entry_count as u64 * CD_ENTRY_SIZE as u64;
        if self.central_directory_size != expected {
            return Err(RelayError::InvalidFormat(format!(
                "central directory size {} for {} entries",
                self.central_directory_size, self.entry_count
            )));
        }
        Ok(())
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Central directory record
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: String,
    /// Offset of the entry's LOCA header
    pub data_offset: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub crc32: u32,
    pub modified_time: u64,
    pub compression: CompressionMethod,
    pub flags: u8,
}

impl EntryInfo {
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() > MAX_PATH_LENGTH {
            return Err(RelayError::PathError(format!(
                "path too long: {} bytes (max {})",
                path_bytes.len(),
                MAX_PATH_LENGTH
            )));
        }

        writer.write_all(&CD_SIGNATURE)?;
        writer.write_all(&self.data_offset.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.modified_time.to_le_bytes())?;
        writer.write_all(&[self.compression as u8, self.flags])?;
        writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;

        let mut path_buf = [0u8; 256];
        path_buf[..path_bytes.len()].copy_from_slice(path_bytes);
        writer.write_all(&path_buf)?;

        writer.write_all(&[0u8; 20])?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        if sig != CD_SIGNATURE {
            return Err(RelayError::InvalidFormat(
                "invalid central directory signature".to_string(),
            ));
        }

        let data_offset = read_u64(&mut reader)?;
        let uncompressed_size = read_u64(&mut reader)?;
        let compressed_size = read_u64(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let modified_time = read_u64(&mut reader)?;

        let mut method_flags = [0u8; 2];
        reader.read_exact(&mut method_flags)?;
        let compression = CompressionMethod::from_u8(method_flags[0])?;

        let path_len = read_u16(&mut reader)? as usize;
        if path_len > MAX_PATH_LENGTH {
            return Err(RelayError::PathError(format!("path length {}", path_len)));
        }
        let mut path_buf = [0u8; 256];
        reader.read_exact(&mut path_buf)?;
        let path = String::from_utf8(path_buf[..path_len].to_vec())
            .map_err(|e| RelayError::PathError(format!("invalid UTF-8 in path: {}", e)))?;

        let mut reserved = [0u8; 20];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            path,
            data_offset,
            uncompressed_size,
            compressed_size,
            crc32,
            modified_time,
            compression,
            flags: method_flags[1],
        })
    }
}

/// Header in front of each payload; repeats the directory record so a
/// damaged directory can be detected
#[derive(Debug, Clone)]
pub struct LocalEntryHeader {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub crc32: u32,
    pub compression: CompressionMethod,
    pub path: String,
}

impl LocalEntryHeader {
    /// Returns bytes written
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let path_bytes = self.path.as_bytes();
        writer.write_all(&LOCAL_ENTRY_SIGNATURE)?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&[self.compression as u8, 0])?;
        writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
        writer.write_all(path_bytes)?;
        Ok(Self::encoded_len(path_bytes.len()))
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        if sig != LOCAL_ENTRY_SIGNATURE {
            return Err(RelayError::InvalidFormat(
                "invalid local entry signature".to_string(),
            ));
        }

        let uncompressed_size = read_u64(&mut reader)?;
        let compressed_size = read_u64(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let mut method_flags = [0u8; 2];
        reader.read_exact(&mut method_flags)?;
        let compression = CompressionMethod::from_u8(method_flags[0])?;

        let path_len = read_u16(&mut reader)? as usize;
        if path_len > MAX_PATH_LENGTH {
            return Err(RelayError::PathError(format!("path length {}", path_len)));
        }
        let mut path = vec![0u8; path_len];
        reader.read_exact(&mut path)?;
        let path = String::from_utf8(path)
            .map_err(|e| RelayError::PathError(format!("invalid UTF-8 in path: {}", e)))?;

        Ok(Self {
            uncompressed_size,
            compressed_size,
            crc32,
            compression,
            path,
        })
    }

    pub fn encoded_len(path_len: usize) -> usize {
        4 + 8 + 8 + 4 + 2 + 2 + path_len
    }

    /// True when this header agrees with the directory record
    pub fn matches(&self, entry: &EntryInfo) -> bool {
        self.path == entry.path
            && self.compressed_size == entry.compressed_size
            && self.uncompressed_size == entry.uncompressed_size
            && self.crc32 == entry.crc32
    }
}

fn read_u16<R: Read>(mut reader: R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(mut reader: R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(mut reader: R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_method_from_u8() {
        assert_eq!(CompressionMethod::from_u8(0).unwrap(), CompressionMethod::None);
        assert_eq!(CompressionMethod::from_u8(1).unwrap(), CompressionMethod::Lz4);
        assert_eq!(CompressionMethod::from_u8(2).unwrap(), CompressionMethod::Zstd);
        assert!(matches!(
            CompressionMethod::from_u8(99),
            Err(RelayError::InvalidCompression(99))
        ));
    }

    #[test]
    fn test_compression_choice() {
        assert_eq!(CompressionMethod::choose_for_file("notes.txt", 5000), CompressionMethod::Zstd);
        assert_eq!(CompressionMethod::choose_for_file("disk.d64", 174848), CompressionMethod::Lz4);
        assert_eq!(CompressionMethod::choose_for_file("pic.PNG", 10000), CompressionMethod::None);
        assert_eq!(CompressionMethod::choose_for_file("notes.txt", 500), CompressionMethod::None);
    }

    #[test]
    fn test_compress_skips_incompressible() {
        let noise: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        assert!(CompressionMethod::Zstd.compress(&noise).unwrap().is_none());

        let text = b"READY.\n".repeat(1000);
        let packed = CompressionMethod::Lz4.compress(&text).unwrap().unwrap();
        assert_eq!(CompressionMethod::Lz4.decompress(packed).unwrap(), text);
    }

    #[test]
    fn test_header_size_and_validation() {
        let mut header = FileHeader::new();
        header.central_directory_offset = 1024;
        header.entry_count = 2;
        header.central_directory_size = 2 * CD_ENTRY_SIZE as u64;

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let parsed = FileHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed.entry_count, 2);

        header.central_directory_size = 7;
        let mut bad = Vec::new();
        header.write_to(&mut bad).unwrap();
        assert!(FileHeader::read_from(&bad[..]).is_err());
    }

    #[test]
    fn test_directory_entry_layout() {
        let entry = EntryInfo {
            path: "games/elite.d64".to_string(),
            data_offset: 64,
            uncompressed_size: 174848,
            compressed_size: 90000,
            crc32: 0xDEADBEEF,
            modified_time: 1699999999,
            compression: CompressionMethod::Lz4,
            flags: 0,
        };

        let mut buf = Vec::new();
        entry.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), CD_ENTRY_SIZE);

        let parsed = EntryInfo::read_from(&buf[..]).unwrap();
        assert_eq!(parsed.path, entry.path);
        assert_eq!(parsed.crc32, entry.crc32);
        assert_eq!(parsed.compression, CompressionMethod::Lz4);
    }

    #[test]
    fn test_local_header_matches_directory() {
        let local = LocalEntryHeader {
            uncompressed_size: 10,
            compressed_size: 10,
            crc32: 7,
            compression: CompressionMethod::None,
            path: "a.prg".to_string(),
        };
        let mut buf = Vec::new();
        let written = local.write_to(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(written, LocalEntryHeader::encoded_len(5));

        let parsed = LocalEntryHeader::read_from(&buf[..]).unwrap();
        let entry = EntryInfo {
            path: "a.prg".to_string(),
            data_offset: 64,
            uncompressed_size: 10,
            compressed_size: 10,
            crc32: 7,
            modified_time: 0,
            compression: CompressionMethod::None,
            flags: 0,
        };
        assert!(parsed.matches(&entry));
    }
}
