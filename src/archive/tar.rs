//! ustar headers
//!
//! Only what forward extraction needs: names (ustar prefix, GNU long names
//! and pax `path` records), sizes and the entry type. Data blocks are never
//! buffered here.

use crate::error::{RelayError, Result};

pub const BLOCK_SIZE: usize = 512;

/// What a header block describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarKind {
    File,
    Directory,
    /// Links, devices, fifos
    Special,
    /// GNU `L`: the data holds the name of the next entry
    LongName,
    /// pax `x`: the data holds records for the next entry
    Pax,
    /// pax `g` and other headers whose data is skipped
    Meta,
}

#[derive(Debug, Clone)]
pub struct TarHeader {
    pub name: String,
    pub size: u64,
    pub kind: TarKind,
}

impl TarHeader {
    /// Padding that follows `size` data bytes
    pub fn padding(size: u64) -> u64 {
        let rem = size % BLOCK_SIZE as u64;
        if rem == 0 {
            0
        } else {
            BLOCK_SIZE as u64 - rem
        }
    }
}

/// True when `block` looks like a ustar or GNU header
pub fn is_header(block: &[u8]) -> bool {
    block.len() >= BLOCK_SIZE && &block[257..262] == b"ustar"
}

/// Parse one header block; `None` for the zero block ending the archive
pub fn parse_header(block: &[u8]) -> Result<Option<TarHeader>> {
    if block.len() < BLOCK_SIZE {
        return Err(RelayError::InvalidFormat("short tar header".to_string()));
    }
    if block[..BLOCK_SIZE].iter().all(|b| *b == 0) {
        return Ok(None);
    }

    let stored = parse_octal(&block[148..156])
        .ok_or_else(|| RelayError::InvalidFormat("bad tar checksum field".to_string()))?;
    let actual = checksum(block);
    if stored != actual {
        return Err(RelayError::InvalidFormat(format!(
            "tar checksum {:o}, computed {:o}",
            stored, actual
        )));
    }

    let size = parse_size(&block[124..136])
        .ok_or_else(|| RelayError::InvalidFormat("bad tar size field".to_string()))?;

    let mut name = field_str(&block[0..100]);
    if is_header(block) {
        let prefix = field_str(&block[345..500]);
        if !prefix.is_empty() {
            name = format!("{}/{}", prefix, name);
        }
    }

    let kind = match block[156] {
        b'0' | 0 | b'7' => TarKind::File,
        b'5' => TarKind::Directory,
        b'1' | b'2' | b'3' | b'4' | b'6' => TarKind::Special,
        b'L' => TarKind::LongName,
        b'x' => TarKind::Pax,
        _ => TarKind::Meta,
    };
    // Old archives mark directories with a trailing slash only
    let kind = if kind == TarKind::File && name.ends_with('/') {
        TarKind::Directory
    } else {
        kind
    };

    Ok(Some(TarHeader {
        name: name.trim_end_matches('/').to_string(),
        size,
        kind,
    }))
}

/// `path` record of a pax extended header
pub fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest.iter().position(|b| *b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space || len > rest.len() {
            return None;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            return String::from_utf8(value.to_vec()).ok();
        }
        rest = &rest[len..];
    }
    None
}

/// Name stored in a GNU long-name block
pub fn long_name(data: &[u8]) -> String {
    field_str(data).trim_end_matches('/').to_string()
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = field_str(field);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(text, 8).ok()
}

fn parse_size(field: &[u8]) -> Option<u64> {
    // GNU base-256 for sizes beyond 8 GiB
    if field[0] & 0x80 != 0 {
        let mut value: u64 = (field[0] & 0x7f) as u64;
        for b in &field[1..] {
            value = value.checked_mul(256)?.checked_add(*b as u64)?;
        }
        return Some(value);
    }
    parse_octal(field)
}

fn checksum(block: &[u8]) -> u64 {
    block[..BLOCK_SIZE]
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { b' ' as u64 } else { *b as u64 })
        .sum()
}

/// Writes ustar archives in memory
#[derive(Debug, Default)]
pub struct TarBuilder {
    out: Vec<u8>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.header(name, data.len() as u64, b'0')?;
        self.out.extend_from_slice(data);
        let pad = TarHeader::padding(data.len() as u64) as usize;
        self.out.resize(self.out.len() + pad, 0);
        Ok(())
    }

    pub fn add_dir(&mut self, name: &str) -> Result<()> {
        self.header(&format!("{}/", name.trim_end_matches('/')), 0, b'5')
    }

    /// Append the two terminating zero blocks
    pub fn finish(mut self) -> Vec<u8> {
        self.out.resize(self.out.len() + 2 * BLOCK_SIZE, 0);
        self.out
    }

    fn header(&mut self, name: &str, size: u64, kind: u8) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() > 100 {
            return Err(RelayError::PathError(format!("tar name too long: {}", name)));
        }
        let mut block = [0u8; BLOCK_SIZE];
        block[..bytes.len()].copy_from_slice(bytes);
        write_octal(&mut block[100..108], 0o644);
        write_octal(&mut block[108..116], 0);
        write_octal(&mut block[116..124], 0);
        write_octal(&mut block[124..136], size);
        write_octal(&mut block[136..148], 0);
        block[156] = kind;
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        let sum = checksum(&block);
        write_octal(&mut block[148..155], sum);
        block[155] = b' ';
        self.out.extend_from_slice(&block);
        Ok(())
    }
}

fn write_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{:0width$o}", value, width = digits);
    field[..digits].copy_from_slice(&text.as_bytes()[text.len() - digits..]);
    field[digits] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_headers_parse() {
        let mut builder = TarBuilder::new();
        builder.add_dir("games").unwrap();
        builder.add_file("games/elite.prg", &[1u8; 700]).unwrap();
        let bytes = builder.finish();
        assert_eq!(bytes.len(), 512 + 512 + 1024 + 1024);

        let dir = parse_header(&bytes[..512]).unwrap().unwrap();
        assert_eq!(dir.kind, TarKind::Directory);
        assert_eq!(dir.name, "games");
        assert!(is_header(&bytes[..512]));

        let file = parse_header(&bytes[512..1024]).unwrap().unwrap();
        assert_eq!(file.kind, TarKind::File);
        assert_eq!(file.name, "games/elite.prg");
        assert_eq!(file.size, 700);
        assert_eq!(TarHeader::padding(700), 324);

        assert!(parse_header(&bytes[2048..2560]).unwrap().is_none());
    }

    #[test]
    fn test_checksum_detects_damage() {
        let mut builder = TarBuilder::new();
        builder.add_file("a", b"x").unwrap();
        let mut bytes = builder.finish();
        bytes[3] = b'Z';
        assert!(parse_header(&bytes[..512]).is_err());
    }

    #[test]
    fn test_pax_path_record() {
        let record = b"32 path=very/long/name/here.d64\n20 mtime=1700000000\n";
        assert_eq!(pax_path(record).as_deref(), Some("very/long/name/here.d64"));
        assert_eq!(pax_path(b"garbage"), None);
    }

    #[test]
    fn test_base256_size() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[11] = 0x01;
        field[10] = 0x02;
        assert_eq!(parse_size(&field), Some(0x0201));
    }
}
