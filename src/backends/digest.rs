//! `digest:` pseudo-scheme
//!
//! `digest:<source-url>#algo=sha256` reads as the lowercase hex digest of
//! the source's content.

use crate::error::{Errno, RelayError, Result};
use crate::url::{CompositeUrl, Url};
use crate::vfs::{BufferStream, Filesystem, OpenMode, VFile, VStream, Vfs};
use sha2::{Digest, Sha256};
use tracing::debug;

const SHA256_HEX_LEN: u64 = 64;

/// Digest algorithms the scheme accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            other => Err(RelayError::errno(Errno::EINVAL, format!("unsupported digest algorithm: {}", other))),
        }
    }

    pub fn hex_len(self) -> u64 {
        match self {
            Self::Sha256 => SHA256_HEX_LEN,
        }
    }
}

/// Hex digest of a whole stream
pub fn digest_stream(stream: &mut dyn VStream, algorithm: DigestAlgorithm) -> Result<String> {
    match algorithm {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                hasher.update(&chunk[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[derive(Default)]
pub struct DigestFilesystem;

impl DigestFilesystem {
    pub fn new() -> Self {
        Self
    }
}

impl Filesystem for DigestFilesystem {
    fn name(&self) -> &str {
        "digest"
    }

    fn handles(&self, url: &Url) -> bool {
        url.scheme() == "digest"
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let composite = CompositeUrl::parse(&url.to_string())?;
        let algorithm = DigestAlgorithm::from_name(composite.param("algo").unwrap_or("sha256"))?;
        let source = vfs.get_file(&composite.source)?;
        Ok(Box::new(DigestFile {
            url: url.clone(),
            source,
            algorithm,
        }))
    }
}

pub struct DigestFile {
    url: Url,
    source: Box<dyn VFile>,
    algorithm: DigestAlgorithm,
}

impl VFile for DigestFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        self.source.exists()
    }

    fn is_directory(&mut self) -> bool {
        false
    }

    fn size(&mut self) -> u64 {
        self.algorithm.hex_len()
    }

    fn last_write(&mut self) -> Option<std::time::SystemTime> {
        self.source.last_write()
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        if mode.is_write() {
            return Err(RelayError::errno(Errno::EROFS, self.url.to_string()));
        }
        let mut source = self.source.source_stream(OpenMode::IN)?;
        let hex = digest_stream(source.as_mut(), self.algorithm)?;
        debug!(source = %self.source.url(), digest = %hex, "digest computed");
        Ok(Box::new(BufferStream::new(self.url.clone(), hex.into_bytes())))
    }
}
