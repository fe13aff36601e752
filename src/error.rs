use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for relayfs operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// POSIX-style error number recorded on streams
///
/// Values follow Linux so callers can branch on familiar codes regardless of
/// which backend produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Errno(pub i32);

impl Errno {
    pub const NONE: Errno = Errno(0);
    pub const EPERM: Errno = Errno(1);
    pub const ENOENT: Errno = Errno(2);
    pub const EIO: Errno = Errno(5);
    pub const EBADF: Errno = Errno(9);
    pub const ENOMEM: Errno = Errno(12);
    pub const EACCES: Errno = Errno(13);
    pub const EEXIST: Errno = Errno(17);
    pub const ENOTDIR: Errno = Errno(20);
    pub const EISDIR: Errno = Errno(21);
    pub const EINVAL: Errno = Errno(22);
    pub const ENOSPC: Errno = Errno(28);
    pub const ESPIPE: Errno = Errno(29);
    pub const EROFS: Errno = Errno(30);
    pub const ENOSYS: Errno = Errno(38);
    pub const ENOTEMPTY: Errno = Errno(39);
    pub const EPROTO: Errno = Errno(71);
    pub const ENOTCONN: Errno = Errno(107);
    pub const ETIMEDOUT: Errno = Errno(110);
    pub const ECONNREFUSED: Errno = Errno(111);

    /// True when no error has been recorded
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Map an `io::ErrorKind` onto the closest errno
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Errno(code);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::ENOENT,
            io::ErrorKind::PermissionDenied => Self::EACCES,
            io::ErrorKind::ConnectionRefused => Self::ECONNREFUSED,
            io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ENOTCONN,
            io::ErrorKind::AlreadyExists => Self::EEXIST,
            io::ErrorKind::InvalidInput => Self::EINVAL,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::ETIMEDOUT,
            io::ErrorKind::OutOfMemory => Self::ENOMEM,
            io::ErrorKind::Unsupported => Self::ENOSYS,
            _ => Self::EIO,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Errno::NONE => "OK",
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::EBADF => "EBADF",
            Errno::ENOMEM => "ENOMEM",
            Errno::EACCES => "EACCES",
            Errno::EEXIST => "EEXIST",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSPC => "ENOSPC",
            Errno::ESPIPE => "ESPIPE",
            Errno::EROFS => "EROFS",
            Errno::ENOSYS => "ENOSYS",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::EPROTO => "EPROTO",
            Errno::ENOTCONN => "ENOTCONN",
            Errno::ETIMEDOUT => "ETIMEDOUT",
            Errno::ECONNREFUSED => "ECONNREFUSED",
            Errno(other) => return write!(f, "errno {}", other),
        };
        f.write_str(name)
    }
}

/// Unified error type for all relayfs operations
#[derive(Debug, Error)]
pub enum RelayError {
    // Addressing errors
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No filesystem handles: {0}")]
    UnsupportedScheme(String),

    // Connection errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Session not connected: {0}")]
    NotConnected(String),

    #[error("Session {0} is registered with a different backend type")]
    SessionTypeMismatch(String),

    // Stream I/O errors
    #[error("{context}: {code}")]
    Errno { code: Errno, context: String },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    // Format errors
    #[error("Invalid archive format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Entry not found in archive: {0}")]
    EntryNotFound(String),

    #[error("Invalid compression method: {0}")]
    InvalidCompression(u8),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Path error: {0}")]
    PathError(String),

    // Resource errors
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Build an errno-carrying error
    pub fn errno(code: Errno, context: impl Into<String>) -> Self {
        RelayError::Errno {
            code,
            context: context.into(),
        }
    }

    /// The POSIX code a stream records for this failure
    pub fn code(&self) -> Errno {
        match self {
            RelayError::InvalidUrl(_) => Errno::EINVAL,
            RelayError::UnsupportedScheme(_) => Errno::ENOSYS,
            RelayError::ConnectionFailed(_) => Errno::ECONNREFUSED,
            RelayError::NotConnected(_) => Errno::ENOTCONN,
            RelayError::SessionTypeMismatch(_) => Errno::EINVAL,
            RelayError::Errno { code, .. } => *code,
            RelayError::HttpStatus { status, .. } => match status {
                401 | 403 => Errno::EACCES,
                404 | 410 => Errno::ENOENT,
                416 => Errno::EINVAL,
                _ => Errno::EIO,
            },
            RelayError::InvalidFormat(_)
            | RelayError::UnsupportedFormat(_)
            | RelayError::InvalidCompression(_)
            | RelayError::CompressionFailed(_)
            | RelayError::DecompressionFailed(_)
            | RelayError::CrcMismatch { .. } => Errno::EPROTO,
            RelayError::EntryNotFound(_) => Errno::ENOENT,
            RelayError::PathError(_) => Errno::EINVAL,
            RelayError::OutOfMemory { .. } => Errno::ENOMEM,
            RelayError::Io(err) => match err.get_ref().and_then(|e| e.downcast_ref::<RelayError>()) {
                Some(inner) => inner.code(),
                None => Errno::from_io(err),
            },
            RelayError::JsonError(_) | RelayError::TomlError(_) | RelayError::Config(_) => {
                Errno::EINVAL
            }
            RelayError::Other(_) => Errno::EIO,
        }
    }
}

/// Carry a relay error through `std::io` interfaces (decoders, `Read` impls)
impl From<RelayError> for io::Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Io(err) => err,
            other => {
                let kind = match other.code() {
                    Errno::ENOENT => io::ErrorKind::NotFound,
                    Errno::EACCES => io::ErrorKind::PermissionDenied,
                    Errno::EINVAL => io::ErrorKind::InvalidInput,
                    Errno::ETIMEDOUT => io::ErrorKind::TimedOut,
                    Errno::ENOTCONN => io::ErrorKind::NotConnected,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::TomlError(err.to_string())
    }
}

impl From<toml::ser::Error> for RelayError {
    fn from(err: toml::ser::Error) -> Self {
        RelayError::TomlError(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return RelayError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if err.is_connect() {
            return RelayError::ConnectionFailed(err.to_string());
        }
        if err.is_timeout() {
            return RelayError::errno(Errno::ETIMEDOUT, err.to_string());
        }
        RelayError::Other(format!("HTTP error: {}", err))
    }
}
