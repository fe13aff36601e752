//! relayfs: a virtual filesystem over pooled network sessions and archives
//!
//! Every resource is addressed by URL and reached through the same two
//! abstractions: a [`VFile`] for metadata and directory navigation and a
//! [`VStream`] for bytes. Network backends share long-lived connections
//! through the [`SessionBroker`]; archive entries are streamed out of their
//! container and materialised into [`CachedBuffer`]s.
//!
//! # Example
//!
//! ```no_run
//! use relayfs::{read_all, OpenMode, RelayConfig, Vfs};
//!
//! let vfs = Vfs::new(RelayConfig::default())?;
//!
//! // An entry inside a tarball served over HTTP
//! let mut stream = vfs.open("http://example.com/games.tar/elite.prg", OpenMode::IN)?;
//! let data = read_all(stream.as_mut())?;
//!
//! // Listing a directory
//! let mut dir = vfs.get_file("ftp://ftp.example.com/pub/")?;
//! while let Some(mut child) = dir.next_in_dir() {
//!     println!("{} {}", child.name(), child.size());
//! }
//! # Ok::<(), relayfs::RelayError>(())
//! ```

pub mod archive;
pub mod backends;
pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod url;
pub mod vfs;

pub use archive::{ArchiveEntry, ArchiveFormat, ArchiveReader, ArchiveWriter, ARCHIVE_EXTENSIONS};
pub use cache::{CachePolicy, CachedBuffer, CachedFile, PagedMemory};
pub use config::{ArchiveConfig, BrokerConfig, CacheConfig, HttpConfig, NetworkConfig, RelayConfig};
pub use error::{Errno, RelayError, Result};
pub use session::{Session, SessionBroker, SessionKey, SessionState};
pub use url::{CompositeUrl, Url};
pub use vfs::{read_all, write_all, Filesystem, OpenMode, VFile, VStream, Vfs, VfsBuilder};
