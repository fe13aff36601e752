//! Filesystem backends
//!
//! Each module pairs a [`Filesystem`](crate::vfs::Filesystem) with its file,
//! stream and session types. Protocols without a native client in this crate
//! (NFS, SMB, SFTP, FSP) plug a [`remote::RemoteConnector`] into the shared
//! remote layer.

pub mod digest;
pub mod fsp;
pub mod ftp;
pub mod http;
pub mod irc;
pub mod link;
pub mod local;
pub mod mdns;
pub mod memory;
pub mod mqtt;
pub mod nfs;
pub mod pubsub;
pub mod remote;
pub mod sftp;
pub mod smb;
pub mod tcp;
pub mod tnfs;
pub mod webdav;
