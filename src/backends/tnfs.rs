//! TNFS client
//!
//! The Trivial Network File System runs over UDP. Every request carries the
//! connection id assigned at mount time, a sequence number and a command
//! byte; replies echo all three followed by a status byte. A request whose
//! reply does not arrive in time is resent with the same sequence number.

use crate::backends::remote::{
    OpenFlags, RemoteClient, RemoteConnector, RemoteEntry, RemoteFilesystem, RemoteProfile, RemoteStat,
    RemoteTarget,
};
use crate::config::NetworkConfig;
use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use crate::vfs::{Filesystem, VFile, Vfs};
use std::collections::HashMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

pub const TNFS_PORT: u16 = 16384;

/// Protocol version sent at mount (1.2)
pub const PROTOCOL_VERSION: u16 = 0x0102;

/// Largest payload of one read or write
pub const MAX_IO: usize = 512;

pub const CMD_MOUNT: u8 = 0x00;
pub const CMD_UMOUNT: u8 = 0x01;
pub const CMD_OPENDIR: u8 = 0x10;
pub const CMD_READDIR: u8 = 0x11;
pub const CMD_CLOSEDIR: u8 = 0x12;
pub const CMD_MKDIR: u8 = 0x13;
pub const CMD_RMDIR: u8 = 0x14;
pub const CMD_READ: u8 = 0x21;
pub const CMD_WRITE: u8 = 0x22;
pub const CMD_CLOSE: u8 = 0x23;
pub const CMD_STAT: u8 = 0x24;
pub const CMD_LSEEK: u8 = 0x25;
pub const CMD_UNLINK: u8 = 0x26;
pub const CMD_RENAME: u8 = 0x28;
pub const CMD_OPEN: u8 = 0x29;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_EOF: u8 = 0x21;

pub const O_RDONLY: u16 = 0x0001;
pub const O_WRONLY: u16 = 0x0002;
pub const O_RDWR: u16 = 0x0003;
pub const O_APPEND: u16 = 0x0008;
pub const O_CREAT: u16 = 0x0100;
pub const O_TRUNC: u16 = 0x0200;

pub const S_IFDIR: u16 = 0o040000;

pub const TNFS: RemoteProfile = RemoteProfile {
    scheme: "tnfs",
    default_port: TNFS_PORT,
    rooted: false,
    wildcards: true,
    skip_hidden: false,
};

/// Translate open flags to their wire values
pub fn wire_flags(flags: OpenFlags) -> u16 {
    let mut wire = match flags.access() {
        OpenFlags::WRONLY => O_WRONLY,
        OpenFlags::RDWR => O_RDWR,
        _ => O_RDONLY,
    };
    if flags.has(OpenFlags::APPEND) {
        wire |= O_APPEND;
    }
    if flags.has(OpenFlags::CREAT) {
        wire |= O_CREAT;
    }
    if flags.has(OpenFlags::TRUNC) {
        wire |= O_TRUNC;
    }
    wire
}

/// Map a reply status onto an errno. Status values below EOF share Linux
/// numbering.
pub fn status_errno(status: u8) -> Errno {
    match status {
        STATUS_OK => Errno::NONE,
        1..=0x20 => Errno(status as i32),
        _ => Errno::EIO,
    }
}

/// One decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub connection: u16,
    pub sequence: u8,
    pub command: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

impl Reply {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < 5 {
            return Err(RelayError::errno(Errno::EPROTO, "short TNFS reply"));
        }
        Ok(Self {
            connection: u16::from_le_bytes([packet[0], packet[1]]),
            sequence: packet[2],
            command: packet[3],
            status: packet[4],
            data: packet[5..].to_vec(),
        })
    }

    fn check(&self, context: &str) -> Result<()> {
        match self.status {
            STATUS_OK => Ok(()),
            status => Err(RelayError::errno(status_errno(status), context.to_string())),
        }
    }
}

/// Encode a request packet
pub fn encode_request(connection: u16, sequence: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.extend_from_slice(&connection.to_le_bytes());
    packet.push(sequence);
    packet.push(command);
    packet.extend_from_slice(payload);
    packet
}

fn push_str(payload: &mut Vec<u8>, value: &str) {
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
}

fn le_u16(data: &[u8], at: usize) -> Result<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| RelayError::errno(Errno::EPROTO, "truncated TNFS reply"))
}

fn le_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| RelayError::errno(Errno::EPROTO, "truncated TNFS reply"))
}

/// Mounted TNFS connection
pub struct TnfsClient {
    socket: UdpSocket,
    connection: u16,
    sequence: u8,
    retries: u32,
    /// Server-side position of each open descriptor
    positions: HashMap<u8, u64>,
}

impl TnfsClient {
    /// Mount `/` on the server
    pub fn mount(target: &RemoteTarget, config: &NetworkConfig) -> Result<Self> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::ConnectionFailed(format!("cannot resolve {}", target.host)))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;

        let retries = config.tnfs_retries.max(1);
        let attempt = config.io_timeout() / retries;
        socket.set_read_timeout(Some(attempt.max(Duration::from_millis(50))))?;

        let mut client = Self {
            socket,
            connection: 0,
            sequence: 0,
            retries,
            positions: HashMap::new(),
        };

        let mut payload = PROTOCOL_VERSION.to_le_bytes().to_vec();
        push_str(&mut payload, "/");
        push_str(&mut payload, target.user.as_deref().unwrap_or(""));
        push_str(&mut payload, target.password.as_deref().unwrap_or(""));
        let reply = client.request(CMD_MOUNT, &payload).map_err(|err| match err.code() {
            Errno::ETIMEDOUT => RelayError::ConnectionFailed(format!("{} did not answer mount", addr)),
            _ => err,
        })?;
        reply.check("mount")?;
        client.connection = reply.connection;
        debug!(server = %addr, connection = client.connection, "tnfs mounted");
        Ok(client)
    }

    pub fn connection_id(&self) -> u16 {
        self.connection
    }

    /// Send one request and wait for the matching reply, resending on timeout
    fn request(&mut self, command: u8, payload: &[u8]) -> Result<Reply> {
        self.sequence = self.sequence.wrapping_add(1);
        let packet = encode_request(self.connection, self.sequence, command, payload);
        let mut buf = [0u8; 1024];

        for attempt in 0..self.retries {
            if attempt > 0 {
                trace!(command, attempt, "tnfs resend");
            }
            self.socket.send(&packet)?;
            loop {
                match self.socket.recv(&mut buf) {
                    Ok(n) => {
                        let reply = Reply::parse(&buf[..n])?;
                        // Late replies to earlier requests are dropped
                        if reply.sequence == self.sequence && reply.command == command {
                            return Ok(reply);
                        }
                    }
                    Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                    Err(err) => return Err(RelayError::errno(Errno::ENOTCONN, err.to_string())),
                }
            }
        }
        warn!(command, retries = self.retries, "tnfs request timed out");
        Err(RelayError::errno(Errno::ETIMEDOUT, format!("tnfs command {:#04x}", command)))
    }

    fn path_request(&mut self, command: u8, path: &str) -> Result<Reply> {
        let mut payload = Vec::with_capacity(path.len() + 1);
        push_str(&mut payload, path);
        let reply = self.request(command, &payload)?;
        reply.check(path)?;
        Ok(reply)
    }

    fn fd(handle: u64) -> Result<u8> {
        u8::try_from(handle).map_err(|_| RelayError::errno(Errno::EBADF, format!("handle {}", handle)))
    }

    fn lseek(&mut self, fd: u8, offset: u64) -> Result<()> {
        if self.positions.get(&fd) == Some(&offset) {
            return Ok(());
        }
        let offset32 = u32::try_from(offset)
            .map_err(|_| RelayError::errno(Errno::EINVAL, format!("offset {} out of range", offset)))?;
        let mut payload = vec![fd, 0];
        payload.extend_from_slice(&offset32.to_le_bytes());
        self.request(CMD_LSEEK, &payload)?.check("lseek")?;
        self.positions.insert(fd, offset);
        Ok(())
    }
}

impl RemoteClient for TnfsClient {
    fn stat(&mut self, path: &str) -> Result<RemoteStat> {
        let reply = self.path_request(CMD_STAT, path)?;
        let mode = le_u16(&reply.data, 0)?;
        let size = le_u32(&reply.data, 6)?;
        let mtime = le_u32(&reply.data, 14).unwrap_or(0);
        Ok(RemoteStat {
            size: size as u64,
            is_dir: mode & S_IFDIR != 0,
            modified: (mtime > 0).then(|| UNIX_EPOCH + Duration::from_secs(mtime as u64)),
        })
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let reply = self.path_request(CMD_OPENDIR, path)?;
        let handle = *reply
            .data
            .first()
            .ok_or_else(|| RelayError::errno(Errno::EPROTO, "opendir without handle"))?;

        let mut names = Vec::new();
        let result = loop {
            let reply = match self.request(CMD_READDIR, &[handle]) {
                Ok(reply) => reply,
                Err(err) => break Err(err),
            };
            match reply.status {
                STATUS_OK => {
                    let end = reply.data.iter().position(|b| *b == 0).unwrap_or(reply.data.len());
                    names.push(String::from_utf8_lossy(&reply.data[..end]).into_owned());
                }
                STATUS_EOF => break Ok(()),
                status => break Err(RelayError::errno(status_errno(status), format!("readdir {}", path))),
            }
        };
        let _ = self.request(CMD_CLOSEDIR, &[handle]);
        result?;

        let base = path.trim_end_matches('/');
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            if name == "." || name == ".." {
                continue;
            }
            let stat = self.stat(&format!("{}/{}", base, name))?;
            entries.push(RemoteEntry {
                name,
                is_dir: stat.is_dir,
                size: stat.size,
            });
        }
        Ok(entries)
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<u64> {
        let mut payload = wire_flags(flags).to_le_bytes().to_vec();
        payload.extend_from_slice(&0o644u16.to_le_bytes());
        push_str(&mut payload, path);
        let reply = self.request(CMD_OPEN, &payload)?;
        reply.check(path)?;
        let fd = *reply
            .data
            .first()
            .ok_or_else(|| RelayError::errno(Errno::EPROTO, "open without descriptor"))?;
        self.positions.insert(fd, 0);
        Ok(fd as u64)
    }

    fn read(&mut self, handle: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let fd = Self::fd(handle)?;
        self.lseek(fd, offset)?;
        let want = buf.len().min(MAX_IO) as u16;
        let mut payload = vec![fd];
        payload.extend_from_slice(&want.to_le_bytes());
        let reply = self.request(CMD_READ, &payload)?;
        if reply.status == STATUS_EOF {
            return Ok(0);
        }
        reply.check("read")?;
        let count = le_u16(&reply.data, 0)? as usize;
        let data = reply
            .data
            .get(2..2 + count)
            .ok_or_else(|| RelayError::errno(Errno::EPROTO, "read reply shorter than its count"))?;
        let n = count.min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.positions.insert(fd, offset + n as u64);
        Ok(n)
    }

    fn write(&mut self, handle: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let fd = Self::fd(handle)?;
        self.lseek(fd, offset)?;
        let chunk = &data[..data.len().min(MAX_IO)];
        let mut payload = vec![fd];
        payload.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        payload.extend_from_slice(chunk);
        let reply = self.request(CMD_WRITE, &payload)?;
        reply.check("write")?;
        let n = le_u16(&reply.data, 0)? as usize;
        self.positions.insert(fd, offset + n as u64);
        Ok(n)
    }

    fn close(&mut self, handle: u64) -> Result<()> {
        let fd = Self::fd(handle)?;
        self.positions.remove(&fd);
        self.request(CMD_CLOSE, &[fd])?.check("close")
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.path_request(CMD_MKDIR, path).map(|_| ())
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        self.path_request(CMD_RMDIR, path).map(|_| ())
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.path_request(CMD_UNLINK, path).map(|_| ())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let mut payload = Vec::new();
        push_str(&mut payload, from);
        push_str(&mut payload, to);
        self.request(CMD_RENAME, &payload)?.check(from)
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.request(CMD_UMOUNT, &[]) {
            debug!(error = %err, "tnfs umount failed");
        }
    }
}

/// Mounts TNFS servers with the configured timeouts
pub struct TnfsConnector {
    config: NetworkConfig,
}

impl TnfsConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl RemoteConnector for TnfsConnector {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteClient>> {
        Ok(Box::new(TnfsClient::mount(target, &self.config)?))
    }
}

pub struct TnfsFilesystem {
    inner: RemoteFilesystem,
}

impl TnfsFilesystem {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            inner: RemoteFilesystem::new(TNFS, Arc::new(TnfsConnector::new(config))),
        }
    }
}

impl Filesystem for TnfsFilesystem {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handles(&self, url: &Url) -> bool {
        self.inner.handles(url)
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        self.inner.get_file(vfs, url)
    }
}

/// Seconds since the epoch, as carried in stat replies
pub fn wire_time(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}
