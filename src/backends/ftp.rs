//! FTP client
//!
//! Passive-mode data connections, binary transfers. A control connection
//! carries one transfer at a time, so an open stream takes a control
//! connection of its own from the session: the idle session connection when
//! there is one, otherwise a parked or newly logged-in one. Closing the
//! stream hands it back.

use crate::config::NetworkConfig;
use crate::error::{Errno, RelayError, Result};
use crate::session::{Session, SessionKey, SessionState};
use crate::url::Url;
use crate::vfs::{DirCursor, Filesystem, OpenMode, StreamCore, VFile, VStream, Vfs};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

pub const FTP_PORT: u16 = 21;

/// A reply: code and the text of its last line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub text: String,
}

impl FtpReply {
    pub fn is_positive(&self) -> bool {
        (100..400).contains(&self.code)
    }
}

/// One `LIST` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Parse a Unix `ls -l` or MS-DOS style listing line
pub fn parse_list_line(line: &str) -> Option<FtpEntry> {
    let line = line.trim_end();
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() >= 9 && matches!(fields[0].chars().next(), Some('d' | '-' | 'l')) {
        let mut rest = line;
        for _ in 0..8 {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace)?;
            rest = &rest[end..];
        }
        let mut name = rest.trim_start();
        if fields[0].starts_with('l') {
            name = name.split(" -> ").next().unwrap_or(name);
        }
        return Some(FtpEntry {
            name: name.to_string(),
            is_dir: fields[0].starts_with('d'),
            size: fields[4].parse().unwrap_or(0),
        });
    }
    // 01-31-24  09:15PM       <DIR>          games
    if fields.len() >= 4 && fields[0].contains('-') && fields[1].contains(':') {
        let mut rest = line;
        for _ in 0..3 {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace)?;
            rest = &rest[end..];
        }
        let is_dir = fields[2].eq_ignore_ascii_case("<DIR>");
        return Some(FtpEntry {
            name: rest.trim_start().to_string(),
            is_dir,
            size: if is_dir { 0 } else { fields[2].parse().unwrap_or(0) },
        });
    }
    None
}

/// Address from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
pub fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let numbers: Vec<u16> = text[open + 1..close]
        .split(',')
        .map(|n| n.trim().parse().ok())
        .collect::<Option<Vec<u16>>>()?;
    if numbers.len() != 6 || numbers.iter().any(|n| *n > 255) {
        return None;
    }
    let ip = format!("{}.{}.{}.{}", numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = numbers[4] * 256 + numbers[5];
    format!("{}:{}", ip, port).parse().ok()
}

/// `YYYYMMDDhhmmss` from an `MDTM` reply, UTC
pub fn parse_mdtm(text: &str) -> Option<SystemTime> {
    let digits = text.trim().get(..14)?;
    let time = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?;
    Some(SystemTime::from(time.and_utc()))
}

/// Control connection
pub struct FtpControl {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    timeout: Duration,
}

impl FtpControl {
    /// Connect, log in (anonymous without credentials) and switch to binary
    pub fn open(host: &str, port: u16, user: Option<&str>, password: Option<&str>, config: &NetworkConfig) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::ConnectionFailed(format!("cannot resolve {}", host)))?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|err| RelayError::ConnectionFailed(format!("{}: {}", addr, err)))?;
        stream.set_read_timeout(Some(config.io_timeout()))?;
        stream.set_write_timeout(Some(config.io_timeout()))?;
        let mut control = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            timeout: config.io_timeout(),
        };

        let greeting = control.reply()?;
        if greeting.code != 220 {
            return Err(RelayError::ConnectionFailed(format!("greeting {} {}", greeting.code, greeting.text)));
        }
        let user = user.unwrap_or("anonymous");
        let login = control.command(&format!("USER {}", user))?;
        if login.code == 331 {
            let pass = control.command(&format!("PASS {}", password.unwrap_or("relayfs@")))?;
            if pass.code != 230 && pass.code != 202 {
                return Err(RelayError::errno(Errno::EACCES, format!("login as {}: {}", user, pass.text)));
            }
        } else if login.code != 230 {
            return Err(RelayError::errno(Errno::EACCES, format!("login as {}: {}", user, login.text)));
        }
        control.expect("TYPE I", &[200])?;
        debug!(server = %addr, user, "ftp logged in");
        Ok(control)
    }

    fn reply(&mut self) -> Result<FtpReply> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(|err| RelayError::errno(Errno::ENOTCONN, err.to_string()))?;
        if read == 0 {
            return Err(RelayError::errno(Errno::ENOTCONN, "control connection closed"));
        }
        let code: u16 = line
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| RelayError::errno(Errno::EPROTO, format!("bad reply: {}", line.trim_end())))?;
        // Multi-line replies run until "<code> "
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                line.clear();
                let read = self.reader.read_line(&mut line)?;
                if read == 0 {
                    return Err(RelayError::errno(Errno::ENOTCONN, "control connection closed"));
                }
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }
        let text = line.get(4..).unwrap_or("").trim_end().to_string();
        trace!(code, text = %text, "ftp reply");
        Ok(FtpReply { code, text })
    }

    pub fn command(&mut self, line: &str) -> Result<FtpReply> {
        let shown = if line.starts_with("PASS ") { "PASS ****" } else { line };
        trace!(command = shown, "ftp command");
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .map_err(|err| RelayError::errno(Errno::ENOTCONN, err.to_string()))?;
        self.reply()
    }

    fn expect(&mut self, line: &str, codes: &[u16]) -> Result<FtpReply> {
        let reply = self.command(line)?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply_error(line, &reply))
        }
    }

    fn passive(&mut self) -> Result<TcpStream> {
        let reply = self.expect("PASV", &[227])?;
        let addr = parse_pasv(&reply.text)
            .ok_or_else(|| RelayError::errno(Errno::EPROTO, format!("bad PASV reply: {}", reply.text)))?;
        let data = TcpStream::connect_timeout(&addr, self.timeout)?;
        data.set_read_timeout(Some(self.timeout))?;
        data.set_write_timeout(Some(self.timeout))?;
        Ok(data)
    }

    /// Open a data connection for `command`; the caller reads the final
    /// reply with [`finish`](Self::finish)
    fn transfer(&mut self, command: &str, offset: u64) -> Result<TcpStream> {
        let data = self.passive()?;
        if offset > 0 {
            self.expect(&format!("REST {}", offset), &[350])?;
        }
        self.expect(command, &[125, 150])?;
        Ok(data)
    }

    /// Consume the reply closing a transfer
    pub fn finish(&mut self) -> Result<FtpReply> {
        let reply = self.reply()?;
        if reply.code == 426 {
            // Aborted by closing the data connection early
            return Ok(reply);
        }
        if !reply.is_positive() {
            return Err(reply_error("transfer", &reply));
        }
        Ok(reply)
    }

    pub fn size(&mut self, path: &str) -> Option<u64> {
        let reply = self.command(&format!("SIZE {}", path)).ok()?;
        if reply.code == 213 {
            reply.text.trim().parse().ok()
        } else {
            None
        }
    }

    pub fn modified(&mut self, path: &str) -> Option<SystemTime> {
        let reply = self.command(&format!("MDTM {}", path)).ok()?;
        if reply.code == 213 {
            parse_mdtm(&reply.text)
        } else {
            None
        }
    }

    /// True when `path` is a directory; the working directory is restored
    pub fn is_dir(&mut self, path: &str) -> Result<bool> {
        let reply = self.command(&format!("CWD {}", path))?;
        if reply.code == 250 {
            self.command("CWD /")?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn list(&mut self, path: &str) -> Result<Vec<FtpEntry>> {
        let mut data = self.transfer(&format!("LIST {}", path), 0)?;
        let mut text = String::new();
        let read = data.read_to_string(&mut text);
        drop(data);
        self.finish()?;
        read?;
        Ok(text.lines().filter_map(parse_list_line).collect())
    }

    pub fn noop(&mut self) -> bool {
        matches!(self.command("NOOP"), Ok(reply) if reply.code == 200)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.expect(&format!("MKD {}", path), &[257]).map(|_| ())
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.expect(&format!("DELE {}", path), &[250]).map(|_| ())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.expect(&format!("RMD {}", path), &[250]).map(|_| ())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.expect(&format!("RNFR {}", from), &[350])?;
        self.expect(&format!("RNTO {}", to), &[250]).map(|_| ())
    }

    pub fn quit(&mut self) {
        let _ = self.command("QUIT");
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

fn reply_error(command: &str, reply: &FtpReply) -> RelayError {
    let verb = command.split_whitespace().next().unwrap_or(command);
    let code = match reply.code {
        421 => Errno::ENOTCONN,
        530 | 532 => Errno::EACCES,
        550 => Errno::ENOENT,
        552 => Errno::ENOSPC,
        553 => Errno::EINVAL,
        _ => Errno::EIO,
    };
    RelayError::errno(code, format!("{}: {} {}", verb, reply.code, reply.text))
}

/// Parked transfer connections kept per session
const MAX_SPARE: usize = 2;

pub struct FtpSession {
    state: SessionState,
    config: NetworkConfig,
    user: Option<String>,
    password: Option<String>,
    /// Connection for command exchanges; lent to a stream when idle
    control: Mutex<Option<FtpControl>>,
    spare: Mutex<Vec<FtpControl>>,
    lent: AtomicUsize,
}

impl FtpSession {
    pub fn new(key: SessionKey, url: &Url, config: NetworkConfig) -> Self {
        Self {
            state: SessionState::new(key),
            config,
            user: url.user().map(str::to_string),
            password: url.password().map(str::to_string),
            control: Mutex::new(None),
            spare: Mutex::new(Vec::new()),
            lent: AtomicUsize::new(0),
        }
    }

    fn login(&self) -> Result<FtpControl> {
        let key = self.key();
        FtpControl::open(
            key.host(),
            key.port(),
            self.user.as_deref(),
            self.password.as_deref(),
            &self.config,
        )
    }

    /// Run a command exchange on the control connection.
    ///
    /// The lock is held for this exchange only. When a stream has borrowed
    /// the connection a parked or freshly logged-in one takes its place.
    pub fn with_control<R>(&self, op: impl FnOnce(&mut FtpControl) -> Result<R>) -> Result<R> {
        if !self.state.is_connected() {
            return Err(RelayError::NotConnected(self.key().to_string()));
        }
        let _io = self.state.begin_io();
        let mut slot = self.control.lock();
        if slot.is_none() {
            let parked = self.spare.lock().pop();
            let control = match parked {
                Some(control) => control,
                None => {
                    debug!(key = %self.key(), "control connection busy, logging in again");
                    self.login()?
                }
            };
            *slot = Some(control);
        }
        let control = slot
            .as_mut()
            .ok_or_else(|| RelayError::NotConnected(self.key().to_string()))?;
        let result = op(control);
        self.note(&result);
        result
    }

    /// A control connection owned by a stream until [`checkin`](Self::checkin)
    fn checkout(&self) -> Result<FtpControl> {
        if !self.state.is_connected() {
            return Err(RelayError::NotConnected(self.key().to_string()));
        }
        let idle = self.control.try_lock().and_then(|mut slot| slot.take());
        let control = match idle {
            Some(control) => control,
            None => {
                let parked = self.spare.lock().pop();
                match parked {
                    Some(control) => control,
                    None => {
                        debug!(key = %self.key(), "extra control connection for a transfer");
                        self.login()?
                    }
                }
            }
        };
        self.lent.fetch_add(1, Ordering::AcqRel);
        Ok(control)
    }

    /// Return a stream's connection; broken ones are dropped
    fn checkin(&self, mut control: FtpControl, healthy: bool) {
        self.lent.fetch_sub(1, Ordering::AcqRel);
        if !healthy || !self.state.is_connected() {
            control.quit();
            return;
        }
        let mut slot = self.control.lock();
        if slot.is_none() {
            *slot = Some(control);
            return;
        }
        drop(slot);
        let mut spare = self.spare.lock();
        if spare.len() < MAX_SPARE {
            spare.push(control);
        } else {
            drop(spare);
            control.quit();
        }
    }

    /// Connections currently owned by open streams
    pub fn lent(&self) -> usize {
        self.lent.load(Ordering::Acquire)
    }

    fn note<R>(&self, result: &Result<R>) {
        if let Err(err) = result {
            if err.code() == Errno::ENOTCONN {
                warn!(key = %self.key(), error = %err, "control connection lost");
                self.state.set_connected(false);
            }
        }
    }
}

impl Session for FtpSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn connect(&self) -> Result<()> {
        let control = self.login()?;
        *self.control.lock() = Some(control);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set_connected(false);
        if let Some(mut control) = self.control.lock().take() {
            control.quit();
        }
        for mut control in self.spare.lock().drain(..) {
            control.quit();
        }
    }

    fn keep_alive(&self) -> bool {
        let Some(mut slot) = self.control.try_lock() else {
            return true;
        };
        let alive = match slot.as_mut() {
            Some(control) => control.noop(),
            // Lent to a stream that is mid-transfer
            None => self.lent() > 0,
        };
        if !alive {
            self.state.set_connected(false);
        }
        alive
    }
}

pub struct FtpFilesystem {
    config: NetworkConfig,
}

impl FtpFilesystem {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl Filesystem for FtpFilesystem {
    fn name(&self) -> &str {
        "ftp"
    }

    fn handles(&self, url: &Url) -> bool {
        url.scheme() == "ftp"
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let config = self.config.clone();
        let key = SessionKey::from_url("ftp", url, FTP_PORT);
        let owner = url.clone();
        let session = vfs
            .broker()
            .obtain(key, move |key| FtpSession::new(key, &owner, config))?;
        Ok(Box::new(FtpFile::new(url.clone(), session)))
    }
}

#[derive(Debug, Clone, Copy)]
struct FtpStat {
    is_dir: bool,
    size: u64,
}

pub struct FtpFile {
    url: Url,
    path: String,
    session: Arc<FtpSession>,
    stat: Option<Option<FtpStat>>,
    children: DirCursor<FtpEntry>,
}

impl FtpFile {
    pub fn new(url: Url, session: Arc<FtpSession>) -> Self {
        let decoded = url.decoded_path();
        let path = match decoded.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self {
            url,
            path,
            session,
            stat: None,
            children: DirCursor::new(),
        }
    }

    fn stat(&mut self) -> Option<FtpStat> {
        if let Some(stat) = self.stat {
            return stat;
        }
        let path = self.path.clone();
        let stat = self
            .session
            .with_control(|control| {
                if let Some(size) = control.size(&path) {
                    return Ok(Some(FtpStat { is_dir: false, size }));
                }
                if control.is_dir(&path)? {
                    return Ok(Some(FtpStat { is_dir: true, size: 0 }));
                }
                Ok(None)
            })
            .unwrap_or(None);
        self.stat = Some(stat);
        stat
    }
}

impl VFile for FtpFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        self.path == "/" || self.stat().is_some()
    }

    fn is_directory(&mut self) -> bool {
        self.path == "/" || self.stat().map(|s| s.is_dir).unwrap_or(false)
    }

    fn size(&mut self) -> u64 {
        self.stat().map(|s| s.size).unwrap_or(0)
    }

    fn last_write(&mut self) -> Option<SystemTime> {
        let path = self.path.clone();
        self.session.with_control(|control| Ok(control.modified(&path))).ok().flatten()
    }

    fn mkdir(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.stat = None;
        self.session.with_control(|control| control.mkdir(&path))
    }

    fn remove(&mut self) -> Result<()> {
        let directory = self.is_directory();
        let path = self.path.clone();
        self.stat = None;
        self.session.with_control(|control| {
            if directory {
                control.rmdir(&path)
            } else {
                control.delete(&path)
            }
        })
    }

    fn rename(&mut self, dest: &str) -> Result<()> {
        let target = if dest.starts_with('/') {
            dest.to_string()
        } else {
            let parent = self.path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            format!("{}/{}", parent, dest)
        };
        let from = self.path.clone();
        self.session.with_control(|control| control.rename(&from, &target))?;
        self.path = target;
        self.stat = None;
        Ok(())
    }

    fn rewind_directory(&mut self) -> Result<()> {
        if !self.is_directory() {
            return Err(RelayError::errno(Errno::ENOTDIR, self.url.to_string()));
        }
        let path = self.path.clone();
        let entries = self.session.with_control(|control| control.list(&path))?;
        self.children.reset(
            entries
                .into_iter()
                .filter(|entry| !entry.name.starts_with('.'))
                .collect(),
        );
        Ok(())
    }

    fn next_in_dir(&mut self) -> Option<Box<dyn VFile>> {
        if !self.children.is_loaded() {
            self.rewind_directory().ok()?;
        }
        let entry = self.children.next_entry()?.clone();
        let mut child = FtpFile::new(self.url.join(&entry.name), self.session.clone());
        child.stat = Some(Some(FtpStat {
            is_dir: entry.is_dir,
            size: entry.size,
        }));
        Some(Box::new(child))
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        let mut stream = FtpStream::new(self.url.clone(), self.path.clone(), self.session.clone());
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

/// RETR/STOR transfer; seeking restarts the download with `REST`
///
/// The stream owns a control connection for its lifetime, so other files
/// and streams on the session keep working while it is open.
pub struct FtpStream {
    core: StreamCore,
    path: String,
    session: Arc<FtpSession>,
    control: Option<FtpControl>,
    data: Option<TcpStream>,
    /// The owned control connection failed and must not be reused
    broken: bool,
}

impl FtpStream {
    pub fn new(url: Url, path: String, session: Arc<FtpSession>) -> Self {
        Self {
            core: StreamCore::new(url),
            path,
            session,
            control: None,
            data: None,
            broken: false,
        }
    }

    /// Run an exchange on the owned control connection
    fn exchange<R>(&mut self, op: impl FnOnce(&mut FtpControl) -> Result<R>) -> Result<R> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| RelayError::errno(Errno::EBADF, "no control connection"))?;
        let result = op(control);
        if let Err(err) = &result {
            if err.code() == Errno::ENOTCONN {
                self.broken = true;
            }
        }
        result
    }

    /// Close the data connection and read the transfer's final reply
    fn end_transfer(&mut self) -> Result<()> {
        let Some(data) = self.data.take() else {
            return Ok(());
        };
        let _ = data.shutdown(Shutdown::Both);
        drop(data);
        self.exchange(|control| control.finish().map(|_| ()))
    }

    fn start_download(&mut self, offset: u64) -> Result<()> {
        let command = format!("RETR {}", self.path);
        let data = self.exchange(|control| control.transfer(&command, offset))?;
        self.data = Some(data);
        self.core.position = offset;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(control) = self.control.take() {
            self.session.checkin(control, !self.broken);
        }
        self.broken = false;
    }

    fn check(&mut self) -> Result<()> {
        self.core.require_open()?;
        if !self.session.is_connected() {
            return self.core.fail(RelayError::NotConnected(self.session.key().to_string()));
        }
        Ok(())
    }

    fn open_inner(&mut self, mode: OpenMode) -> Result<()> {
        self.control = Some(self.session.checkout()?);
        let path = self.path.clone();
        let size = self.exchange(|control| Ok(control.size(&path)))?;
        self.core.mode = mode;
        if mode.is_write() {
            let append = mode.is_append();
            let verb = if append { "APPE" } else { "STOR" };
            let command = format!("{} {}", verb, path);
            let data = self.exchange(|control| control.transfer(&command, 0))?;
            self.data = Some(data);
            self.core.size = if append { size.unwrap_or(0) } else { 0 };
            self.core.position = self.core.size;
        } else {
            self.core.size = size.ok_or_else(|| RelayError::errno(Errno::ENOENT, path.clone()))?;
            self.start_download(0)?;
        }
        Ok(())
    }
}

impl VStream for FtpStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.close();
        self.core.error = Errno::NONE;
        let session = self.session.clone();
        let _io = session.state().begin_io();
        if let Err(err) = self.open_inner(mode) {
            self.data = None;
            self.release();
            return self.core.fail(err);
        }
        self.core.open = true;
        trace!(path = %self.path, size = self.core.size, "ftp open");
        Ok(())
    }

    fn close(&mut self) {
        if let Err(err) = self.end_transfer() {
            debug!(path = %self.path, error = %err, "transfer did not complete cleanly");
            self.core.error = err.code();
        }
        self.release();
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let _io = self.session.state().begin_io();
        let result = match self.data.as_mut() {
            Some(data) => data.read(buf).map_err(RelayError::from),
            None => Ok(0),
        };
        let n = self.core.track(result)?;
        self.core.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check()?;
        if !self.core.mode.is_write() {
            return self.core.fail(RelayError::errno(Errno::EBADF, "stream not open for writing"));
        }
        let _io = self.session.state().begin_io();
        let result = match self.data.as_mut() {
            Some(data) => data.write_all(buf).map(|_| buf.len()).map_err(RelayError::from),
            None => Err(RelayError::errno(Errno::EBADF, "no data connection")),
        };
        let n = self.core.track(result)?;
        self.core.advance(n);
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.check()?;
        if self.core.mode.is_write() {
            return self.core.fail(RelayError::errno(Errno::ESPIPE, "uploads are sequential"));
        }
        if pos > self.core.size {
            return self.core.fail(RelayError::errno(
                Errno::EINVAL,
                format!("seek to {} past size {}", pos, self.core.size),
            ));
        }
        if pos == self.core.position {
            return Ok(());
        }
        let session = self.session.clone();
        let _io = session.state().begin_io();
        let restarted = self.end_transfer().and_then(|_| self.start_download(pos));
        if let Err(err) = restarted {
            self.close();
            return self.core.fail(err);
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.core.size
    }

    fn position(&self) -> u64 {
        self.core.position
    }

    fn error(&self) -> Errno {
        self.core.error
    }

    fn is_random_access(&self) -> bool {
        !self.core.mode.is_write()
    }
}

impl Drop for FtpStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_parse_unix_listing() {
        let entry = parse_list_line("-rw-r--r--   1 ftp  ftp     174848 Jan 01  2024 Elite II.d64").unwrap();
        assert_eq!(entry.name, "Elite II.d64");
        assert_eq!(entry.size, 174_848);
        assert!(!entry.is_dir);

        let dir = parse_list_line("drwxr-xr-x 2 ftp ftp 4096 Mar 03 12:00 games").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.name, "games");

        let link = parse_list_line("lrwxrwxrwx 1 ftp ftp 9 Mar 03 12:00 latest -> games/new").unwrap();
        assert_eq!(link.name, "latest");
        assert!(parse_list_line("total 12").is_none());
    }

    #[test]
    fn test_parse_dos_listing() {
        let dir = parse_list_line("01-31-24  09:15PM       <DIR>          C64 Games").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.name, "C64 Games");
        let file = parse_list_line("01-31-24  09:15PM                 1234 a.prg").unwrap();
        assert_eq!(file.size, 1234);
    }

    #[test]
    fn test_parse_pasv() {
        let addr = parse_pasv("Entering Passive Mode (127,0,0,1,195,80)").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:50000");
        assert!(parse_pasv("Entering Passive Mode").is_none());
        assert!(parse_pasv("(1,2,3,4,300,1)").is_none());
    }

    #[test]
    fn test_parse_mdtm() {
        let time = parse_mdtm("19941106084937").unwrap();
        let secs = time.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 784_111_777);
        // Fractional seconds are ignored
        assert_eq!(parse_mdtm("19941106084937.250"), Some(time));
        assert!(parse_mdtm("20241399000000").is_none());
        assert!(parse_mdtm("2024").is_none());
    }
}
