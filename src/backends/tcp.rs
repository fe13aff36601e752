//! Raw TCP sockets
//!
//! `tcp://host:port` connects to a peer; `tcp://:port` listens and accepts a
//! single peer. Bytes go straight through, so streams cannot seek.

use crate::config::NetworkConfig;
use crate::error::{Errno, RelayError, Result};
use crate::session::{Session, SessionKey, SessionState};
use crate::url::Url;
use crate::vfs::{Filesystem, OpenMode, StreamCore, VFile, VStream, Vfs};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub struct TcpSession {
    state: SessionState,
    config: NetworkConfig,
    socket: Mutex<Option<TcpStream>>,
}

impl TcpSession {
    pub fn new(key: SessionKey, config: NetworkConfig) -> Self {
        Self {
            state: SessionState::new(key),
            config,
            socket: Mutex::new(None),
        }
    }

    fn dial(&self) -> Result<TcpStream> {
        let key = self.key();
        let addr = (key.host(), key.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::ConnectionFailed(format!("cannot resolve {}", key.host())))?;
        TcpStream::connect_timeout(&addr, self.config.connect_timeout())
            .map_err(|err| RelayError::ConnectionFailed(format!("{}: {}", addr, err)))
    }

    /// Wait up to the connect timeout for one peer
    fn accept(&self) -> Result<TcpStream> {
        let port = self.key().port();
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!(port, "waiting for tcp peer");
        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    info!(port, peer = %peer, "tcp peer accepted");
                    return Ok(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(RelayError::ConnectionFailed(format!("no peer on port {}", port)));
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Independent handle onto the connected socket
    pub fn handle(&self) -> Result<TcpStream> {
        self.socket
            .lock()
            .as_ref()
            .ok_or_else(|| RelayError::NotConnected(self.key().to_string()))?
            .try_clone()
            .map_err(RelayError::from)
    }
}

impl Session for TcpSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn connect(&self) -> Result<()> {
        let stream = if self.key().host().is_empty() {
            self.accept()?
        } else {
            self.dial()?
        };
        stream.set_read_timeout(Some(self.config.io_timeout()))?;
        stream.set_write_timeout(Some(self.config.io_timeout()))?;
        let _ = stream.set_nodelay(true);
        *self.socket.lock() = Some(stream);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set_connected(false);
        if let Some(stream) = self.socket.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Peek without blocking: an orderly shutdown by the peer reads as zero
    fn keep_alive(&self) -> bool {
        let Some(slot) = self.socket.try_lock() else {
            return true;
        };
        let Some(stream) = slot.as_ref() else {
            return false;
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match stream.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        };
        let _ = stream.set_nonblocking(false);
        if !alive {
            self.state.set_connected(false);
        }
        alive
    }
}

pub struct TcpFilesystem {
    config: NetworkConfig,
}

impl TcpFilesystem {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl Filesystem for TcpFilesystem {
    fn name(&self) -> &str {
        "tcp"
    }

    fn handles(&self, url: &Url) -> bool {
        url.scheme() == "tcp"
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let port = url
            .port()
            .ok_or_else(|| RelayError::InvalidUrl(format!("tcp URL needs a port: {}", url)))?;
        let config = self.config.clone();
        let session = vfs
            .broker()
            .obtain(SessionKey::new("tcp", url.host(), port), move |key| TcpSession::new(key, config))?;
        Ok(Box::new(TcpFile {
            url: url.clone(),
            session,
        }))
    }
}

pub struct TcpFile {
    url: Url,
    session: Arc<TcpSession>,
}

impl VFile for TcpFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        self.session.is_connected()
    }

    fn is_directory(&mut self) -> bool {
        false
    }

    fn size(&mut self) -> u64 {
        0
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        let mut stream = TcpSocketStream::new(self.url.clone(), self.session.clone());
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

pub struct TcpSocketStream {
    core: StreamCore,
    session: Arc<TcpSession>,
    socket: Option<TcpStream>,
}

impl TcpSocketStream {
    pub fn new(url: Url, session: Arc<TcpSession>) -> Self {
        Self {
            core: StreamCore::new(url),
            session,
            socket: None,
        }
    }

    fn check(&mut self) -> Result<()> {
        self.core.require_open()?;
        if !self.session.is_connected() {
            return self.core.fail(RelayError::NotConnected(self.session.key().to_string()));
        }
        Ok(())
    }
}

impl VStream for TcpSocketStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.core.error = Errno::NONE;
        let socket = match self.session.handle() {
            Ok(socket) => socket,
            Err(err) => return self.core.fail(err),
        };
        self.socket = Some(socket);
        self.core.mode = mode;
        self.core.position = 0;
        self.core.size = 0;
        self.core.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    /// A read timeout yields zero bytes; the peer closing marks the session
    /// disconnected
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let Some(socket) = self.socket.as_mut() else {
            return self.core.fail(RelayError::errno(Errno::EBADF, "socket closed"));
        };
        let _io = self.session.state().begin_io();
        let n = match socket.read(buf) {
            Ok(0) if !buf.is_empty() => {
                debug!(key = %self.session.key(), "peer closed connection");
                self.session.state().set_connected(false);
                0
            }
            Ok(n) => n,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => 0,
            Err(err) => {
                self.session.state().set_connected(false);
                return self.core.fail(err.into());
            }
        };
        self.core.advance(n);
        self.core.size = self.core.position;
        trace!(bytes = n, "tcp recv");
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check()?;
        let Some(socket) = self.socket.as_mut() else {
            return self.core.fail(RelayError::errno(Errno::EBADF, "socket closed"));
        };
        let _io = self.session.state().begin_io();
        if let Err(err) = socket.write_all(buf) {
            self.session.state().set_connected(false);
            return self.core.fail(err.into());
        }
        self.core.advance(buf.len());
        trace!(bytes = buf.len(), "tcp send");
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos == self.core.position {
            return Ok(());
        }
        self.core.fail(RelayError::errno(Errno::ESPIPE, "tcp streams cannot seek"))
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
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::read_all;

    fn quick() -> NetworkConfig {
        NetworkConfig {
            connect_timeout_ms: 1_000,
            io_timeout_ms: 200,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn test_dial_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut line = [0u8; 5];
            socket.read_exact(&mut line).unwrap();
            socket.write_all(b"pong!").unwrap();
            line
        });

        let session = Arc::new(TcpSession::new(SessionKey::new("tcp", "127.0.0.1", port), quick()));
        session.connect().unwrap();
        session.state().set_connected(true);

        let url = Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let mut stream = TcpSocketStream::new(url, session.clone());
        stream.open(OpenMode::IN | OpenMode::OUT).unwrap();
        assert!(!stream.is_random_access());
        stream.write(b"ping!").unwrap();
        assert_eq!(peer.join().unwrap(), *b"ping!");

        let data = read_all(&mut stream).unwrap();
        assert_eq!(data, b"pong!");
        assert!(!session.is_connected());
        assert_eq!(stream.seek(0).unwrap_err().code(), Errno::ESPIPE);
    }

    #[test]
    fn test_refused_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let session = TcpSession::new(SessionKey::new("tcp", "127.0.0.1", port), quick());
        assert!(matches!(session.connect(), Err(RelayError::ConnectionFailed(_))));
    }
}
