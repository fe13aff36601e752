//! IRC channels as message streams
//!
//! `irc://[nick[:pass]@]server[:port]/#channel`. Each written line becomes a
//! `PRIVMSG`; reads return channel traffic as `<nick> text` lines.

use crate::backends::pubsub::{Message, PubSubClient, PubSubConnector, PubSubFilesystem, PubSubProfile};
use crate::backends::remote::RemoteTarget;
use crate::config::NetworkConfig;
use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use crate::vfs::{Filesystem, VFile, Vfs};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const IRC_PORT: u16 = 6667;

const DEFAULT_NICK: &str = "relayfs";
const MIN_WAIT: Duration = Duration::from_millis(1);

/// A parsed protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let prefix = match rest.strip_prefix(':') {
            Some(tail) => {
                let (prefix, after) = tail.split_once(' ')?;
                rest = after;
                Some(prefix.to_string())
            }
            None => None,
        };
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut words = head.split_whitespace();
        let command = words.next()?.to_ascii_uppercase();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }
        Some(Self { prefix, command, params })
    }

    /// Nick part of a `nick!user@host` prefix
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }
}

pub struct IrcClient {
    stream: TcpStream,
    rx: Vec<u8>,
    pending: Vec<Message>,
    nick: String,
    timeout: Duration,
}

impl IrcClient {
    /// Register with the server, retrying the nick with `_` appended when taken
    pub fn connect(target: &RemoteTarget, config: &NetworkConfig) -> Result<Self> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::ConnectionFailed(format!("cannot resolve {}", target.host)))?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|err| RelayError::ConnectionFailed(format!("{}: {}", addr, err)))?;
        stream.set_write_timeout(Some(config.io_timeout()))?;

        let nick = target.user.clone().unwrap_or_else(|| DEFAULT_NICK.to_string());
        let mut client = Self {
            stream,
            rx: Vec::new(),
            pending: Vec::new(),
            nick,
            timeout: config.io_timeout(),
        };
        if let Some(password) = &target.password {
            client.send(&format!("PASS {}", password))?;
        }
        let nick = client.nick.clone();
        client.send(&format!("NICK {}", nick))?;
        client.send(&format!("USER {} 0 * :relayfs", nick))?;

        let deadline = Instant::now() + client.timeout;
        loop {
            let line = client
                .next_line(deadline)?
                .ok_or_else(|| RelayError::ConnectionFailed(format!("{}: registration timed out", addr)))?;
            match line.command.as_str() {
                "001" => break,
                "433" => {
                    client.nick.push('_');
                    let nick = client.nick.clone();
                    client.send(&format!("NICK {}", nick))?;
                }
                "464" => return Err(RelayError::errno(Errno::EACCES, format!("{}: bad password", addr))),
                "ERROR" => {
                    let reason = line.params.last().cloned().unwrap_or_default();
                    return Err(RelayError::ConnectionFailed(format!("{}: {}", addr, reason)));
                }
                _ => {}
            }
        }
        debug!(server = %addr, nick = %client.nick, "irc registered");
        Ok(client)
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let shown = if line.starts_with("PASS ") { "PASS ****" } else { line };
        trace!(line = shown, "irc send");
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .map_err(|err| RelayError::errno(Errno::ENOTCONN, err.to_string()))
    }

    fn fill(&mut self, wait: Duration) -> Result<bool> {
        self.stream.set_read_timeout(Some(wait.max(MIN_WAIT)))?;
        let mut chunk = [0u8; 2048];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(RelayError::errno(Errno::ENOTCONN, "server closed the connection")),
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
            Err(err) => Err(RelayError::errno(Errno::ENOTCONN, err.to_string())),
        }
    }

    fn take_line(&mut self) -> Option<IrcLine> {
        loop {
            let end = self.rx.iter().position(|b| *b == b'\n')?;
            let raw: Vec<u8> = self.rx.drain(..=end).collect();
            let text = String::from_utf8_lossy(&raw);
            if let Some(line) = IrcLine::parse(&text) {
                return Some(line);
            }
        }
    }

    /// Next line that is not handled internally; PINGs are answered and
    /// channel messages queued
    fn next_line(&mut self, deadline: Instant) -> Result<Option<IrcLine>> {
        loop {
            while let Some(line) = self.take_line() {
                match line.command.as_str() {
                    "PING" => {
                        let token = line.params.last().cloned().unwrap_or_default();
                        self.send(&format!("PONG :{}", token))?;
                    }
                    "PRIVMSG" if line.params.len() >= 2 => {
                        let nick = line.nick().unwrap_or("?").to_string();
                        self.pending.push(Message {
                            topic: line.params[0].to_ascii_lowercase(),
                            payload: format!("<{}> {}\n", nick, line.params[1]).into_bytes(),
                        });
                    }
                    _ => return Ok(Some(line)),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.fill(deadline - now)?;
        }
    }
}

impl PubSubClient for IrcClient {
    fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.send(&format!("JOIN {}", channel))?;
        let deadline = Instant::now() + self.timeout;
        while let Some(line) = self.next_line(deadline)? {
            match line.command.as_str() {
                "JOIN" if line.nick() == Some(self.nick.as_str()) => return Ok(()),
                "403" | "471" | "473" | "474" | "475" => {
                    return Err(RelayError::errno(
                        Errno::EACCES,
                        format!("cannot join {}: {}", channel, line.params.last().cloned().unwrap_or_default()),
                    ))
                }
                _ => {}
            }
        }
        Err(RelayError::errno(Errno::ETIMEDOUT, format!("no JOIN confirmation for {}", channel)))
    }

    fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(payload);
        for line in text.lines().filter(|l| !l.is_empty()) {
            self.send(&format!("PRIVMSG {} :{}", channel, line))?;
        }
        Ok(())
    }

    fn poll(&mut self, wait: Duration) -> Result<Vec<Message>> {
        let deadline = Instant::now() + if self.pending.is_empty() { wait } else { Duration::ZERO };
        while self.next_line(deadline)?.is_some() {}
        Ok(std::mem::take(&mut self.pending))
    }

    fn ping(&mut self) -> Result<()> {
        self.send("PING :relayfs")?;
        let deadline = Instant::now() + self.timeout;
        while let Some(line) = self.next_line(deadline)? {
            if line.command == "PONG" {
                return Ok(());
            }
        }
        Err(RelayError::errno(Errno::ETIMEDOUT, "no PONG"))
    }

    fn shutdown(&mut self) {
        let _ = self.send("QUIT :bye");
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct IrcConnector {
    config: NetworkConfig,
}

impl IrcConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl PubSubConnector for IrcConnector {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn PubSubClient>> {
        Ok(Box::new(IrcClient::connect(target, &self.config)?))
    }
}

/// Channel named by an `irc://` URL: the fragment, or the first path segment
pub fn irc_channel(url: &Url) -> Option<String> {
    let name = match url.fragment().filter(|f| !f.is_empty()) {
        Some(fragment) => fragment.to_string(),
        None => url.decoded_path().trim_matches('/').split('/').next()?.to_string(),
    };
    let name = name.trim_start_matches('#');
    (!name.is_empty()).then(|| format!("#{}", name.to_ascii_lowercase()))
}

pub struct IrcFilesystem {
    inner: PubSubFilesystem,
}

impl IrcFilesystem {
    pub fn new(config: NetworkConfig) -> Self {
        let profile = PubSubProfile {
            scheme: "irc",
            default_port: IRC_PORT,
            topic: irc_channel,
        };
        let poll_wait = config.poll_wait();
        Self {
            inner: PubSubFilesystem::new(profile, Arc::new(IrcConnector::new(config)), poll_wait),
        }
    }
}

impl Filesystem for IrcFilesystem {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    #[test]
    fn test_parse_line() {
        let line = IrcLine::parse(":amy!a@host PRIVMSG #retro :LOAD \"*\",8,1\r\n").unwrap();
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.nick(), Some("amy"));
        assert_eq!(line.params, vec!["#retro", "LOAD \"*\",8,1"]);

        let ping = IrcLine::parse("PING :irc.example.net").unwrap();
        assert_eq!(ping.prefix, None);
        assert_eq!(ping.params, vec!["irc.example.net"]);
        assert!(IrcLine::parse("").is_none());
    }

    #[test]
    fn test_channel_from_url() {
        assert_eq!(irc_channel(&Url::parse("irc://irc.libera.chat/#C64").unwrap()).as_deref(), Some("#c64"));
        assert_eq!(irc_channel(&Url::parse("irc://server/retro").unwrap()).as_deref(), Some("#retro"));
        assert_eq!(irc_channel(&Url::parse("irc://server/").unwrap()), None);
    }

    #[test]
    fn test_client_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut writer = socket.try_clone().unwrap();
            let mut reader = BufReader::new(socket);
            let mut read = || {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                line.trim_end().to_string()
            };
            assert_eq!(read(), "NICK bot");
            assert_eq!(read(), "USER bot 0 * :relayfs");
            writer.write_all(b":srv 433 * bot :Nickname is already in use\r\n").unwrap();
            assert_eq!(read(), "NICK bot_");
            writer.write_all(b"PING :tok\r\n:srv 001 bot_ :Welcome\r\n").unwrap();
            assert_eq!(read(), "PONG :tok");
            assert_eq!(read(), "JOIN #retro");
            writer.write_all(b":bot_!b@h JOIN #retro\r\n").unwrap();
            assert_eq!(read(), "PRIVMSG #retro :hi all");
            writer.write_all(b":amy!a@h PRIVMSG #retro :hello bot\r\n").unwrap();
            assert_eq!(read(), "QUIT :bye");
        });

        let config = NetworkConfig {
            io_timeout_ms: 2_000,
            ..NetworkConfig::default()
        };
        let url = Url::parse(&format!("irc://bot@127.0.0.1:{}/#retro", port)).unwrap();
        let mut client = IrcClient::connect(&RemoteTarget::from_url(&url, IRC_PORT), &config).unwrap();
        assert_eq!(client.nick(), "bot_");
        client.subscribe("#retro").unwrap();
        client.publish("#retro", b"hi all\n").unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.is_empty() && Instant::now() < deadline {
            received = client.poll(Duration::from_millis(50)).unwrap();
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic, "#retro");
        assert_eq!(received[0].payload, b"<amy> hello bot\n");
        client.shutdown();
        server.join().unwrap();
    }
}
