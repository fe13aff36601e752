//! Message-oriented backends
//!
//! A topic (MQTT) or channel (IRC) appears as a single file. Writing
//! publishes, reading drains whatever arrived since the last read. The
//! protocol client lives behind [`PubSubClient`]; this module owns the
//! session, the per-topic inbox and the file/stream surface.

use crate::backends::remote::RemoteTarget;
use crate::error::{Errno, RelayError, Result};
use crate::session::{Session, SessionKey, SessionState};
use crate::url::Url;
use crate::vfs::{Filesystem, OpenMode, StreamCore, VFile, VStream, Vfs};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A message received on a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Native protocol client bound to one server
pub trait PubSubClient: Send {
    fn subscribe(&mut self, topic: &str) -> Result<()>;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Messages that arrived, waiting at most `wait` when none are queued
    fn poll(&mut self, wait: Duration) -> Result<Vec<Message>>;

    /// Round trip to the server
    fn ping(&mut self) -> Result<()>;

    fn shutdown(&mut self) {}
}

pub trait PubSubConnector: Send + Sync {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn PubSubClient>>;
}

/// Per-protocol constants
#[derive(Debug, Clone, Copy)]
pub struct PubSubProfile {
    pub scheme: &'static str,
    pub default_port: u16,
    /// Topic named by a URL
    pub topic: fn(&Url) -> Option<String>,
}

pub struct PubSubSession {
    state: SessionState,
    target: RemoteTarget,
    connector: Arc<dyn PubSubConnector>,
    poll_wait: Duration,
    client: Mutex<Option<Box<dyn PubSubClient>>>,
    inbox: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    subscribed: Mutex<BTreeSet<String>>,
}

impl PubSubSession {
    pub fn new(key: SessionKey, target: RemoteTarget, connector: Arc<dyn PubSubConnector>, poll_wait: Duration) -> Self {
        Self {
            state: SessionState::new(key),
            target,
            connector,
            poll_wait,
            client: Mutex::new(None),
            inbox: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(BTreeSet::new()),
        }
    }

    fn with_client<R>(&self, op: impl FnOnce(&mut dyn PubSubClient) -> Result<R>) -> Result<R> {
        if !self.state.is_connected() {
            return Err(RelayError::NotConnected(self.key().to_string()));
        }
        let _io = self.state.begin_io();
        let mut slot = self.client.lock();
        let client = slot
            .as_mut()
            .ok_or_else(|| RelayError::NotConnected(self.key().to_string()))?;
        let result = op(client.as_mut());
        if let Err(err) = &result {
            if matches!(err.code(), Errno::ENOTCONN | Errno::ECONNREFUSED) {
                warn!(key = %self.key(), error = %err, "connection lost");
                self.state.set_connected(false);
            }
        }
        result
    }

    /// Subscribe once per topic for the life of the session
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        if self.subscribed.lock().contains(topic) {
            return Ok(());
        }
        self.with_client(|client| client.subscribe(topic))?;
        self.subscribed.lock().insert(topic.to_string());
        debug!(key = %self.key(), topic, "subscribed");
        Ok(())
    }

    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.with_client(|client| client.publish(topic, payload))
    }

    /// Pull new messages into the inbox and pop the oldest for `topic`
    pub fn next_message(&self, topic: &str) -> Result<Option<Vec<u8>>> {
        if let Some(payload) = self.pop(topic) {
            return Ok(Some(payload));
        }
        let wait = self.poll_wait;
        let messages = self.with_client(|client| client.poll(wait))?;
        if !messages.is_empty() {
            trace!(key = %self.key(), count = messages.len(), "messages received");
            let mut inbox = self.inbox.lock();
            for message in messages {
                inbox.entry(message.topic).or_default().push_back(message.payload);
            }
        }
        Ok(self.pop(topic))
    }

    /// Bytes waiting for `topic`
    pub fn pending(&self, topic: &str) -> u64 {
        self.inbox
            .lock()
            .get(topic)
            .map(|queue| queue.iter().map(|m| m.len() as u64).sum())
            .unwrap_or(0)
    }

    fn pop(&self, topic: &str) -> Option<Vec<u8>> {
        self.inbox.lock().get_mut(topic)?.pop_front()
    }
}

impl Session for PubSubSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn connect(&self) -> Result<()> {
        let client = self.connector.connect(&self.target)?;
        *self.client.lock() = Some(client);
        self.subscribed.lock().clear();
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set_connected(false);
        if let Some(mut client) = self.client.lock().take() {
            client.shutdown();
        }
        self.subscribed.lock().clear();
        self.inbox.lock().clear();
        self.state.clear_files();
    }

    fn keep_alive(&self) -> bool {
        let Some(mut slot) = self.client.try_lock() else {
            return true;
        };
        let alive = match slot.as_mut() {
            Some(client) => client.ping().is_ok(),
            None => false,
        };
        if !alive {
            self.state.set_connected(false);
        }
        alive
    }
}

pub struct PubSubFilesystem {
    profile: PubSubProfile,
    connector: Arc<dyn PubSubConnector>,
    poll_wait: Duration,
}

impl PubSubFilesystem {
    pub fn new(profile: PubSubProfile, connector: Arc<dyn PubSubConnector>, poll_wait: Duration) -> Self {
        Self {
            profile,
            connector,
            poll_wait,
        }
    }
}

impl Filesystem for PubSubFilesystem {
    fn name(&self) -> &str {
        self.profile.scheme
    }

    fn handles(&self, url: &Url) -> bool {
        url.scheme() == self.profile.scheme
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let topic = (self.profile.topic)(url)
            .ok_or_else(|| RelayError::InvalidUrl(format!("no topic in {}", url)))?;
        let target = RemoteTarget::from_url(url, self.profile.default_port);
        let key = SessionKey::from_url(self.profile.scheme, url, self.profile.default_port);
        let connector = self.connector.clone();
        let poll_wait = self.poll_wait;
        let session = vfs
            .broker()
            .obtain(key, move |key| PubSubSession::new(key, target, connector, poll_wait))?;
        Ok(Box::new(PubSubFile {
            url: url.clone(),
            topic,
            session,
        }))
    }
}

pub struct PubSubFile {
    url: Url,
    topic: String,
    session: Arc<PubSubSession>,
}

impl PubSubFile {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl VFile for PubSubFile {
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
        self.session.pending(&self.topic)
    }

    fn remove(&mut self) -> Result<()> {
        Err(RelayError::errno(Errno::EPERM, format!("cannot remove topic {}", self.topic)))
    }

    fn rename(&mut self, _dest: &str) -> Result<()> {
        Err(RelayError::errno(Errno::EPERM, format!("cannot rename topic {}", self.topic)))
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        let mut stream = PubSubStream::new(self.url.clone(), self.topic.clone(), self.session.clone());
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

/// Writes publish one message each; reads hand out received payloads
pub struct PubSubStream {
    core: StreamCore,
    topic: String,
    session: Arc<PubSubSession>,
    current: Vec<u8>,
    consumed: usize,
}

impl PubSubStream {
    pub fn new(url: Url, topic: String, session: Arc<PubSubSession>) -> Self {
        Self {
            core: StreamCore::new(url),
            topic,
            session,
            current: Vec::new(),
            consumed: 0,
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

impl VStream for PubSubStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.core.error = Errno::NONE;
        if mode.is_read() || !mode.is_write() {
            if let Err(err) = self.session.subscribe(&self.topic) {
                return self.core.fail(err);
            }
        }
        self.core.mode = mode;
        self.core.position = 0;
        self.core.size = 0;
        self.current.clear();
        self.consumed = 0;
        self.core.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        if self.consumed >= self.current.len() {
            let next = self.session.next_message(&self.topic);
            match self.core.track(next)? {
                Some(payload) => {
                    self.current = payload;
                    self.consumed = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.consumed);
        buf[..n].copy_from_slice(&self.current[self.consumed..self.consumed + n]);
        self.consumed += n;
        self.core.position += n as u64;
        self.core.size = self.core.position + (self.current.len() - self.consumed) as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check()?;
        if !self.core.mode.is_write() {
            return self.core.fail(RelayError::errno(Errno::EBADF, "stream not open for writing"));
        }
        let published = self.session.publish(&self.topic, buf);
        self.core.track(published)?;
        self.core.advance(buf.len());
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos == self.core.position {
            return Ok(());
        }
        self.core.fail(RelayError::errno(Errno::ESPIPE, "message streams cannot seek"))
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

    /// Echoes published messages back to subscribers of the same topic
    #[derive(Default)]
    struct Loopback {
        subscriptions: Vec<String>,
        queued: Vec<Message>,
    }

    impl PubSubClient for Loopback {
        fn subscribe(&mut self, topic: &str) -> Result<()> {
            self.subscriptions.push(topic.to_string());
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
            if self.subscriptions.iter().any(|t| t == topic) {
                self.queued.push(Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
            Ok(())
        }

        fn poll(&mut self, _wait: Duration) -> Result<Vec<Message>> {
            Ok(std::mem::take(&mut self.queued))
        }

        fn ping(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct LoopbackConnector;

    impl PubSubConnector for LoopbackConnector {
        fn connect(&self, _target: &RemoteTarget) -> Result<Box<dyn PubSubClient>> {
            Ok(Box::new(Loopback::default()))
        }
    }

    fn session() -> Arc<PubSubSession> {
        let url = Url::parse("mqtt://broker/sensors/temp").unwrap();
        let session = PubSubSession::new(
            SessionKey::from_url("mqtt", &url, 1883),
            RemoteTarget::from_url(&url, 1883),
            Arc::new(LoopbackConnector),
            Duration::ZERO,
        );
        session.connect().unwrap();
        session.state().set_connected(true);
        Arc::new(session)
    }

    #[test]
    fn test_write_then_read_drains() {
        let session = session();
        let url = Url::parse("mqtt://broker/sensors/temp").unwrap();
        let mut stream = PubSubStream::new(url, "sensors/temp".into(), session.clone());
        stream.open(OpenMode::IN | OpenMode::OUT).unwrap();

        stream.write(b"21.5").unwrap();
        stream.write(b"22.0").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"21.");
        assert_eq!(session.pending("sensors/temp"), 4);
        let mut rest = [0u8; 16];
        assert_eq!(stream.read(&mut rest).unwrap(), 1);
        assert_eq!(stream.read(&mut rest).unwrap(), 4);
        assert_eq!(&rest[..4], b"22.0");
        assert_eq!(stream.read(&mut rest).unwrap(), 0);
        assert!(!stream.is_random_access());
        assert_eq!(stream.seek(0).unwrap_err().code(), Errno::ESPIPE);
    }

    #[test]
    fn test_topic_file_is_flat() {
        let session = session();
        let mut file = PubSubFile {
            url: Url::parse("mqtt://broker/sensors/temp").unwrap(),
            topic: "sensors/temp".into(),
            session,
        };
        assert!(file.exists());
        assert!(!file.is_directory());
        assert_eq!(file.remove().unwrap_err().code(), Errno::EPERM);
        assert_eq!(file.rename("other").unwrap_err().code(), Errno::EPERM);
    }

    #[test]
    fn test_disconnected_stream_fails() {
        let session = session();
        let url = Url::parse("mqtt://broker/t").unwrap();
        let mut stream = PubSubStream::new(url, "t".into(), session.clone());
        stream.open(OpenMode::IN).unwrap();
        session.disconnect();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap_err().code(), Errno::ENOTCONN);
        assert_eq!(stream.error(), Errno::ENOTCONN);
    }
}
