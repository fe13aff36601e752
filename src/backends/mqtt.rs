//! MQTT 3.1.1 over TCP
//!
//! `mqtt://[user[:pass]@]broker[:port]/topic/path`. QoS 0 for publishing,
//! inbound QoS 1 messages are acknowledged.

use crate::backends::pubsub::{Message, PubSubClient, PubSubConnector, PubSubFilesystem, PubSubProfile};
use crate::backends::remote::RemoteTarget;
use crate::config::NetworkConfig;
use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use crate::vfs::{Filesystem, VFile, Vfs};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const MQTT_PORT: u16 = 1883;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 0x40;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 0xE0;

const KEEP_ALIVE_SECS: u16 = 60;
const MIN_WAIT: Duration = Duration::from_millis(1);

static CLIENT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Variable-length "remaining length" field
pub fn encode_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode a remaining length: `None` while incomplete, otherwise the value
/// and the bytes it occupied
pub fn decode_length(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 {
            return Err(RelayError::errno(Errno::EPROTO, "remaining length exceeds four bytes"));
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(RelayError::errno(Errno::EPROTO, "remaining length exceeds four bytes"));
    }
    Ok(None)
}

fn put_string(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
}

fn get_string(body: &[u8]) -> Result<(String, &[u8])> {
    let malformed = || RelayError::errno(Errno::EPROTO, "truncated string");
    let len = body.get(..2).ok_or_else(malformed)?;
    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
    let text = body.get(2..2 + len).ok_or_else(malformed)?;
    Ok((String::from_utf8_lossy(text).into_owned(), &body[2 + len..]))
}

/// Complete packet with its fixed header
pub fn encode_packet(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(header);
    encode_length(body.len(), &mut out);
    out.extend_from_slice(body);
    out
}

/// CONNECT packet for a clean session
pub fn connect_packet(client_id: &str, user: Option<&str>, password: Option<&str>) -> Vec<u8> {
    let mut flags = 0x02u8;
    if user.is_some() {
        flags |= 0x80;
        if password.is_some() {
            flags |= 0x40;
        }
    }
    let mut body = Vec::new();
    put_string(&mut body, "MQTT");
    body.push(4);
    body.push(flags);
    body.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    put_string(&mut body, client_id);
    if let Some(user) = user {
        put_string(&mut body, user);
        if let Some(password) = password {
            put_string(&mut body, password);
        }
    }
    encode_packet(CONNECT, &body)
}

/// Split the first complete packet off `rx`
fn take_packet(rx: &mut Vec<u8>) -> Result<Option<(u8, Vec<u8>)>> {
    let Some(&header) = rx.first() else {
        return Ok(None);
    };
    let Some((len, used)) = decode_length(&rx[1..])? else {
        return Ok(None);
    };
    let total = 1 + used + len;
    if rx.len() < total {
        return Ok(None);
    }
    let body = rx[1 + used..total].to_vec();
    rx.drain(..total);
    Ok(Some((header, body)))
}

pub struct MqttClient {
    stream: TcpStream,
    rx: Vec<u8>,
    pending: Vec<Message>,
    packet_id: u16,
    timeout: Duration,
}

impl MqttClient {
    pub fn connect(target: &RemoteTarget, config: &NetworkConfig) -> Result<Self> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::ConnectionFailed(format!("cannot resolve {}", target.host)))?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|err| RelayError::ConnectionFailed(format!("{}: {}", addr, err)))?;
        stream.set_write_timeout(Some(config.io_timeout()))?;
        let _ = stream.set_nodelay(true);

        let mut client = Self {
            stream,
            rx: Vec::new(),
            pending: Vec::new(),
            packet_id: 0,
            timeout: config.io_timeout(),
        };
        let client_id = format!("relayfs-{}-{}", std::process::id(), CLIENT_SEQ.fetch_add(1, Ordering::Relaxed));
        client.send(&connect_packet(&client_id, target.user.as_deref(), target.password.as_deref()))?;
        let ack = client
            .wait_for(CONNACK)
            .map_err(|err| RelayError::ConnectionFailed(format!("{}: {}", addr, err)))?;
        match ack.get(1).copied() {
            Some(0) => {}
            Some(4 | 5) => return Err(RelayError::errno(Errno::EACCES, format!("broker {} refused login", addr))),
            code => return Err(RelayError::ConnectionFailed(format!("broker {} refused connection: {:?}", addr, code))),
        }
        debug!(broker = %addr, client_id, "mqtt connected");
        Ok(client)
    }

    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.stream
            .write_all(packet)
            .map_err(|err| RelayError::errno(Errno::ENOTCONN, err.to_string()))
    }

    /// Read what the socket has within `wait`; false when nothing arrived
    fn fill(&mut self, wait: Duration) -> Result<bool> {
        self.stream.set_read_timeout(Some(wait.max(MIN_WAIT)))?;
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(RelayError::errno(Errno::ENOTCONN, "broker closed the connection")),
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
            Err(err) => Err(RelayError::errno(Errno::ENOTCONN, err.to_string())),
        }
    }

    /// Queue an inbound PUBLISH; other packet types are handed back
    fn dispatch(&mut self, header: u8, body: Vec<u8>) -> Result<Option<(u8, Vec<u8>)>> {
        if header >> 4 != PUBLISH {
            return Ok(Some((header, body)));
        }
        let qos = (header >> 1) & 0x03;
        let (topic, mut rest) = get_string(&body)?;
        if qos > 0 {
            let id = rest
                .get(..2)
                .ok_or_else(|| RelayError::errno(Errno::EPROTO, "publish without packet id"))?;
            let id = [id[0], id[1]];
            rest = &rest[2..];
            if qos == 1 {
                self.send(&encode_packet(PUBACK, &id))?;
            }
        }
        trace!(topic = %topic, bytes = rest.len(), "mqtt publish received");
        self.pending.push(Message {
            topic,
            payload: rest.to_vec(),
        });
        Ok(None)
    }

    fn drain(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        while let Some((header, body)) = take_packet(&mut self.rx)? {
            if let Some(other) = self.dispatch(header, body)? {
                return Ok(Some(other));
            }
        }
        Ok(None)
    }

    /// Wait for a packet of type `kind`, queueing publishes seen meanwhile
    fn wait_for(&mut self, kind: u8) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some((header, body)) = self.drain()? {
                if header >> 4 == kind {
                    return Ok(body);
                }
                trace!(header, "unexpected mqtt packet ignored");
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RelayError::errno(Errno::ETIMEDOUT, format!("no reply of type {}", kind)));
            }
            self.fill(deadline - now)?;
        }
    }

    fn next_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1).max(1);
        self.packet_id
    }
}

impl PubSubClient for MqttClient {
    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut body = self.next_id().to_be_bytes().to_vec();
        put_string(&mut body, topic);
        body.push(0);
        self.send(&encode_packet(SUBSCRIBE, &body))?;
        let ack = self.wait_for(SUBACK)?;
        if ack.get(2) == Some(&0x80) {
            return Err(RelayError::errno(Errno::EACCES, format!("subscription to {} refused", topic)));
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(topic.len() + payload.len() + 2);
        put_string(&mut body, topic);
        body.extend_from_slice(payload);
        self.send(&encode_packet(PUBLISH << 4, &body))
    }

    fn poll(&mut self, wait: Duration) -> Result<Vec<Message>> {
        self.drain()?;
        if self.pending.is_empty() && self.fill(wait)? {
            self.drain()?;
        }
        Ok(std::mem::take(&mut self.pending))
    }

    fn ping(&mut self) -> Result<()> {
        self.send(&[PINGREQ, 0])?;
        self.wait_for(PINGRESP).map(|_| ())
    }

    fn shutdown(&mut self) {
        let _ = self.send(&[DISCONNECT, 0]);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct MqttConnector {
    config: NetworkConfig,
}

impl MqttConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl PubSubConnector for MqttConnector {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn PubSubClient>> {
        Ok(Box::new(MqttClient::connect(target, &self.config)?))
    }
}

/// Topic path of an `mqtt://` URL
pub fn mqtt_topic(url: &Url) -> Option<String> {
    let topic = url.decoded_path().trim_matches('/').to_string();
    (!topic.is_empty()).then_some(topic)
}

pub struct MqttFilesystem {
    inner: PubSubFilesystem,
}

impl MqttFilesystem {
    pub fn new(config: NetworkConfig) -> Self {
        let profile = PubSubProfile {
            scheme: "mqtt",
            default_port: MQTT_PORT,
            topic: mqtt_topic,
        };
        let poll_wait = config.poll_wait();
        Self {
            inner: PubSubFilesystem::new(profile, Arc::new(MqttConnector::new(config)), poll_wait),
        }
    }
}

impl Filesystem for MqttFilesystem {
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
    use std::net::TcpListener;

    fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 1];
        stream.read_exact(&mut header).unwrap();
        let mut len_bytes = Vec::new();
        loop {
            let mut b = [0u8; 1];
            stream.read_exact(&mut b).unwrap();
            len_bytes.push(b[0]);
            if let Some((len, _)) = decode_length(&len_bytes).unwrap() {
                let mut body = vec![0u8; len];
                stream.read_exact(&mut body).unwrap();
                return (header[0], body);
            }
        }
    }

    #[test]
    fn test_remaining_length() {
        for (value, encoded) in [
            (0usize, vec![0x00u8]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
        ] {
            let mut out = Vec::new();
            encode_length(value, &mut out);
            assert_eq!(out, encoded);
            assert_eq!(decode_length(&encoded).unwrap(), Some((value, encoded.len())));
        }
        assert_eq!(decode_length(&[0x80]).unwrap(), None);
        assert!(decode_length(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_connect_packet() {
        let packet = connect_packet("c1", Some("u"), Some("p"));
        assert_eq!(packet[0], CONNECT);
        assert_eq!(&packet[2..8], b"\x00\x04MQTT");
        assert_eq!(packet[8], 4);
        assert_eq!(packet[9], 0x02 | 0x80 | 0x40);
        assert_eq!(&packet[12..16], b"\x00\x02c1");
        assert_eq!(packet[1] as usize, packet.len() - 2);
    }

    #[test]
    fn test_topic_from_url() {
        let url = Url::parse("mqtt://broker/home/kitchen/temp").unwrap();
        assert_eq!(mqtt_topic(&url).as_deref(), Some("home/kitchen/temp"));
        assert_eq!(mqtt_topic(&Url::parse("mqtt://broker/").unwrap()), None);
    }

    #[test]
    fn test_session_against_fake_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let (header, body) = read_packet(&mut socket);
            assert_eq!(header, CONNECT);
            assert_eq!(&body[..6], b"\x00\x04MQTT");
            socket.write_all(&[0x20, 2, 0, 0]).unwrap();

            let (header, body) = read_packet(&mut socket);
            assert_eq!(header, SUBSCRIBE);
            let id = [body[0], body[1]];
            socket.write_all(&[0x90, 3, id[0], id[1], 0]).unwrap();

            let (header, body) = read_packet(&mut socket);
            assert_eq!(header, 0x30);
            let (topic, payload) = get_string(&body).unwrap();
            // Echo back as QoS 1 with packet id 7
            let mut echo = Vec::new();
            put_string(&mut echo, &topic);
            echo.extend_from_slice(&[0, 7]);
            echo.extend_from_slice(payload);
            socket.write_all(&encode_packet(0x32, &echo)).unwrap();

            let (header, body) = read_packet(&mut socket);
            assert_eq!((header, body), (PUBACK, vec![0, 7]));
            let (header, _) = read_packet(&mut socket);
            assert_eq!(header, PINGREQ);
            socket.write_all(&[0xD0, 0]).unwrap();
            let (header, _) = read_packet(&mut socket);
            assert_eq!(header, DISCONNECT);
        });

        let config = NetworkConfig {
            io_timeout_ms: 2_000,
            ..NetworkConfig::default()
        };
        let target = RemoteTarget::from_url(&Url::parse(&format!("mqtt://127.0.0.1:{}/t", port)).unwrap(), MQTT_PORT);
        let mut client = MqttClient::connect(&target, &config).unwrap();
        client.subscribe("t").unwrap();
        client.publish("t", b"hello").unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.is_empty() && Instant::now() < deadline {
            received = client.poll(Duration::from_millis(50)).unwrap();
        }
        assert_eq!(
            received,
            vec![Message {
                topic: "t".into(),
                payload: b"hello".to_vec()
            }]
        );
        client.ping().unwrap();
        client.shutdown();
        broker.join().unwrap();
    }
}
