use crate::config::HttpConfig;
use crate::error::{Errno, RelayError, Result};
use crate::session::{Session, SessionKey, SessionState};
use crate::url::Url;
use crate::vfs::{emulate_seek, Filesystem, OpenMode, SequentialSource, StreamCore, VFile, VStream, Vfs};
use chrono::DateTime;
use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, LAST_MODIFIED, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

/// Pooled HTTP client for one `scheme://host:port`
pub struct HttpSession {
    state: SessionState,
    config: HttpConfig,
    client: Mutex<Option<Client>>,
}

impl HttpSession {
    pub fn new(key: SessionKey, config: HttpConfig) -> Self {
        Self {
            state: SessionState::new(key),
            config,
            client: Mutex::new(None),
        }
    }

    /// Session key of a URL; `webdav`/`webdavs` share the `http`/`https` pool
    pub fn key_for(url: &Url) -> SessionKey {
        let scheme = transport_scheme(url.scheme());
        let port = if scheme == "https" { 443 } else { 80 };
        SessionKey::from_url(scheme, url, port)
    }

    pub fn client(&self) -> Result<Client> {
        if !self.state.is_connected() {
            return Err(RelayError::NotConnected(self.key().to_string()));
        }
        self.client
            .lock()
            .clone()
            .ok_or_else(|| RelayError::NotConnected(self.key().to_string()))
    }

    /// Build a request with the login of the URL applied
    pub fn request(&self, method: Method, url: &Url) -> Result<RequestBuilder> {
        let target = http_target(url);
        let mut builder = self.client()?.request(method, target);
        if let Some(user) = url.user() {
            builder = builder.basic_auth(user, url.password());
        }
        Ok(builder)
    }

    /// Send and reject error statuses
    pub fn send(&self, builder: RequestBuilder, url: &Url) -> Result<Response> {
        let _io = self.state.begin_io();
        let response = builder.send()?;
        let status = response.status();
        trace!(url = %url, status = status.as_u16(), "http response");
        if status.as_u16() > 399 {
            return Err(RelayError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

impl Session for HttpSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn connect(&self) -> Result<()> {
        let client = Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .redirect(Policy::limited(self.config.max_redirects))
            .user_agent(self.config.user_agent.clone())
            .build()?;
        *self.client.lock() = Some(client);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set_connected(false);
        self.client.lock().take();
    }

    /// Requests are independent; the pooled client stays usable
    fn keep_alive(&self) -> bool {
        self.state.is_connected()
    }
}

pub(crate) fn transport_scheme(scheme: &str) -> &'static str {
    match scheme {
        "https" | "webdavs" => "https",
        _ => "http",
    }
}

/// The URL as sent on the wire: transport scheme, no credentials
pub(crate) fn http_target(url: &Url) -> String {
    let mut target = format!("{}://{}", transport_scheme(url.scheme()), url.host());
    if let Some(port) = url.port() {
        target.push_str(&format!(":{}", port));
    }
    if url.path().is_empty() {
        target.push('/');
    } else {
        target.push_str(url.path());
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Total size from `Content-Range: bytes 0-99/1234`
pub fn parse_content_range(value: &str) -> Option<u64> {
    let total = value.rsplit_once('/')?.1.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

pub(crate) fn obtain_session(vfs: &Vfs, url: &Url, config: &HttpConfig) -> Result<Arc<HttpSession>> {
    let config = config.clone();
    vfs.broker()
        .obtain(HttpSession::key_for(url), move |key| HttpSession::new(key, config))
}

#[derive(Debug, Clone, Default)]
struct HeadInfo {
    exists: bool,
    size: u64,
    ranges: bool,
    modified: Option<SystemTime>,
}

pub struct HttpFilesystem {
    config: HttpConfig,
}

impl HttpFilesystem {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

impl Filesystem for HttpFilesystem {
    fn name(&self) -> &str {
        "http"
    }

    fn handles(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let session = obtain_session(vfs, url, &self.config)?;
        Ok(Box::new(HttpFile::new(url.clone(), session)))
    }
}

pub struct HttpFile {
    url: Url,
    session: Arc<HttpSession>,
    head: Option<HeadInfo>,
}

impl HttpFile {
    pub fn new(url: Url, session: Arc<HttpSession>) -> Self {
        Self {
            url,
            session,
            head: None,
        }
    }

    fn head(&mut self) -> HeadInfo {
        if let Some(head) = &self.head {
            return head.clone();
        }
        let info = match self
            .session
            .request(Method::HEAD, &self.url)
            .and_then(|builder| self.session.send(builder, &self.url))
        {
            Ok(response) => {
                let headers = response.headers();
                HeadInfo {
                    exists: true,
                    size: header_u64(&response, CONTENT_LENGTH.as_str()).unwrap_or(0),
                    ranges: headers
                        .get(ACCEPT_RANGES)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.eq_ignore_ascii_case("bytes"))
                        .unwrap_or(false),
                    modified: headers
                        .get(LAST_MODIFIED)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_http_date),
                }
            }
            Err(err) => {
                debug!(url = %self.url, error = %err, "HEAD failed");
                HeadInfo::default()
            }
        };
        self.head = Some(info.clone());
        info
    }

    /// True when a HEAD advertised byte ranges
    pub fn accepts_ranges(&mut self) -> bool {
        self.head().ranges
    }
}

impl VFile for HttpFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        self.head().exists
    }

    fn is_directory(&mut self) -> bool {
        false
    }

    fn size(&mut self) -> u64 {
        self.head().size
    }

    fn last_write(&mut self) -> Option<SystemTime> {
        self.head().modified
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        let mut stream = HttpStream::new(self.url.clone(), self.session.clone());
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

/// How buffered writes are sent on close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upload {
    /// `out|app` puts, plain `out` posts
    ByMode,
    /// Always PUT (WebDAV)
    Put,
}

/// GET-backed stream; writes are buffered and sent on close
pub struct HttpStream {
    core: StreamCore,
    session: Arc<HttpSession>,
    response: Option<Response>,
    ranges: bool,
    upload: Upload,
    outgoing: Option<Vec<u8>>,
}

impl HttpStream {
    pub fn new(url: Url, session: Arc<HttpSession>) -> Self {
        Self {
            core: StreamCore::new(url),
            session,
            response: None,
            ranges: false,
            upload: Upload::ByMode,
            outgoing: None,
        }
    }

    pub fn with_upload(mut self, upload: Upload) -> Self {
        self.upload = upload;
        self
    }

    /// GET from `offset`; a ranged request must come back 206
    fn fetch(&mut self, offset: u64) -> Result<()> {
        self.response = None;
        let url = self.core.url.clone();
        let builder = self
            .session
            .request(Method::GET, &url)?
            .header(RANGE, format!("bytes={}-", offset));
        let response = self.session.send(builder, &url)?;
        let status = response.status();

        let length = header_u64(&response, CONTENT_LENGTH.as_str());
        if status == StatusCode::PARTIAL_CONTENT || response.headers().contains_key(CONTENT_RANGE) {
            self.ranges = true;
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            // The body length bounds what the server can deliver from here
            let delivered = length.map(|length| offset.saturating_add(length));
            self.core.size = match (total, delivered) {
                (Some(total), Some(delivered)) if total != delivered => {
                    warn!(url = %url, total, delivered, "Content-Range total disagrees with body length");
                    delivered
                }
                (Some(total), _) => total,
                (None, Some(delivered)) => delivered,
                (None, None) => self.core.size,
            };
        } else if offset > 0 {
            return Err(RelayError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        } else {
            self.ranges = false;
            self.core.size = length.unwrap_or(0);
        }
        self.core.position = offset;
        self.response = Some(response);
        Ok(())
    }

    fn check_session(&mut self) -> Result<()> {
        self.core.require_open()?;
        if !self.session.is_connected() {
            return self.core.fail(RelayError::NotConnected(self.session.key().to_string()));
        }
        Ok(())
    }

    fn flush_upload(&mut self) -> Result<()> {
        let Some(body) = self.outgoing.take() else {
            return Ok(());
        };
        let method = match self.upload {
            Upload::Put => Method::PUT,
            Upload::ByMode if self.core.mode.is_append() => Method::PUT,
            Upload::ByMode => Method::POST,
        };
        let url = self.core.url.clone();
        debug!(url = %url, method = %method, bytes = body.len(), "uploading");
        let builder = self.session.request(method, &url)?.body(body);
        self.session.send(builder, &url).map(|_| ())
    }
}

impl SequentialSource for HttpStream {
    fn reopen(&mut self) -> Result<()> {
        self.fetch(0)
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(response) = self.response.as_mut() else {
            // Parked at end of file after a local seek
            if self.ranges && self.core.position >= self.core.size {
                return Ok(0);
            }
            return Err(RelayError::errno(Errno::EBADF, "no response body"));
        };
        let n = response.read(buf)?;
        self.core.position += n as u64;
        if n == 0 && !buf.is_empty() && self.core.position < self.core.size {
            debug!(url = %self.core.url, size = self.core.size, at = self.core.position, "body ended early");
            self.core.size = self.core.position;
        }
        Ok(n)
    }
}

impl VStream for HttpStream {
    fn url(&self) -> &Url {
        &self.core.url
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.core.mode = mode;
        self.core.error = Errno::NONE;
        self.core.position = 0;
        self.core.size = 0;
        if mode.is_write() {
            self.outgoing = Some(Vec::new());
            self.core.open = true;
            return Ok(());
        }
        let fetched = self.fetch(0);
        if let Err(err) = fetched {
            self.core.open = false;
            return self.core.fail(err);
        }
        self.core.open = true;
        trace!(url = %self.core.url, size = self.core.size, ranges = self.ranges, "http open");
        Ok(())
    }

    fn close(&mut self) {
        if self.core.open {
            if let Err(err) = self.flush_upload() {
                warn!(url = %self.core.url, error = %err, "upload failed");
                self.core.error = err.code();
            }
        }
        self.response = None;
        self.core.open = false;
    }

    fn is_open(&self) -> bool {
        self.core.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_session()?;
        let session = self.session.clone();
        let _io = session.state().begin_io();
        let result = self.read_next(buf);
        self.core.track(result)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_session()?;
        let Some(outgoing) = self.outgoing.as_mut() else {
            return self.core.fail(RelayError::errno(Errno::EBADF, "stream not open for writing"));
        };
        outgoing.extend_from_slice(buf);
        self.core.advance(buf.len());
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.check_session()?;
        if self.outgoing.is_some() {
            return self.core.fail(RelayError::errno(Errno::ESPIPE, "uploads are sequential"));
        }
        if self.core.size > 0 && pos > self.core.size {
            return self.core.fail(RelayError::errno(
                Errno::EINVAL,
                format!("seek to {} past size {}", pos, self.core.size),
            ));
        }
        if pos == self.core.position {
            return Ok(());
        }
        if self.ranges {
            if self.core.size > 0 && pos == self.core.size {
                // Nothing left to fetch; a request here would only earn a 416
                self.response = None;
                self.core.position = pos;
                return Ok(());
            }
            if let Err(err) = self.fetch(pos) {
                self.response = None;
                self.core.open = false;
                return self.core.fail(err);
            }
            return Ok(());
        }
        let current = self.core.position;
        let reached = emulate_seek(self, current, pos);
        self.core.track(reached).map(|_| ())
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
        self.ranges
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response.headers().get(name)?.to_str().ok()?.trim().parse().ok()
}

/// IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`)
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim()).ok().map(SystemTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range("bytes 0-99/1234"), Some(1234));
        assert_eq!(parse_content_range("bytes 10-20/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_http_target_strips_login() {
        let url = Url::parse("webdavs://amy:pw@host:8443/dav/a%20b?x=1").unwrap();
        assert_eq!(http_target(&url), "https://host:8443/dav/a%20b?x=1");
        let key = HttpSession::key_for(&url);
        assert_eq!(key.scheme(), "https");
        assert_eq!(key.port(), 8443);
        assert_eq!(key.user(), Some("amy"));
    }

    #[test]
    fn test_http_date() {
        let time = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        let secs = time.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 784_111_777);
        assert!(parse_http_date("yesterday").is_none());
        assert!(parse_http_date("Sun, 99 Nov 1994 08:49:37 GMT").is_none());
        assert!(parse_http_date("Sun, 06 Nov 1994 25:49:37 GMT").is_none());
    }

    #[test]
    fn test_default_ports() {
        let key = HttpSession::key_for(&Url::parse("http://example.com/x").unwrap());
        assert_eq!(key.port(), 80);
        let key = HttpSession::key_for(&Url::parse("https://example.com/x").unwrap());
        assert_eq!(key.port(), 443);
    }
}
