//! Pooled backend connections
//!
//! A [`Session`] wraps one native connection (an HTTP client, an NFS mount,
//! a TCP socket, ...). Sessions are shared through `Arc` and owned by the
//! [`SessionBroker`], which reuses them across files and streams, probes idle
//! ones and evicts the ones that died.

mod broker;

pub use broker::{SessionBroker, SweepReport};

use crate::cache::CachedFile;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::url::Url;

/// Registry key of a session: backend scheme, host, port and login
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    scheme: String,
    host: String,
    port: u16,
    user: Option<String>,
}

impl SessionKey {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
            user: None,
        }
    }

    /// Key for a session bound to one resource rather than a host; the
    /// resource name keeps its case
    pub fn resource(scheme: &str, resource: &str) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: resource.to_string(),
            port: 0,
            user: None,
        }
    }

    /// Key for a login-scoped session
    pub fn with_user(mut self, user: Option<&str>) -> Self {
        self.user = user.filter(|u| !u.is_empty()).map(str::to_string);
        self
    }

    /// Key for the session serving `url`
    pub fn from_url(scheme: &str, url: &Url, default_port: u16) -> Self {
        Self::new(scheme, url.host(), url.port_or(default_port)).with_user(url.user())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}://{}@{}:{}", self.scheme, user, self.host, self.port),
            None => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

const INTERVAL_UNSET: u64 = u64::MAX;

/// Bookkeeping common to every session
///
/// Backends embed one of these and expose it through [`Session::state`].
pub struct SessionState {
    key: SessionKey,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
    keep_alive_ms: AtomicU64,
    io_active: AtomicUsize,
    connect_calls: AtomicUsize,
    files: Mutex<HashMap<String, Arc<CachedFile>>>,
}

impl SessionState {
    /// New disconnected state; the broker's keep-alive interval applies
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            connected: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            keep_alive_ms: AtomicU64::new(INTERVAL_UNSET),
            io_active: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Override the keep-alive interval; zero disables probing
    pub fn with_keep_alive(self, interval: Duration) -> Self {
        self.set_keep_alive_interval(interval);
        self
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            self.touch();
        }
    }

    /// Refresh the activity timestamp; never moves it backwards
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Explicit interval, or `None` when the broker default applies
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive_ms.load(Ordering::Relaxed) {
            INTERVAL_UNSET => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_keep_alive_interval(&self, interval: Duration) {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(INTERVAL_UNSET - 1);
        self.keep_alive_ms.store(ms, Ordering::Relaxed);
    }

    /// Mark an operation in flight until the guard drops
    pub fn begin_io(&self) -> IoGuard<'_> {
        self.io_active.fetch_add(1, Ordering::AcqRel);
        IoGuard { state: self }
    }

    pub fn io_active(&self) -> usize {
        self.io_active.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.io_active() > 0
    }

    /// Number of times the broker invoked `connect`
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::Acquire)
    }

    pub(crate) fn note_connect(&self) {
        self.connect_calls.fetch_add(1, Ordering::AcqRel);
    }

    /// Materialised file cached on this session
    pub fn cached_file(&self, path: &str) -> Option<Arc<CachedFile>> {
        self.files.lock().get(path).cloned()
    }

    pub fn cache_file(&self, path: &str, file: Arc<CachedFile>) {
        self.files.lock().insert(path.to_string(), file);
    }

    pub fn evict_file(&self, path: &str) -> Option<Arc<CachedFile>> {
        self.files.lock().remove(path)
    }

    pub fn cached_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn clear_files(&self) {
        self.files.lock().clear();
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("key", &self.key.to_string())
            .field("connected", &self.is_connected())
            .field("io_active", &self.io_active())
            .finish()
    }
}

/// In-flight operation marker; the broker never probes a busy session
pub struct IoGuard<'a> {
    state: &'a SessionState,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.state.io_active.fetch_sub(1, Ordering::AcqRel);
        self.state.touch();
    }
}

/// One pooled backend connection
///
/// Implementations keep their native handle behind a mutex so that
/// `connect`, `disconnect` and `keep_alive` are serialised per session.
/// `keep_alive` must not wait on that mutex: when the handle is busy the
/// session is reported alive.
pub trait Session: Send + Sync + 'static {
    fn state(&self) -> &SessionState;

    /// Establish the native connection
    fn connect(&self) -> Result<()>;

    /// Tear down the native connection; idempotent
    fn disconnect(&self);

    /// Cheap liveness probe
    fn keep_alive(&self) -> bool;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn key(&self) -> &SessionKey {
        self.state().key()
    }
}
