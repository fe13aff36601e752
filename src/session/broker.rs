use crate::config::BrokerConfig;
use crate::error::{RelayError, Result};
use crate::session::{Session, SessionKey};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Registered session, kept both as a trait object and as `Any` for downcasts
#[derive(Clone)]
struct Entry {
    session: Arc<dyn Session>,
    any: Arc<dyn Any + Send + Sync>,
}

impl Entry {
    fn new<T: Session>(session: Arc<T>) -> Self {
        Self {
            session: session.clone(),
            any: session,
        }
    }

    fn downcast<T: Session>(&self, key: &SessionKey) -> Result<Arc<T>> {
        self.any
            .clone()
            .downcast::<T>()
            .map_err(|_| RelayError::SessionTypeMismatch(key.to_string()))
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionKey, Entry>,
    /// Creation gates; one caller connects per key while others wait
    pending: HashMap<SessionKey, Arc<Mutex<()>>>,
}

/// Outcome of one `service` sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that received a keep-alive probe
    pub probed: Vec<SessionKey>,
    /// Sessions removed from the registry
    pub evicted: Vec<SessionKey>,
    /// Sessions skipped because an operation was in flight
    pub busy: usize,
}

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Process-wide registry of live sessions
///
/// There is at most one session per [`SessionKey`]. Callers share sessions
/// through `Arc`; the broker alone decides when a session is disconnected.
pub struct SessionBroker {
    config: BrokerConfig,
    registry: Mutex<Registry>,
    last_service: Mutex<Option<Instant>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
            last_service: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Start the background sweep thread if configured
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if !self.config.background_sweep {
            return Ok(());
        }
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (stop, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let handle = thread::Builder::new()
            .name("relayfs-sweep".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                        Some(broker) => {
                            broker.service();
                        }
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(period_ms = self.config.sweep_interval_ms, "session sweep started");
        *slot = Some(Sweeper { stop, handle });
        Ok(())
    }

    /// Stop the sweep thread and disconnect every session
    pub fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.stop.send(());
            if sweeper.handle.thread().id() != thread::current().id() {
                let _ = sweeper.handle.join();
            }
        }
        self.clear();
        info!("session broker shut down");
    }

    /// Return the connected session for `key`, creating and connecting it
    /// with `make` when none is registered.
    ///
    /// Concurrent callers for the same key wait for the first one, so a key
    /// is connected once. A failed connect registers nothing.
    pub fn obtain<T, F>(&self, key: SessionKey, make: F) -> Result<Arc<T>>
    where
        T: Session,
        F: FnOnce(SessionKey) -> T,
    {
        let gate = {
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.sessions.get(&key) {
                let session = entry.downcast::<T>(&key)?;
                session.state().touch();
                trace!(key = %key, "session reused");
                return Ok(session);
            }
            registry.pending.entry(key.clone()).or_default().clone()
        };

        let _creating = gate.lock();

        // Another caller may have finished while we waited on the gate
        if let Some(session) = self.find::<T>(&key)? {
            self.release_gate(&key, &gate);
            return Ok(session);
        }

        let session = Arc::new(make(key.clone()));
        session.state().note_connect();
        debug!(key = %key, "connecting session");
        let connected = session.connect();

        let mut registry = self.registry.lock();
        Self::release_gate_locked(&mut registry, &key, &gate);
        match connected {
            Ok(()) => {
                session.state().set_connected(true);
                registry.sessions.insert(key.clone(), Entry::new(session.clone()));
                info!(key = %key, sessions = registry.sessions.len(), "session registered");
                Ok(session)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "session connect failed");
                Err(err)
            }
        }
    }

    /// Registered session for `key`, refreshing its activity timestamp
    pub fn find<T: Session>(&self, key: &SessionKey) -> Result<Option<Arc<T>>> {
        let registry = self.registry.lock();
        match registry.sessions.get(key) {
            Some(entry) => {
                let session = entry.downcast::<T>(key)?;
                session.state().touch();
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Register an already connected session; an existing one is replaced
    /// and disconnected
    pub fn add<T: Session>(&self, session: Arc<T>) {
        let key = session.key().clone();
        let previous = self
            .registry
            .lock()
            .sessions
            .insert(key.clone(), Entry::new(session));
        if let Some(previous) = previous {
            debug!(key = %key, "replaced registered session");
            previous.session.disconnect();
        }
    }

    /// Remove and disconnect a session; true if one was registered
    pub fn dispose(&self, key: &SessionKey) -> bool {
        let removed = self.registry.lock().sessions.remove(key);
        match removed {
            Some(entry) => {
                entry.session.disconnect();
                entry.session.state().clear_files();
                info!(key = %key, "session disposed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.registry.lock().sessions.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.registry.lock().sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove and disconnect every session
    pub fn clear(&self) {
        let drained: Vec<Entry> = {
            let mut registry = self.registry.lock();
            registry.sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.session.disconnect();
            entry.session.state().clear_files();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "sessions cleared");
        }
    }

    /// Sweep the registry: evict disconnected sessions and probe idle ones.
    ///
    /// The registry lock is held only while taking the snapshot and while
    /// applying removals; probes run unlocked.
    pub fn service(&self) -> SweepReport {
        *self.last_service.lock() = Some(Instant::now());

        let snapshot: Vec<(SessionKey, Arc<dyn Session>)> = {
            let registry = self.registry.lock();
            registry
                .sessions
                .iter()
                .map(|(key, entry)| (key.clone(), entry.session.clone()))
                .collect()
        };

        let mut report = SweepReport::default();
        let mut doomed: Vec<(SessionKey, Arc<dyn Session>)> = Vec::new();

        for (key, session) in snapshot {
            if !session.is_connected() {
                doomed.push((key, session));
                continue;
            }

            let state = session.state();
            if state.is_busy() {
                report.busy += 1;
                continue;
            }

            let interval = state
                .keep_alive_interval()
                .unwrap_or_else(|| self.config.keep_alive_interval());
            if interval.is_zero() {
                continue;
            }

            let idle = state.idle_time();
            if idle < interval {
                continue;
            }

            trace!(key = %key, idle_ms = idle.as_millis() as u64, "probing session");
            report.probed.push(key.clone());
            if session.keep_alive() {
                state.touch();
            } else {
                warn!(key = %key, "keep-alive failed");
                doomed.push((key, session));
            }
        }

        if doomed.is_empty() {
            return report;
        }

        let removed: Vec<(SessionKey, Arc<dyn Session>)> = {
            let mut registry = self.registry.lock();
            doomed
                .into_iter()
                .filter(|(key, session)| {
                    let same = registry
                        .sessions
                        .get(key)
                        .map(|entry| Arc::ptr_eq(&entry.session, session))
                        .unwrap_or(false);
                    if same {
                        registry.sessions.remove(key);
                    }
                    same
                })
                .collect()
        };

        for (key, session) in removed {
            session.disconnect();
            session.state().clear_files();
            info!(key = %key, "session evicted");
            report.evicted.push(key);
        }

        report
    }

    /// `service`, unless one ran less than `min_service_interval` ago
    pub fn maybe_service(&self) -> Option<SweepReport> {
        let due = match *self.last_service.lock() {
            Some(last) => last.elapsed() >= self.config.min_service_interval(),
            None => true,
        };
        if due {
            Some(self.service())
        } else {
            None
        }
    }

    fn release_gate(&self, key: &SessionKey, gate: &Arc<Mutex<()>>) {
        let mut registry = self.registry.lock();
        Self::release_gate_locked(&mut registry, key, gate);
    }

    /// Drop the creation gate once no other caller is waiting on it
    fn release_gate_locked(registry: &mut Registry, key: &SessionKey, gate: &Arc<Mutex<()>>) {
        let idle = registry
            .pending
            .get(key)
            .map(|pending| Arc::ptr_eq(pending, gate) && Arc::strong_count(gate) <= 2)
            .unwrap_or(false);
        if idle {
            registry.pending.remove(key);
        }
    }
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Drop for SessionBroker {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            let _ = sweeper.stop.send(());
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct FakeSession {
        state: SessionState,
        fail_connect: bool,
        alive: AtomicBool,
        disconnects: AtomicUsize,
    }

    impl FakeSession {
        fn new(key: SessionKey) -> Self {
            Self {
                state: SessionState::new(key).with_keep_alive(Duration::ZERO),
                fail_connect: false,
                alive: AtomicBool::new(true),
                disconnects: AtomicUsize::new(0),
            }
        }

        fn probing(key: SessionKey) -> Self {
            let session = Self::new(key);
            session.state.set_keep_alive_interval(Duration::from_millis(1));
            session
        }
    }

    impl Session for FakeSession {
        fn state(&self) -> &SessionState {
            &self.state
        }

        fn connect(&self) -> Result<()> {
            if self.fail_connect {
                return Err(RelayError::ConnectionFailed("refused".into()));
            }
            Ok(())
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.state.set_connected(false);
        }

        fn keep_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct OtherSession {
        state: SessionState,
    }

    impl Session for OtherSession {
        fn state(&self) -> &SessionState {
            &self.state
        }
        fn connect(&self) -> Result<()> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn keep_alive(&self) -> bool {
            true
        }
    }

    fn broker() -> SessionBroker {
        SessionBroker::new(BrokerConfig {
            background_sweep: false,
            ..BrokerConfig::default()
        })
    }

    #[test]
    fn test_obtain_reuses_session() {
        let broker = broker();
        let key = SessionKey::new("fake", "host", 1);
        let a = broker.obtain(key.clone(), FakeSession::new).unwrap();
        let first = a.state().last_activity();
        let b = broker.obtain(key.clone(), FakeSession::new).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(b.state().last_activity() >= first);
        assert_eq!(a.state().connect_calls(), 1);
        assert_eq!(broker.count(), 1);
    }

    struct SlowSession {
        state: SessionState,
        connects: Arc<AtomicUsize>,
    }

    impl Session for SlowSession {
        fn state(&self) -> &SessionState {
            &self.state
        }
        fn connect(&self) -> Result<()> {
            std::thread::sleep(Duration::from_millis(50));
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disconnect(&self) {}
        fn keep_alive(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_concurrent_obtain_connects_once() {
        let broker = broker();
        let connects = Arc::new(AtomicUsize::new(0));
        let key = SessionKey::new("https", "example.com", 443);

        let sessions: Vec<Arc<SlowSession>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let connects = connects.clone();
                    let key = key.clone();
                    let broker = &broker;
                    scope.spawn(move || {
                        broker
                            .obtain(key, |key| SlowSession {
                                state: SessionState::new(key),
                                connects,
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&sessions[0], &sessions[1]));
        assert_eq!(broker.count(), 1);
    }

    #[test]
    fn test_failed_connect_registers_nothing() {
        let broker = broker();
        let key = SessionKey::new("fake", "down", 1);
        let result = broker.obtain(key.clone(), |k| FakeSession {
            fail_connect: true,
            ..FakeSession::new(k)
        });
        assert!(matches!(result, Err(RelayError::ConnectionFailed(_))));
        assert_eq!(broker.count(), 0);
        assert!(broker.registry.lock().pending.is_empty());
    }

    #[test]
    fn test_type_mismatch() {
        let broker = broker();
        let key = SessionKey::new("fake", "host", 1);
        broker.obtain(key.clone(), FakeSession::new).unwrap();
        let result = broker.obtain(key, |k| OtherSession {
            state: SessionState::new(k),
        });
        assert!(matches!(result, Err(RelayError::SessionTypeMismatch(_))));
    }

    #[test]
    fn test_dispose_disconnects() {
        let broker = broker();
        let key = SessionKey::new("fake", "host", 1);
        let session = broker.obtain(key.clone(), FakeSession::new).unwrap();
        assert!(broker.dispose(&key));
        assert!(!broker.dispose(&key));
        assert_eq!(session.disconnects.load(Ordering::SeqCst), 1);
        assert!(!session.is_connected());
        assert_eq!(broker.count(), 0);
    }

    #[test]
    fn test_service_evicts_only_failing_session() {
        let broker = broker();
        let good_key = SessionKey::new("fake", "good", 1);
        let bad_key = SessionKey::new("fake", "bad", 1);
        let good = broker.obtain(good_key.clone(), FakeSession::probing).unwrap();
        let bad = broker.obtain(bad_key.clone(), FakeSession::probing).unwrap();
        bad.alive.store(false, Ordering::SeqCst);

        thread::sleep(Duration::from_millis(5));
        let report = broker.service();

        assert_eq!(report.evicted, vec![bad_key.clone()]);
        assert_eq!(report.probed.len(), 2);
        assert!(broker.contains(&good_key));
        assert!(!broker.contains(&bad_key));
        assert_eq!(good.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(bad.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_removes_disconnected() {
        let broker = broker();
        let key = SessionKey::new("fake", "host", 1);
        let session = broker.obtain(key.clone(), FakeSession::new).unwrap();
        session.state().set_connected(false);
        let report = broker.service();
        assert_eq!(report.evicted, vec![key]);
        assert!(report.probed.is_empty());
    }

    #[test]
    fn test_service_skips_busy_and_disabled() {
        let broker = broker();
        let busy_key = SessionKey::new("fake", "busy", 1);
        let busy = broker.obtain(busy_key.clone(), FakeSession::probing).unwrap();
        busy.alive.store(false, Ordering::SeqCst);
        let idle_key = SessionKey::new("fake", "never", 1);
        let never = broker.obtain(idle_key.clone(), FakeSession::new).unwrap();
        never.alive.store(false, Ordering::SeqCst);

        let guard = busy.state().begin_io();
        thread::sleep(Duration::from_millis(5));
        let report = broker.service();
        drop(guard);

        assert_eq!(report.busy, 1);
        assert!(report.probed.is_empty());
        assert_eq!(broker.count(), 2);
    }

    #[test]
    fn test_maybe_service_is_rate_limited() {
        let broker = broker();
        assert!(broker.maybe_service().is_some());
        assert!(broker.maybe_service().is_none());
    }

    #[test]
    fn test_clear_disconnects_all() {
        let broker = broker();
        let a = broker.obtain(SessionKey::new("fake", "a", 1), FakeSession::new).unwrap();
        let b = broker.obtain(SessionKey::new("fake", "b", 1), FakeSession::new).unwrap();
        broker.clear();
        assert_eq!(broker.count(), 0);
        assert!(!a.is_connected());
        assert!(!b.is_connected());
    }

    #[test]
    fn test_background_sweep_evicts() {
        let broker = Arc::new(SessionBroker::new(BrokerConfig {
            sweep_interval_ms: 10,
            ..BrokerConfig::default()
        }));
        broker.init().unwrap();
        let key = SessionKey::new("fake", "host", 1);
        let session = broker.obtain(key.clone(), FakeSession::new).unwrap();
        session.state().set_connected(false);

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.contains(&key) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!broker.contains(&key));
        broker.shutdown();
    }
}
