//! Keyed session cache with idle eviction
//!
//! [`SessionManager`] maps keys to [`Session`]s and tracks when each one was
//! last used. Depending on the [`EvictionPolicy`] a background sweeper
//! evicts sessions that have been idle for longer than the TTL.
//!
//! The manager does not watch runs itself: callers report activity with
//! [`SessionManager::update_session_clock`]. A session with a run in flight
//! is never evicted, whatever its clock says.
//!
//! # Example
//!
//! ```ignore
//! let manager = SessionManager::new(Arc::new(OnnxEngine::new()?));
//! manager.set_timeout(30).await?;
//!
//! let session = manager.get_or_create("detector", &ModelConfig::new("detector.onnx"))?;
//! let outputs = session.run(inputs, None)?;
//! manager.update_session_clock("detector");
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::config::{ManagerConfig, ModelConfig};
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::sweeper::Sweeper;

/// Shortest sweeper poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// When sessions are evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Sessions live until deleted
    #[default]
    Disabled,
    /// Sessions that have run were flushed; nothing is swept
    Flush,
    /// Sessions idle for longer than this are evicted by the sweeper
    Idle(Duration),
}

impl EvictionPolicy {
    /// Map a TTL in seconds: negative disables, 0 flushes, positive is idle
    #[must_use]
    pub fn from_ttl_secs(ttl: i64) -> Self {
        match ttl {
            t if t < 0 => Self::Disabled,
            0 => Self::Flush,
            t => Self::Idle(Duration::from_secs(t.unsigned_abs())),
        }
    }

    /// Idle threshold, if sweeping
    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Idle(ttl) => Some(*ttl),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    clocks: HashMap<String, Instant>,
    policy: EvictionPolicy,
}

impl Registry {
    fn remove(&mut self, key: &str) -> Option<Arc<Session>> {
        self.clocks.remove(key);
        self.sessions.remove(key)
    }
}

/// State shared with the sweeper task
pub(crate) struct Shared {
    registry: Mutex<Registry>,
}

impl Shared {
    /// One eviction pass as of `now`
    ///
    /// Evicts every session idle for strictly longer than the TTL that has
    /// no run in flight. Does nothing unless the policy is
    /// [`EvictionPolicy::Idle`]. Returns the evicted keys.
    pub(crate) fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let mut detached = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut registry = self.registry.lock();
            let Some(ttl) = registry.policy.ttl() else {
                return Vec::new();
            };

            let expired: Vec<String> = registry
                .clocks
                .iter()
                .filter(|(_, last)| now.saturating_duration_since(**last) > ttl)
                .map(|(key, _)| key.clone())
                .collect();

            for key in expired {
                if let Some(session) = registry.sessions.get(&key) {
                    let Some(handle) = session.try_release() else {
                        debug!(key = %key, "Session busy, eviction postponed");
                        continue;
                    };
                    detached.push(handle);
                }
                registry.remove(&key);
                info!(key = %key, ttl = ?ttl, "Evicted idle session");
                evicted.push(key);
            }
        }
        // Engine teardown happens with the registry unlocked
        drop(detached);
        evicted
    }
}

/// Keyed cache of inference sessions
pub struct SessionManager {
    engine: Arc<dyn InferenceEngine>,
    backends: BackendRegistry,
    shared: Arc<Shared>,
    poll_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionManager {
    /// Manager with the default backend registry, eviction disabled
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            backends: BackendRegistry::default(),
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
            }),
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
            sweeper: Mutex::new(None),
        }
    }

    /// Use a custom backend registry
    #[must_use]
    pub fn with_backend_registry(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    /// Set the sweeper poll interval
    ///
    /// Takes effect the next time the sweeper starts. Intervals shorter
    /// than [`MIN_POLL_INTERVAL`] are raised to it.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        if poll_interval < MIN_POLL_INTERVAL {
            warn!(requested = ?poll_interval, min = ?MIN_POLL_INTERVAL, "Poll interval too short, clamped");
        }
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Sweeper poll interval in effect
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Manager configured from a [`ManagerConfig`]
    ///
    /// An idle policy starts the sweeper, which needs a tokio runtime.
    pub fn from_config(engine: Arc<dyn InferenceEngine>, config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        let manager = Self::new(engine).with_poll_interval(config.eviction.poll_interval());
        match config.eviction.policy() {
            EvictionPolicy::Idle(ttl) => manager.enable_idle(ttl)?,
            policy => manager.shared.registry.lock().policy = policy,
        }
        Ok(manager)
    }

    fn build(&self, key: &str, config: &ModelConfig) -> Result<Arc<Session>> {
        Session::open(self.engine.as_ref(), key, config, &self.backends).map(Arc::new)
    }

    /// Build (or rebuild) the session for `key`
    ///
    /// A session already stored under `key` is replaced and released. The
    /// access clock is reset.
    pub fn create_model(&self, key: &str, config: &ModelConfig) -> Result<Arc<Session>> {
        let session = self.build(key, config)?;

        let previous = {
            let mut registry = self.shared.registry.lock();
            registry.clocks.insert(key.to_string(), Instant::now());
            registry.sessions.insert(key.to_string(), Arc::clone(&session))
        };
        if let Some(previous) = previous {
            debug!(key = %key, "Replaced existing session");
            previous.mark_released();
        }

        Ok(session)
    }

    /// Cached session for `key`, building it on first use
    pub fn get_or_create(&self, key: &str, config: &ModelConfig) -> Result<Arc<Session>> {
        if let Some(session) = self.shared.registry.lock().sessions.get(key) {
            return Ok(Arc::clone(session));
        }

        let session = self.build(key, config)?;

        let mut registry = self.shared.registry.lock();
        // Another caller may have built it while the lock was free
        if let Some(existing) = registry.sessions.get(key) {
            return Ok(Arc::clone(existing));
        }
        registry.clocks.insert(key.to_string(), Instant::now());
        registry.sessions.insert(key.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Stored session for `key`
    pub fn get_model(&self, key: &str) -> Result<Arc<Session>> {
        self.shared
            .registry
            .lock()
            .sessions
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound { key: key.to_string() })
    }

    /// Delete and release the session for `key`
    ///
    /// A run in flight finishes first; the engine handle is released when
    /// it completes.
    pub fn del_model(&self, key: &str) -> Result<()> {
        let removed = self.shared.registry.lock().remove(key);
        match removed {
            Some(session) => {
                session.mark_released();
                info!(key = %key, "Deleted session");
                Ok(())
            }
            None => {
                warn!(key = %key, "Delete requested for unknown session");
                Err(Error::NotFound { key: key.to_string() })
            }
        }
    }

    /// Record now as the last access time of `key`
    ///
    /// Returns false for unknown keys, which get no clock entry.
    pub fn update_session_clock(&self, key: &str) -> bool {
        let mut registry = self.shared.registry.lock();
        if !registry.sessions.contains_key(key) {
            debug!(key = %key, "Clock update for unknown session ignored");
            return false;
        }
        registry.clocks.insert(key.to_string(), Instant::now());
        true
    }

    /// Time since the last access of `key`, zero if unknown
    #[must_use]
    pub fn session_clock(&self, key: &str) -> Duration {
        self.shared
            .registry
            .lock()
            .clocks
            .get(key)
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    /// Reconfigure eviction from a TTL in seconds
    ///
    /// `-1` disables eviction, `0` flushes every session that has run and
    /// `n > 0` evicts sessions idle for more than `n` seconds.
    pub async fn set_timeout(&self, ttl_secs: i64) -> Result<()> {
        self.set_policy(EvictionPolicy::from_ttl_secs(ttl_secs)).await
    }

    /// Reconfigure eviction
    pub async fn set_policy(&self, policy: EvictionPolicy) -> Result<()> {
        match policy {
            EvictionPolicy::Disabled => {
                self.shared.registry.lock().policy = policy;
                self.stop_sweeper().await;
            }
            EvictionPolicy::Flush => {
                let flushed = {
                    let mut registry = self.shared.registry.lock();
                    registry.policy = policy;
                    let keys: Vec<String> = registry
                        .sessions
                        .iter()
                        .filter(|(_, s)| s.has_run())
                        .map(|(k, _)| k.clone())
                        .collect();
                    let mut flushed = Vec::with_capacity(keys.len());
                    for key in keys {
                        if let Some(session) = registry.remove(&key) {
                            flushed.push((key, session));
                        }
                    }
                    flushed
                };
                for (_, session) in &flushed {
                    session.mark_released();
                }
                info!(flushed = flushed.len(), "Flushed sessions that have run");
                self.stop_sweeper().await;
            }
            EvictionPolicy::Idle(ttl) => self.enable_idle(ttl)?,
        }
        Ok(())
    }

    /// Switch to idle eviction and make sure the sweeper runs
    ///
    /// Fails with [`Error::NoRuntime`] outside a tokio runtime, leaving the
    /// current policy in place.
    pub fn enable_idle(&self, ttl: Duration) -> Result<()> {
        self.start_sweeper()?;
        self.shared.registry.lock().policy = EvictionPolicy::Idle(ttl);
        info!(ttl = ?ttl, "Idle eviction enabled");
        Ok(())
    }

    /// Current eviction policy
    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.shared.registry.lock().policy
    }

    /// Start the sweeper if it is not running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(Sweeper::is_running) {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        *sweeper = Some(Sweeper::spawn(&runtime, Arc::clone(&self.shared), self.poll_interval));
        Ok(())
    }

    /// Stop the sweeper and wait for it to exit
    pub async fn stop_sweeper(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }

    /// Whether the sweeper task is running
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(Sweeper::is_running)
    }

    /// One synchronous sweep pass as of `now`
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        self.shared.sweep_expired(now)
    }

    /// Stop the sweeper and release every session
    pub async fn shutdown(&self) {
        self.stop_sweeper().await;
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.shared.registry.lock();
            registry.clocks.clear();
            let drained: Vec<Arc<Session>> = registry.sessions.drain().map(|(_, s)| s).collect();
            drained
        };
        for session in &sessions {
            session.mark_released();
        }
        info!(released = sessions.len(), "Session manager shut down");
    }

    /// Number of stored sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.registry.lock().sessions.len()
    }

    /// Whether no sessions are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.registry.lock().sessions.is_empty()
    }

    /// Whether a session is stored under `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.shared.registry.lock().sessions.contains_key(key)
    }

    /// Stored keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.registry.lock().sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a clock entry exists for `key`
    #[must_use]
    pub fn has_clock(&self, key: &str) -> bool {
        self.shared.registry.lock().clocks.contains_key(key)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.signal();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("engine", &self.engine.name())
            .field("sessions", &self.len())
            .field("policy", &self.policy())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
