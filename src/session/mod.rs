//! In-memory registry of live VPN sessions
//!
//! The gateway reports every client connect and disconnect to the agent; this
//! registry is where those reports land. It is a single map behind a
//! reader/writer lock: reads share the lock, writes take it exclusively, and
//! every returned session is an owned copy.
//!
//! # Expiry
//!
//! With a TTL configured, every insert and every update stamps an expiry
//! `TTL` into the future. Expired sessions are hidden from all reads at once,
//! and a background sweeper (period `TTL / 2`) removes them physically. The
//! read-time check keeps results correct while the sweeper is behind.
//!
//! The sweeper is owned by the store: it stops when the store's cancellation
//! token fires, when [`SessionStore::shutdown`] is awaited, or when the store
//! is dropped.
//!
//! Nothing here logs. Callers get errors that carry the session id.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Lower bound on the sweep period so tiny TTLs do not spin
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

type SessionMap = HashMap<String, VpnSession>;

/// Boxed error returned by an update closure
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Session registry errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller-correctable input problem
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No session with this id
    #[error("session not found: {0}")]
    NotFound(String),

    /// Session exists but its expiry has passed
    #[error("session expired: {0}")]
    Expired(String),

    /// The caller's update closure failed; nothing was committed
    #[error("update of session {id} failed: {source}")]
    UpdateFailed {
        /// Session being updated
        id: String,
        /// Error returned by the closure
        #[source]
        source: BoxError,
    },
}

impl SessionError {
    /// True for `NotFound` and `Expired`, which callers treat alike
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Expired(_))
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// One connected VPN client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VpnSession {
    /// Gateway-assigned identifier, unique while present
    pub session_id: String,
    /// Authenticated user
    pub username: String,
    /// Public address of the client
    pub client_ip: String,
    /// Address assigned inside the tunnel
    pub vpn_ip: String,
    /// Client device identifier, may be empty
    pub device_id: String,
    /// Filled in by the registry when absent
    pub connected_at: Option<DateTime<Utc>>,
    /// Refreshed by every update
    pub last_activity: Option<DateTime<Utc>>,
    /// Set by the registry when a TTL is configured, `None` otherwise
    pub expires_at: Option<DateTime<Utc>>,
    /// Bytes received from the client
    pub bytes_in: u64,
    /// Bytes sent to the client
    pub bytes_out: u64,
    /// Free-form attributes reported by the gateway
    pub metadata: HashMap<String, String>,
}

impl VpnSession {
    /// Session with the two required fields set
    pub fn new(session_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Whether the expiry, if any, is before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }

    /// Whether the session is expired right now
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Aggregate view of live sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Live sessions
    pub total_sessions: usize,
    /// Sum of `bytes_in` over live sessions
    pub total_bytes_in: u64,
    /// Sum of `bytes_out` over live sessions
    pub total_bytes_out: u64,
    /// Live sessions per username
    pub sessions_by_user: HashMap<String, usize>,
}

/// Concurrent session registry with optional TTL
pub struct SessionStore {
    sessions: Arc<RwLock<SessionMap>>,
    ttl: Option<Duration>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    /// Create a registry; `None` or a zero TTL disables expiry
    ///
    /// The sweeper is started when a TTL is set and a Tokio runtime is
    /// available. Without a runtime expiry still applies at read time.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_cancellation(ttl, CancellationToken::new())
    }

    /// Create a registry whose sweeper stops when `parent` fires
    ///
    /// The store only ever cancels its own child of `parent`, so shutting it
    /// down or dropping it leaves the caller's token untouched.
    pub fn with_cancellation(ttl: Option<Duration>, parent: CancellationToken) -> Self {
        let cancel = parent.child_token();
        let ttl = ttl.filter(|ttl| !ttl.is_zero());
        let sessions = Arc::new(RwLock::new(SessionMap::new()));

        let sweeper = ttl.and_then(|ttl| {
            spawn_sweeper(Arc::downgrade(&sessions), ttl, cancel.clone())
        });

        Self {
            sessions,
            ttl,
            cancel,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Configured TTL, if any
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Insert or overwrite a session
    ///
    /// Missing `connected_at`/`last_activity` are set to now and the expiry is
    /// recomputed from the TTL. An existing entry with the same id is replaced.
    pub fn add(&self, mut session: VpnSession) -> Result<()> {
        validate(&session)?;
        self.stamp_new(&mut session, Utc::now());
        self.sessions
            .write()
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    /// Copy of a live session
    pub fn get(&self, id: &str) -> Result<VpnSession> {
        if id.is_empty() {
            return Err(SessionError::InvalidArgument("session_id is required"));
        }

        let sessions = self.sessions.read();
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.is_expired() {
            return Err(SessionError::Expired(id.to_string()));
        }
        Ok(session.clone())
    }

    /// Apply `mutate` to a session under the write lock
    ///
    /// The closure works on a copy; the copy is committed, with a fresh
    /// `last_activity` and expiry, only if it returns `Ok`. The session id is
    /// the map key and cannot be changed by the closure.
    ///
    /// The closure runs while the registry is locked and must not call back
    /// into this registry; doing so deadlocks.
    pub fn update<F, E>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut VpnSession) -> std::result::Result<(), E>,
        E: Into<BoxError>,
    {
        if id.is_empty() {
            return Err(SessionError::InvalidArgument("session_id is required"));
        }

        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if entry.is_expired_at(now) {
            return Err(SessionError::Expired(id.to_string()));
        }

        let mut draft = entry.clone();
        mutate(&mut draft).map_err(|e| SessionError::UpdateFailed {
            id: id.to_string(),
            source: e.into(),
        })?;

        draft.session_id = id.to_string();
        draft.last_activity = Some(now);
        if self.ttl.is_some() {
            draft.expires_at = self.expiry_from(now);
        }
        *entry = draft;
        Ok(())
    }

    /// Overwrite the traffic counters of a session
    pub fn update_stats(&self, id: &str, bytes_in: u64, bytes_out: u64) -> Result<()> {
        self.update(id, |session| {
            session.bytes_in = bytes_in;
            session.bytes_out = bytes_out;
            Ok::<(), Infallible>(())
        })
    }

    /// Remove a session, expired or not
    pub fn remove(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(SessionError::InvalidArgument("session_id is required"));
        }

        self.sessions
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Copies of all live sessions, in no particular order
    pub fn list(&self) -> Vec<VpnSession> {
        self.collect_live(|_| true)
    }

    /// Copies of all live sessions of `username`
    pub fn list_by_username(&self, username: &str) -> Vec<VpnSession> {
        self.collect_live(|s| s.username == username)
    }

    /// Number of live sessions
    pub fn count(&self) -> usize {
        self.count_live(|_| true)
    }

    /// Number of live sessions of `username`
    pub fn count_by_username(&self, username: &str) -> usize {
        self.count_live(|s| s.username == username)
    }

    /// Remove every session of `username`, expired or not
    ///
    /// Returns how many entries were removed.
    pub fn remove_by_username(&self, username: &str) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.username != username);
        before - sessions.len()
    }

    /// Return the live session with this id, or insert `session`
    ///
    /// The lookup and the insert happen under one write lock. The boolean is
    /// `true` when `session` was inserted.
    pub fn get_or_create(&self, mut session: VpnSession) -> Result<(VpnSession, bool)> {
        validate(&session)?;

        let now = Utc::now();
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&session.session_id) {
            if !existing.is_expired_at(now) {
                return Ok((existing.clone(), false));
            }
        }

        self.stamp_new(&mut session, now);
        sessions.insert(session.session_id.clone(), session.clone());
        Ok((session, true))
    }

    /// Remove everything
    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    /// Whether a live session with this id exists
    pub fn exists(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    /// Totals over live sessions
    pub fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let sessions = self.sessions.read();

        let mut stats = SessionStats::default();
        for session in sessions.values().filter(|s| !s.is_expired_at(now)) {
            stats.total_sessions += 1;
            stats.total_bytes_in = stats.total_bytes_in.saturating_add(session.bytes_in);
            stats.total_bytes_out = stats.total_bytes_out.saturating_add(session.bytes_out);
            *stats
                .sessions_by_user
                .entry(session.username.clone())
                .or_default() += 1;
        }
        stats
    }

    /// Physically remove expired sessions now
    ///
    /// The background sweeper calls the same routine. Returns how many
    /// entries were removed.
    pub fn sweep_expired(&self) -> usize {
        evict_expired(&self.sessions, Utc::now())
    }

    /// Stop the sweeper and wait for it to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn stamp_new(&self, session: &mut VpnSession, now: DateTime<Utc>) {
        session.connected_at.get_or_insert(now);
        session.last_activity.get_or_insert(now);
        session.expires_at = self.expiry_from(now);
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        now.checked_add_signed(ttl)
    }

    fn collect_live(&self, filter: impl Fn(&VpnSession) -> bool) -> Vec<VpnSession> {
        let now = Utc::now();
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_expired_at(now) && filter(s))
            .cloned()
            .collect()
    }

    fn count_live(&self, filter: impl Fn(&VpnSession) -> bool) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_expired_at(now) && filter(s))
            .count()
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn validate(session: &VpnSession) -> Result<()> {
    if session.session_id.is_empty() {
        return Err(SessionError::InvalidArgument("session_id is required"));
    }
    if session.username.is_empty() {
        return Err(SessionError::InvalidArgument("username is required"));
    }
    Ok(())
}

fn evict_expired(sessions: &RwLock<SessionMap>, now: DateTime<Utc>) -> usize {
    let mut sessions = sessions.write();
    let before = sessions.len();
    sessions.retain(|_, s| !s.is_expired_at(now));
    before - sessions.len()
}

fn spawn_sweeper(
    sessions: Weak<RwLock<SessionMap>>,
    ttl: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let period = (ttl / 2).max(MIN_SWEEP_INTERVAL);

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; nothing can have expired yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(sessions) = sessions.upgrade() else { break };
                    evict_expired(&sessions, Utc::now());
                }
            }
        }
    }))
}
