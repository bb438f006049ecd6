//! Per-transfer sender state keyed by (peer address, transfer id).
//!
//! Sessions are created when a request is dispatched and cleaned up once
//! their store drains, after `idle_timeout` without a datagram, or when a
//! newer session displaces the least recently active one from a full table.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

/// Default idle timeout for a session.
pub const SESSION_TIMEOUT_SECS: u64 = 60;

/// Default upper bound on concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: SocketAddr,
    pub transfer_id: Uuid,
}

impl SessionKey {
    pub fn new(peer: SocketAddr, transfer_id: Uuid) -> Self {
        Self { peer, transfer_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.transfer_id)
    }
}

struct Entry<S> {
    state: S,
    last_activity: Instant,
}

pub struct SessionTable<S> {
    sessions: HashMap<SessionKey, Entry<S>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl<S> SessionTable<S> {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions: max_sessions.max(1),
            idle_timeout,
        }
    }

    /// Insert or replace a session. When the table is full and `key` is new,
    /// the least recently active session is removed and its key returned.
    pub fn insert(&mut self, key: SessionKey, state: S, now: Instant) -> Option<SessionKey> {
        let mut displaced = None;
        if !self.sessions.contains_key(&key) && self.sessions.len() >= self.max_sessions {
            displaced = self
                .sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_activity)
                .map(|(k, _)| *k);
            if let Some(old) = displaced {
                self.sessions.remove(&old);
            }
        }
        self.sessions.insert(
            key,
            Entry {
                state,
                last_activity: now,
            },
        );
        displaced
    }

    /// Look up a session and mark it active.
    pub fn get_mut(&mut self, key: &SessionKey, now: Instant) -> Option<&mut S> {
        let entry = self.sessions.get_mut(key)?;
        entry.last_activity = now;
        Some(&mut entry.state)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<S> {
        self.sessions.remove(key).map(|entry| entry.state)
    }

    /// Iterate sessions without touching their activity time.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SessionKey, &mut S)> {
        self.sessions.iter_mut().map(|(k, entry)| (k, &mut entry.state))
    }

    /// Remove sessions idle for at least `idle_timeout`. Returns their keys.
    pub fn reap_idle(&mut self, now: Instant) -> Vec<SessionKey> {
        let timeout = self.idle_timeout;
        let mut reaped = Vec::new();
        self.sessions.retain(|key, entry| {
            let alive = now.saturating_duration_since(entry.last_activity) < timeout;
            if !alive {
                debug!(session = %key, "reaping idle session");
                reaped.push(*key);
            }
            alive
        });
        reaped
    }

    /// When the least recently active session will become idle. `None` also
    /// covers timeouts too long for the clock to represent.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|entry| entry.last_activity.checked_add(self.idle_timeout))
            .min()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
