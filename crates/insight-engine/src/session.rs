use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use insight_core::errors::SessionError;
use insight_core::ids::{SessionId, UserId};
use insight_core::session::SessionGate;

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Process-local session store. Sessions are scoped per user; the same
/// session id under another user is a different session.
///
/// Bounded two ways: a session unused for `idle_ttl` is forgotten, and at
/// `max_sessions` the least recently used session makes room for a new one.
pub struct InMemorySessionGate {
    sessions: DashMap<(UserId, SessionId), Instant>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl Default for InMemorySessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionGate {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_IDLE_TTL, DEFAULT_MAX_SESSIONS)
    }

    pub fn with_limits(idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forget idle sessions. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.sessions.retain(|_, last_seen| {
            let keep = now.duration_since(*last_seen) < self.idle_ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn is_live(&self, last_seen: Instant, now: Instant) -> bool {
        now.duration_since(last_seen) < self.idle_ttl
    }

    fn make_room(&self) {
        if self.sessions.len() < self.max_sessions {
            return;
        }
        let swept = self.sweep_expired();
        if self.sessions.len() < self.max_sessions {
            debug!(swept, "idle sessions swept");
            return;
        }
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.sessions.remove(&key);
            debug!(session_id = %key.1, "session evicted at capacity");
        }
    }
}

#[async_trait]
impl SessionGate for InMemorySessionGate {
    async fn get(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), SessionError> {
        let key = (user_id.clone(), session_id.clone());
        let now = Instant::now();
        if let Some(mut last_seen) = self.sessions.get_mut(&key) {
            if self.is_live(*last_seen, now) {
                *last_seen = now;
                return Ok(());
            }
        }
        self.sessions
            .remove_if(&key, |_, last_seen| !self.is_live(*last_seen, now));
        Err(SessionError::NotFound(session_id.to_string()))
    }

    async fn create(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), SessionError> {
        self.make_room();
        let now = Instant::now();
        match self.sessions.entry((user_id.clone(), session_id.clone())) {
            Entry::Occupied(mut slot) if !self.is_live(*slot.get(), now) => {
                slot.insert(now);
                Ok(())
            }
            Entry::Occupied(_) => Err(SessionError::AlreadyExists(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(())
            }
        }
    }
}
