//! Tutor session storage.
//!
//! [`SessionStore`] is the seam the FSM talks to. [`InMemorySessionStore`]
//! keeps sessions in process memory, bounded by an LRU capacity and a TTL
//! measured from the last update.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use crate::config::SessionsConfig;
use crate::error::AppError;

use super::Stage;

/// State carried between turns of one tutoring conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TutorSession {
    pub session_id: String,
    /// Stage that will handle the next input.
    pub stage: Stage,
    pub question: String,
    /// Rendered retrieval result (passages or the no-context sentinel).
    pub context: String,
    pub keywords: Vec<String>,
}

impl TutorSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            stage: Stage::Diagnose,
            question: String::new(),
            context: String::new(),
            keywords: Vec::new(),
        }
    }
}

pub trait SessionStore: Send + Sync {
    /// Insert a fresh session under `session_id`, replacing any existing one.
    fn create(&self, session_id: &str) -> Result<TutorSession, AppError>;

    /// Live session for `session_id`. Expired entries are dropped and read
    /// as absent.
    fn get(&self, session_id: &str) -> Result<Option<TutorSession>, AppError>;

    /// Write `session` back and refresh its TTL.
    fn update(&self, session: &TutorSession) -> Result<(), AppError>;

    /// Drop every expired session; returns how many were removed.
    fn expire(&self) -> Result<usize, AppError>;

    /// Mutex serializing turns on one session id. Callers hold it across
    /// get → transition → update.
    fn session_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>, AppError>;

    fn len(&self) -> Result<usize, AppError>;

    fn is_empty(&self) -> Result<bool, AppError> {
        Ok(self.len()? == 0)
    }
}

struct Slot {
    session: TutorSession,
    touched: Instant,
}

pub struct InMemorySessionStore {
    sessions: Mutex<LruCache<String, Slot>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            locks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_config(cfg: &SessionsConfig) -> Result<Self, AppError> {
        let capacity = NonZeroUsize::new(cfg.capacity)
            .ok_or_else(|| AppError::Config("sessions.capacity must be > 0".into()))?;
        if cfg.ttl_seconds == 0 {
            return Err(AppError::Config("sessions.ttl_seconds must be > 0".into()));
        }
        Ok(Self::new(capacity, Duration::from_secs(cfg.ttl_seconds)))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Slot>>, AppError> {
        self.sessions
            .lock()
            .map_err(|_| AppError::Session("session store lock poisoned".into()))
    }

    fn locks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>>, AppError> {
        self.locks
            .lock()
            .map_err(|_| AppError::Session("session lock table poisoned".into()))
    }

    fn is_expired(&self, slot: &Slot, now: Instant) -> bool {
        now.saturating_duration_since(slot.touched) > self.ttl
    }

    fn put(&self, session: TutorSession, now: Instant) -> Result<(), AppError> {
        let id = session.session_id.clone();
        let evicted = self.sessions()?.push(id.clone(), Slot { session, touched: now });
        match evicted {
            Some((old_id, _)) if old_id != id => {
                debug!(session_id = %old_id, "session evicted (capacity)");
            }
            _ => {}
        }
        Ok(())
    }

    /// [`SessionStore::expire`] against an explicit clock.
    pub fn expire_at(&self, now: Instant) -> Result<usize, AppError> {
        let removed = {
            let mut sessions = self.sessions()?;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, slot)| self.is_expired(slot, now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                sessions.pop(id);
            }
            expired.len()
        };

        // Forget locks nobody holds for sessions that no longer exist.
        let sessions = self.sessions()?;
        self.locks()?
            .retain(|id, lock| Arc::strong_count(lock) > 1 || sessions.contains(id));

        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "expired tutor sessions");
        }
        Ok(removed)
    }

    /// [`SessionStore::get`] against an explicit clock.
    pub fn get_at(&self, session_id: &str, now: Instant) -> Result<Option<TutorSession>, AppError> {
        let mut sessions = self.sessions()?;
        match sessions.get(session_id) {
            None => Ok(None),
            Some(slot) if !self.is_expired(slot, now) => Ok(Some(slot.session.clone())),
            Some(_) => {
                sessions.pop(session_id);
                debug!(session_id = %session_id, "session expired");
                Ok(None)
            }
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, session_id: &str) -> Result<TutorSession, AppError> {
        let session = TutorSession::new(session_id);
        self.put(session.clone(), Instant::now())?;
        debug!(session_id = %session_id, "session created");
        Ok(session)
    }

    fn get(&self, session_id: &str) -> Result<Option<TutorSession>, AppError> {
        self.get_at(session_id, Instant::now())
    }

    fn update(&self, session: &TutorSession) -> Result<(), AppError> {
        self.put(session.clone(), Instant::now())
    }

    fn expire(&self) -> Result<usize, AppError> {
        self.expire_at(Instant::now())
    }

    fn session_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>, AppError> {
        Ok(self.locks()?.entry(session_id.to_string()).or_default().clone())
    }

    fn len(&self) -> Result<usize, AppError> {
        Ok(self.sessions()?.len())
    }
}
