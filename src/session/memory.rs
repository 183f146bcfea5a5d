//! In-process session store for single-instance deployments and tests.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use super::store::SessionStore;
use super::types::{SessionId, SessionState, StoredSession};

pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
    assertions: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl_secs: u64,
}

impl MemorySessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            assertions: Mutex::new(HashMap::new()),
            ttl_secs,
        }
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("session store lock poisoned")
}

impl SessionStore for MemorySessionStore {
    fn load(&self, id: SessionId) -> Result<Option<SessionState>> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        match sessions.get_mut(&id) {
            Some(session) if !session.is_expired() => {
                session.last_accessed = Utc::now();
                Ok(Some(session.state.clone()))
            }
            _ => Ok(None),
        }
    }

    fn save(&self, id: SessionId, state: &SessionState) -> Result<()> {
        let session = StoredSession::new(state.clone(), self.ttl_secs);
        self.sessions.write().map_err(poisoned)?.insert(id, session);
        Ok(())
    }

    fn clear(&self, id: SessionId) -> Result<bool> {
        Ok(self.sessions.write().map_err(poisoned)?.remove(&id).is_some())
    }

    fn record_assertion(&self, assertion_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut assertions = self.assertions.lock().map_err(poisoned)?;
        if assertions.contains_key(assertion_id) {
            return Ok(false);
        }
        assertions.insert(assertion_id.to_string(), expires_at);
        Ok(true)
    }

    fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let evicted = {
            let mut sessions = self.sessions.write().map_err(poisoned)?;
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_expired());
            before - sessions.len()
        };
        self.assertions
            .lock()
            .map_err(poisoned)?
            .retain(|_, expires_at| now <= *expires_at);
        Ok(evicted)
    }

    fn session_count(&self) -> Result<usize> {
        Ok(self.sessions.read().map_err(poisoned)?.len())
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }
}
