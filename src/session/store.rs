//! Session store backed by redb embedded database.
//!
//! Provides persistent storage for SAML sessions with:
//! - In-memory cache for hot sessions
//! - Replay prevention via assertion ID tracking
//! - TTL-based expiry

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{SessionId, SessionState, StoredSession};

/// Storage contract for session records and the assertion replay ledger.
pub trait SessionStore: Send + Sync {
    /// Load a live session. Expired sessions load as `None`.
    fn load(&self, id: SessionId) -> Result<Option<SessionState>>;

    /// Store `state` under `id`, extending its expiry by the store TTL.
    fn save(&self, id: SessionId, state: &SessionState) -> Result<()>;

    /// Remove a session. Returns whether it existed.
    fn clear(&self, id: SessionId) -> Result<bool>;

    /// Record a consumed assertion ID until `expires_at`.
    ///
    /// Returns `false` when the ID was already recorded.
    fn record_assertion(&self, assertion_id: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Evict expired sessions and replay records. Returns the number of
    /// sessions evicted.
    fn evict_expired(&self) -> Result<usize>;

    fn session_count(&self) -> Result<usize>;

    /// Session TTL in seconds.
    fn ttl_secs(&self) -> u64;
}

/// redb table for sessions (key: session_id hex, value: MessagePack bytes).
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_sessions");

/// redb table for assertion ID tracking (key: assertion_id, value: expiry timestamp).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_assertions");

/// Session store with in-memory cache and persistent storage.
pub struct RedbSessionStore {
    /// redb database handle.
    db: Database,

    /// In-memory cache for frequently accessed sessions.
    cache: RwLock<HashMap<SessionId, StoredSession>>,

    /// Session TTL in seconds.
    ttl_secs: u64,

    /// Maximum number of sessions to keep in cache.
    max_cache_size: usize,
}

impl RedbSessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: PathBuf, ttl_secs: u64) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            ttl_secs,
            max_cache_size: 10000,
        })
    }

    fn persist(&self, id: SessionId, session: &StoredSession) -> Result<()> {
        let data = rmp_serde::to_vec(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn cache_insert(&self, id: SessionId, session: StoredSession) {
        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_cache_size && !cache.contains_key(&id) {
                Self::evict_cache_lru(&mut cache);
            }
            cache.insert(id, session);
        }
    }

    /// Load all non-expired sessions into cache.
    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionId, StoredSession>> {
        let mut sessions = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        for entry in table.iter()? {
            let (key, value) = entry?;
            let Some(id) = SessionId::from_hex(key.value()) else {
                continue;
            };
            match rmp_serde::from_slice::<StoredSession>(value.value()) {
                Ok(session) if !session.is_expired() => {
                    sessions.insert(id, session);
                }
                _ => {}
            }
        }

        Ok(sessions)
    }

    /// Evict least recently accessed sessions from cache.
    fn evict_cache_lru(cache: &mut HashMap<SessionId, StoredSession>) {
        if let Some(oldest_id) = cache
            .iter()
            .min_by_key(|(_, s)| s.last_accessed)
            .map(|(id, _)| *id)
        {
            cache.remove(&oldest_id);
        }
    }

    fn remove_keys(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        keys: &[String],
    ) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut removed = 0;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            for key in keys {
                if table.remove(key.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }
}

impl SessionStore for RedbSessionStore {
    fn load(&self, id: SessionId) -> Result<Option<SessionState>> {
        // Check cache first
        if let Ok(mut cache) = self.cache.write() {
            if let Some(session) = cache.get_mut(&id) {
                if session.is_expired() {
                    // Left for cleanup to delete from disk
                    cache.remove(&id);
                    return Ok(None);
                }
                session.last_accessed = Utc::now();
                return Ok(Some(session.state.clone()));
            }
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let key = id.to_hex();
        let Some(value) = table.get(key.as_str())? else {
            return Ok(None);
        };
        let mut session: StoredSession =
            rmp_serde::from_slice(value.value()).context("Failed to deserialize session")?;
        if session.is_expired() {
            return Ok(None);
        }

        session.last_accessed = Utc::now();
        let state = session.state.clone();
        self.cache_insert(id, session);
        Ok(Some(state))
    }

    fn save(&self, id: SessionId, state: &SessionState) -> Result<()> {
        let session = StoredSession::new(state.clone(), self.ttl_secs);
        self.persist(id, &session)?;
        self.cache_insert(id, session);
        Ok(())
    }

    fn clear(&self, id: SessionId) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }
        Ok(self.remove_keys(SESSIONS_TABLE, &[id.to_hex()])? > 0)
    }

    fn record_assertion(&self, assertion_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let data = rmp_serde::to_vec(&expires_at)?;
        // Check and insert in one write transaction so concurrent ACS posts
        // of the same assertion cannot both succeed.
        let write_txn = self.db.begin_write()?;
        let fresh = {
            let mut table = write_txn.open_table(ASSERTIONS_TABLE)?;
            let seen = table.get(assertion_id)?.is_some();
            if !seen {
                table.insert(assertion_id, data.as_slice())?;
            }
            !seen
        };
        write_txn.commit()?;

        if !fresh {
            warn!(assertion_id, "Assertion ID already consumed");
        }
        Ok(fresh)
    }

    fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();

        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let expired_sessions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<StoredSession>(value.value()) {
                    Ok(session) if session.is_expired() => {
                        ids.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize session, marking for deletion");
                        ids.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            ids
        };
        let evicted = self.remove_keys(SESSIONS_TABLE, &expired_sessions)?;

        let expired_assertions: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(ASSERTIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<DateTime<Utc>>(value.value()) {
                    Ok(expires_at) if now > expires_at => ids.push(key.value().to_string()),
                    Err(_) => ids.push(key.value().to_string()),
                    _ => {}
                }
            }
            ids
        };
        let forgotten = self.remove_keys(ASSERTIONS_TABLE, &expired_assertions)?;
        debug!(sessions = evicted, assertions = forgotten, "Evicted expired records");

        Ok(evicted)
    }

    fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }
}
