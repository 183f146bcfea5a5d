//! Session lifecycle for SAML logins.
//!
//! The typed session record, its persistence behind [`SessionStore`] (redb
//! or in-memory), the session cookie, and background cleanup.

pub mod cleanup;
pub mod cookie;
pub mod memory;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use cookie::{SameSite, SessionCookie};
pub use memory::MemorySessionStore;
pub use store::{RedbSessionStore, SessionStore};
pub use types::{expires_after, LoginState, SessionId, SessionState, StoredSession};
