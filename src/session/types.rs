//! Session record and its lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::claims::AuthorizationResult;
use crate::saml::Assertion;
use crate::settings::FingerprintError;

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for storage/cookies.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Everything known about an authenticated user. Present as a whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub session_index: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub login_time: DateTime<Utc>,
    /// SHA-256 fingerprint of the certificate that verified the login, only
    /// recorded in debug mode.
    pub certificate_fingerprint: Option<String>,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
}

impl LoginState {
    /// Login time as shown to the user.
    pub fn login_time_iso(&self) -> String {
        self.login_time.to_rfc3339()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub login: Option<LoginState>,
    pub debug: bool,
    /// ID of the AuthnRequest awaiting a response.
    pub pending_authn_request: Option<String>,
    /// ID of the LogoutRequest awaiting a response.
    pub pending_logout_request: Option<String>,
}

impl SessionState {
    /// Fresh record with the deployment's default debug setting.
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            ..Default::default()
        }
    }

    /// Build the authenticated record in one step.
    ///
    /// `fingerprint` is only consulted in debug mode; a failure there never
    /// blocks the login.
    pub fn on_login_success(
        assertion: &Assertion,
        authz: AuthorizationResult,
        debug: bool,
        fingerprint: impl FnOnce() -> Result<String, FingerprintError>,
    ) -> Self {
        let certificate_fingerprint = if debug {
            match fingerprint() {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(error = %e, "Could not compute signing certificate fingerprint");
                    None
                }
            }
        } else {
            None
        };

        debug!(
            user_id = %assertion.name_id,
            roles = ?authz.roles,
            "Session established"
        );

        Self {
            login: Some(LoginState {
                name_id: assertion.name_id.clone(),
                name_id_format: assertion.name_id_format.clone(),
                session_index: assertion.session_index.clone(),
                attributes: assertion.attributes.clone(),
                login_time: Utc::now(),
                certificate_fingerprint,
                groups: authz.groups,
                roles: authz.roles,
            }),
            debug,
            pending_authn_request: None,
            pending_logout_request: None,
        }
    }

    /// Reset to the empty record. Idempotent.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Flip the debug flag and nothing else.
    pub fn toggle_debug(&mut self) -> bool {
        self.debug = !self.debug;
        self.debug
    }

    pub fn is_authenticated(&self) -> bool {
        self.login.is_some()
    }
}

/// `now + ttl_secs`, saturating at the latest representable instant.
pub fn expires_after(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Session as persisted by a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub state: SessionState,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(state: SessionState, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            state,
            expires_at: expires_after(now, ttl_secs),
            last_accessed: now,
        }
    }

    /// Check if the session is expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}
