//! Session cookie construction and parsing.

use super::types::SessionId;

/// `SameSite` attribute of the session cookie.
///
/// The IdP returns the user with a cross-site POST to the ACS, and browsers
/// only attach `None` cookies to it. Stricter values break SP-initiated login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SameSite {
    #[default]
    None,
    Lax,
    Strict,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::None => "None",
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
        }
    }
}

/// Cookie attributes for the session ID.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    /// Cookie domain (optional, defaults to request host).
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    pub max_age_secs: u64,
}

impl Default for SessionCookie {
    fn default() -> Self {
        Self {
            name: "saml_sp_session".to_string(),
            domain: None,
            path: "/".to_string(),
            secure: true,
            http_only: true,
            same_site: SameSite::None,
            max_age_secs: 8 * 60 * 60,
        }
    }
}

impl SessionCookie {
    /// `Set-Cookie` value carrying the session ID.
    pub fn build(&self, id: SessionId) -> String {
        self.render(&id.to_hex(), self.max_age_secs)
    }

    /// `Set-Cookie` value that removes the cookie from the browser.
    pub fn expire(&self) -> String {
        self.render("", 0)
    }

    fn render(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}", self.name, value);

        if let Some(ref domain) = self.domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }

        cookie.push_str(&format!("; Path={}", self.path));

        if self.secure {
            cookie.push_str("; Secure");
        }

        if self.http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie.push_str(&format!("; SameSite={}", self.same_site.as_str()));
        cookie.push_str(&format!("; Max-Age={}", max_age));

        cookie
    }

    /// Parse the session ID from a `Cookie` header. Malformed IDs are ignored.
    pub fn parse(&self, cookie_header: &str) -> Option<SessionId> {
        let prefix = format!("{}=", self.name);
        cookie_header
            .split(';')
            .filter_map(|part| part.trim().strip_prefix(&prefix))
            .find_map(SessionId::from_hex)
    }
}
