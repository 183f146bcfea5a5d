//! Error taxonomy for the SAML service provider.
//!
//! Every failure is terminal for the current request. Variants map to the
//! status the presentation layer should answer with; the detailed text is for
//! logs only and never reaches the browser.

use thiserror::Error;

/// Configuration could not be resolved. Fatal for the process or request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read settings schema {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("malformed settings schema: {0}")]
    Malformed(String),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no IdP signing certificate configured")]
    NoCertificate,
}

/// A single failed check while validating an IdP message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("message could not be decoded: {0}")]
    Decode(String),

    #[error("message is not well-formed: {0}")]
    Malformed(String),

    #[error("unsupported SAML version: {0}")]
    Version(String),

    #[error("signature check failed: {0}")]
    Signature(String),

    #[error("no trusted signature covers the assertion")]
    UnsignedAssertion,

    #[error("encrypted assertions are not supported")]
    EncryptedAssertion,

    #[error("destination mismatch: expected {expected}, got {actual}")]
    Destination { expected: String, actual: String },

    #[error("issuer mismatch: expected {expected}, got {actual}")]
    Issuer { expected: String, actual: String },

    #[error("audience restriction does not include {expected}")]
    Audience { expected: String },

    #[error("InResponseTo {actual} does not match the outstanding request")]
    InResponseTo { actual: String },

    #[error("unsolicited response rejected")]
    Unsolicited,

    #[error("assertion not yet valid")]
    NotYetValid,

    #[error("assertion has expired")]
    Expired,

    #[error("subject confirmation rejected: {0}")]
    SubjectConfirmation(String),

    #[error("assertion missing NameID")]
    MissingNameId,

    #[error("assertion replay detected: {0}")]
    Replay(String),
}

/// All checks that failed for one message, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    failures: Vec<ValidationFailure>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(failure: ValidationFailure) -> Self {
        Self {
            failures: vec![failure],
        }
    }

    pub fn push(&mut self, failure: ValidationFailure) {
        self.failures.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[ValidationFailure] {
        &self.failures
    }

    /// Human-readable reason for the most recent failure.
    pub fn last_reason(&self) -> Option<String> {
        self.failures.last().map(|f| f.to_string())
    }

    /// `Ok(())` when nothing failed, otherwise the accumulated set.
    pub fn into_result(self) -> Result<(), SamlError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(SamlError::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<String> = self.failures.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", joined.join("; "))
    }
}

/// Business policy refused an otherwise valid login.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("required attributes missing: {}", claims.join(", "))]
    MissingRequiredClaim { claims: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamlError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("SAML validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("IdP did not authenticate the user ({status}): {message}")]
    Authentication { status: String, message: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("failed to encode SAML message: {0}")]
    Encoding(String),
}

impl From<ValidationErrors> for SamlError {
    fn from(errors: ValidationErrors) -> Self {
        SamlError::Validation(errors)
    }
}

impl From<ValidationFailure> for SamlError {
    fn from(failure: ValidationFailure) -> Self {
        SamlError::Validation(ValidationErrors::single(failure))
    }
}

impl SamlError {
    /// HTTP status the presentation layer should use.
    pub fn status_code(&self) -> u16 {
        match self {
            SamlError::Config(_) | SamlError::Encoding(_) => 500,
            SamlError::Validation(_) => 400,
            SamlError::Authentication { .. } | SamlError::Policy(_) => 403,
        }
    }

    /// Message safe to show the end user.
    pub fn public_message(&self) -> &'static str {
        match self {
            SamlError::Config(_) | SamlError::Encoding(_) => "Internal error",
            SamlError::Validation(_) => "SAML authentication failed",
            SamlError::Authentication { .. } => "Not authenticated",
            SamlError::Policy(_) => "Required attributes missing",
        }
    }

    /// Validation failures, when this is a validation error.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            SamlError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}
