//! SAML protocol engine.
//!
//! Provides SP-initiated SSO and single logout with assertion validation.

pub mod binding;
pub mod provider;
pub mod signature;
pub mod xml;

pub use provider::{Assertion, AuthnRedirect, LogoutRedirect, ResponseContext, SamlProvider};
