//! SAML 2.0 Service Provider
//!
//! SP-initiated single sign-on against an enterprise IdP, with group-claim
//! based role derivation and optional single logout. The HTTP layer hands in
//! a [`request::TransportRequest`] and gets back a [`service::Handled`]
//! outcome to render.

pub mod claims;
pub mod error;
pub mod request;
pub mod saml;
pub mod service;
pub mod session;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ConfigError, PolicyError, SamlError, ValidationErrors, ValidationFailure};
pub use service::{Handled, Outcome, Route, ServiceOptions, SessionAction, SloDisabledBehavior, SsoService};
pub use settings::{IdpTrustOverrides, Settings};
