//! Route handling for the SSO endpoints.
//!
//! Each route takes the transport request and the caller's session record and
//! returns an [`Outcome`] plus the [`SessionAction`] the HTTP layer must apply.
//! Rendering and cookie handling stay with the caller.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::claims::map_claims;
use crate::error::{SamlError, ValidationFailure};
use crate::request::{normalize, RequestDescriptor, TransportRequest};
use crate::saml::{ResponseContext, SamlProvider};
use crate::session::{expires_after, SessionState, SessionStore};
use crate::settings::Settings;

const SLO_DISABLED_MESSAGE: &str = "Single Logout (SLO) is disabled by configuration.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    Login,
    Acs,
    Claims,
    Logout,
    Slo,
    SloCallback,
    ToggleDebug,
    Metadata,
}

/// What `/slo` does when single logout is switched off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SloDisabledBehavior {
    /// Clear the local session and go home.
    #[default]
    Redirect,
    /// Clear the local session and answer 403.
    Forbidden,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Debug flag given to new logins.
    pub debug_default: bool,
    pub slo_enabled: bool,
    pub slo_disabled: SloDisabledBehavior,
    /// Honor X-Forwarded-* headers.
    pub trust_proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexView {
    pub authenticated: bool,
    pub name_id: Option<String>,
    pub login_time: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimsView {
    pub name_id: String,
    pub session_index: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
    pub login_time: String,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Index(IndexView),
    Claims(ClaimsView),
    /// SP metadata XML.
    Metadata(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Redirect(String),
    Render(View),
    Fail { status: u16, message: String },
}

/// How the caller must persist the session record after a route ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Nothing changed.
    Keep,
    /// Store the record under the current session ID.
    Save,
    /// Store the record under a fresh session ID and drop the old one.
    Rotate,
    /// Delete the stored record and expire the cookie.
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub outcome: Outcome,
    pub session: SessionAction,
}

impl Handled {
    fn new(outcome: Outcome, session: SessionAction) -> Self {
        Self { outcome, session }
    }

    fn redirect(to: impl Into<String>, session: SessionAction) -> Self {
        Self::new(Outcome::Redirect(to.into()), session)
    }

    fn fail(error: &SamlError) -> Self {
        Self::new(
            Outcome::Fail {
                status: error.status_code(),
                message: error.public_message().to_string(),
            },
            SessionAction::Keep,
        )
    }
}

pub struct SsoService {
    provider: SamlProvider,
    options: ServiceOptions,
}

impl SsoService {
    pub fn new(settings: Arc<Settings>, options: ServiceOptions) -> Self {
        Self {
            provider: SamlProvider::new(settings),
            options,
        }
    }

    pub fn handle(
        &self,
        route: Route,
        request: &TransportRequest,
        state: &mut SessionState,
        store: &dyn SessionStore,
    ) -> Handled {
        let descriptor = normalize(request, self.options.trust_proxy);
        match route {
            Route::Index => self.index(state),
            Route::Login => self.login(state),
            Route::Acs => self.acs(&descriptor, state, store),
            Route::Claims => self.claims(state),
            Route::Logout => {
                state.clear();
                info!("Local logout");
                Handled::redirect("/", SessionAction::Clear)
            }
            Route::Slo => self.slo(state),
            Route::SloCallback => self.slo_callback(&descriptor, state),
            Route::ToggleDebug => {
                let debug_enabled = state.toggle_debug();
                debug!(debug = debug_enabled, "Toggled debug view");
                let back = safe_return_target(request.header("referer"), &descriptor);
                Handled::redirect(back, SessionAction::Save)
            }
            Route::Metadata => Handled::new(
                Outcome::Render(View::Metadata(self.provider.sp_metadata())),
                SessionAction::Keep,
            ),
        }
    }

    fn index(&self, state: &SessionState) -> Handled {
        let view = IndexView {
            authenticated: state.is_authenticated(),
            name_id: state.login.as_ref().map(|l| l.name_id.clone()),
            login_time: state.login.as_ref().map(|l| l.login_time_iso()),
            debug: state.debug,
        };
        Handled::new(Outcome::Render(View::Index(view)), SessionAction::Keep)
    }

    fn login(&self, state: &mut SessionState) -> Handled {
        let force_authn = self.provider.settings().security.force_authn;
        match self.provider.build_authn_request(force_authn) {
            Ok(redirect) => {
                state.pending_authn_request = Some(redirect.request_id);
                Handled::redirect(redirect.url, SessionAction::Save)
            }
            Err(e) => {
                warn!(error = %e, "Failed to build AuthnRequest");
                Handled::fail(&e)
            }
        }
    }

    fn acs(
        &self,
        descriptor: &RequestDescriptor,
        state: &mut SessionState,
        store: &dyn SessionStore,
    ) -> Handled {
        let settings = self.provider.settings();
        let context = ResponseContext::new(state.pending_authn_request.as_deref());

        let assertion = match self.provider.process_response(descriptor, &context) {
            Ok(assertion) => assertion,
            Err(e) => {
                match e.validation_errors() {
                    Some(errors) => warn!(
                        errors = %errors,
                        last_reason = %errors.last_reason().unwrap_or_default(),
                        "SAML response rejected"
                    ),
                    None => warn!(error = %e, "SAML response rejected"),
                }
                return Handled::fail(&e);
            }
        };

        let replay_until = assertion
            .valid_until
            .unwrap_or_else(|| expires_after(Utc::now(), store.ttl_secs()));
        match store.record_assertion(&assertion.id, replay_until) {
            Ok(true) => {}
            Ok(false) => {
                let e = SamlError::from(ValidationFailure::Replay(assertion.id.clone()));
                warn!(error = %e, "SAML response rejected");
                return Handled::fail(&e);
            }
            Err(e) => {
                warn!(error = %e, "Replay ledger unavailable");
                return Handled::new(
                    Outcome::Fail {
                        status: 500,
                        message: "Internal error".to_string(),
                    },
                    SessionAction::Keep,
                );
            }
        }

        let authz = match map_claims(&assertion, &settings.claims, &settings.roles) {
            Ok(authz) => authz,
            Err(policy) => {
                warn!(user_id = %assertion.name_id, error = %policy, "Login refused by claim policy");
                return Handled::fail(&SamlError::from(policy));
            }
        };

        *state = SessionState::on_login_success(&assertion, authz, self.options.debug_default, || {
            settings.idp.certificate_fingerprint(assertion.signer)
        });

        info!(
            user_id = %assertion.name_id,
            session_index = assertion.session_index.as_deref().unwrap_or(""),
            "SAML login complete"
        );
        Handled::redirect("/claims", SessionAction::Rotate)
    }

    fn claims(&self, state: &mut SessionState) -> Handled {
        let Some(login) = state.login.as_ref() else {
            state.clear();
            return Handled::redirect("/", SessionAction::Clear);
        };

        let view = ClaimsView {
            name_id: login.name_id.clone(),
            session_index: login.session_index.clone(),
            attributes: login.attributes.clone(),
            groups: login.groups.clone(),
            roles: login.roles.clone(),
            login_time: login.login_time_iso(),
            debug: state.debug,
            certificate_fingerprint: login
                .certificate_fingerprint
                .clone()
                .filter(|_| state.debug),
        };
        Handled::new(Outcome::Render(View::Claims(view)), SessionAction::Keep)
    }

    fn slo(&self, state: &mut SessionState) -> Handled {
        // Everything below starts from a cleared session.
        let login = state.login.take();
        state.clear();

        if !self.options.slo_enabled {
            info!("SLO disabled, local session cleared");
            return match self.options.slo_disabled {
                SloDisabledBehavior::Redirect => Handled::redirect("/", SessionAction::Clear),
                SloDisabledBehavior::Forbidden => Handled::new(
                    Outcome::Fail {
                        status: 403,
                        message: SLO_DISABLED_MESSAGE.to_string(),
                    },
                    SessionAction::Clear,
                ),
            };
        }

        let Some((name_id, session_index, format)) = login.and_then(|l| {
            l.session_index
                .map(|index| (l.name_id, index, l.name_id_format))
        }) else {
            debug!("SLO without an established IdP session");
            return Handled::redirect("/", SessionAction::Clear);
        };

        match self
            .provider
            .build_logout_request(&name_id, &session_index, format.as_deref())
        {
            Ok(redirect) => {
                info!(user_id = %name_id, request_id = %redirect.request_id, "Starting single logout");
                state.pending_logout_request = Some(redirect.request_id);
                Handled::redirect(redirect.url, SessionAction::Rotate)
            }
            Err(e) => {
                warn!(error = %e, "Failed to build LogoutRequest");
                Handled::redirect("/", SessionAction::Clear)
            }
        }
    }

    fn slo_callback(&self, descriptor: &RequestDescriptor, state: &mut SessionState) -> Handled {
        let expected = state.pending_logout_request.take();
        state.clear();

        if descriptor.query_param("SAMLRequest").is_some() {
            warn!("Ignoring IdP-initiated LogoutRequest");
        } else {
            match self
                .provider
                .process_logout_response(descriptor, expected.as_deref())
            {
                Ok(()) => info!("Single logout complete"),
                Err(e) => warn!(error = %e, "LogoutResponse rejected, local session cleared"),
            }
        }
        Handled::redirect("/", SessionAction::Clear)
    }
}

/// Where `/toggle-debug` sends the browser back to: the Referer when it is a
/// local path or same-origin URL, otherwise `/`.
fn safe_return_target(referer: Option<&str>, descriptor: &RequestDescriptor) -> String {
    let Some(referer) = referer.map(str::trim).filter(|r| !r.is_empty()) else {
        return "/".to_string();
    };
    if referer.starts_with('/') && !referer.starts_with("//") && !referer.starts_with("/\\") {
        return referer.to_string();
    }
    match url::Url::parse(referer) {
        Ok(url) if url.origin().ascii_serialization() == descriptor.origin() => referer.to_string(),
        _ => "/".to_string(),
    }
}
