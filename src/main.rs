//! SAML Service Provider
//!
//! Serves the SSO endpoints over HTTP. Protocol handling lives in the
//! `saml_sp` library; this binary wires configuration, the session store and
//! the axum routes together.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use saml_sp::request::TransportRequest;
use saml_sp::service::View;
use saml_sp::session::{
    spawn_cleanup_task, MemorySessionStore, RedbSessionStore, SameSite, SessionCookie, SessionId,
    SessionState, SessionStore, DEFAULT_CLEANUP_INTERVAL_SECS,
};
use saml_sp::{
    Handled, IdpTrustOverrides, Outcome, Route, ServiceOptions, SessionAction, Settings,
    SloDisabledBehavior, SsoService,
};

/// Longest accepted session TTL (30 days).
const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "saml-sp")]
#[command(about = "SAML 2.0 Service Provider with group-based roles")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:5000", env = "SAML_LISTEN")]
    listen: SocketAddr,

    /// Static SP/IdP settings schema (JSON)
    #[arg(long, default_value = "config/settings.json", env = "SAML_SETTINGS_PATH")]
    settings: PathBuf,

    /// IdP entity ID
    #[arg(long, env = "SAML_IDP_ENTITY_ID")]
    idp_entity_id: Option<String>,

    /// IdP single sign-on URL
    #[arg(long, env = "SAML_IDP_SSO_URL")]
    idp_sso_url: Option<String>,

    /// IdP single logout URL (defaults to the SSO URL)
    #[arg(long, env = "SAML_IDP_SLO_URL")]
    idp_slo_url: Option<String>,

    /// IdP signing certificate (PEM or base64 DER)
    #[arg(long, env = "SAML_IDP_X509CERT")]
    idp_x509cert: Option<String>,

    /// IdP signing certificates during rotation (comma-separated)
    #[arg(long, env = "SAML_IDP_X509CERT_MULTI", value_delimiter = ',')]
    idp_x509cert_multi: Vec<String>,

    /// Externally visible base URL of this SP, substituted for {base_url}
    #[arg(long, env = "SAML_SP_BASE_URL")]
    sp_base_url: Option<String>,

    /// SP private key (PEM) for signing requests
    #[arg(long, env = "SAML_SP_PRIVATE_KEY")]
    sp_private_key: Option<String>,

    /// SP certificate (PEM) published in metadata
    #[arg(long, env = "SAML_SP_X509CERT")]
    sp_x509cert: Option<String>,

    /// Start new logins with the debug view enabled (also on when the
    /// settings schema sets "debug")
    #[arg(long, env = "SAML_DEBUG")]
    debug: bool,

    /// Enable SP-initiated single logout
    #[arg(long, env = "SAML_ENABLE_SLO")]
    enable_slo: bool,

    /// What /slo does when single logout is disabled
    #[arg(long, value_enum, default_value_t = SloDisabledBehavior::Redirect, env = "SAML_SLO_DISABLED_BEHAVIOR")]
    slo_disabled_behavior: SloDisabledBehavior,

    /// Honor X-Forwarded-Proto / X-Forwarded-Host
    #[arg(long, env = "SAML_TRUST_PROXY_HEADERS")]
    trust_proxy_headers: bool,

    /// Session store path (redb database file). In-memory when unset.
    #[arg(long, env = "SAML_SESSION_STORE_PATH")]
    session_store: Option<PathBuf>,

    /// Session TTL in seconds
    #[arg(
        long,
        default_value_t = 8 * 60 * 60,
        value_parser = clap::value_parser!(u64).range(60..=MAX_SESSION_TTL_SECS),
        env = "SAML_SESSION_TTL_SECS"
    )]
    session_ttl_secs: u64,

    /// Session cookie name
    #[arg(long, default_value = "saml_sp_session", env = "SAML_COOKIE_NAME")]
    cookie_name: String,

    /// Session cookie domain
    #[arg(long, env = "SAML_COOKIE_DOMAIN")]
    cookie_domain: Option<String>,

    /// Drop the Secure flag from the session cookie (plain-HTTP development)
    #[arg(long, env = "SAML_COOKIE_INSECURE")]
    cookie_insecure: bool,

    /// SameSite attribute of the session cookie
    #[arg(long, value_enum, default_value_t = SameSite::None, env = "SAML_COOKIE_SAME_SITE")]
    cookie_same_site: SameSite,

    /// Enable verbose logging
    #[arg(short, long, env = "SAML_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> IdpTrustOverrides {
        IdpTrustOverrides {
            entity_id: self.idp_entity_id.clone(),
            sso_url: self.idp_sso_url.clone(),
            slo_url: self.idp_slo_url.clone(),
            certificate: self.idp_x509cert.clone(),
            certificates: self
                .idp_x509cert_multi
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            sp_base_url: self.sp_base_url.clone(),
            sp_private_key: self.sp_private_key.clone(),
            sp_certificate: self.sp_x509cert.clone(),
        }
    }

    fn service_options(&self, settings: &Settings) -> ServiceOptions {
        ServiceOptions {
            debug_default: self.debug || settings.debug,
            slo_enabled: self.enable_slo,
            slo_disabled: self.slo_disabled_behavior,
            trust_proxy: self.trust_proxy_headers,
        }
    }

    fn session_cookie(&self) -> SessionCookie {
        SessionCookie {
            name: self.cookie_name.clone(),
            domain: self.cookie_domain.clone(),
            secure: !self.cookie_insecure,
            same_site: self.cookie_same_site,
            max_age_secs: self.session_ttl_secs,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<SsoService>,
    store: Arc<dyn SessionStore>,
    cookie: Arc<SessionCookie>,
    listen: SocketAddr,
}

impl AppState {
    fn new(args: &Args, settings: Settings, store: Arc<dyn SessionStore>) -> Self {
        let options = args.service_options(&settings);
        Self {
            service: Arc::new(SsoService::new(Arc::new(settings), options)),
            store,
            cookie: Arc::new(args.session_cookie()),
            listen: args.listen,
        }
    }
}

fn transport_request(
    listen: SocketAddr,
    uri: &Uri,
    headers: &HeaderMap,
    body: String,
) -> TransportRequest {
    let mut header_map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    TransportRequest {
        scheme: "http".to_string(),
        server_name: listen.ip().to_string(),
        server_port: listen.port(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: header_map,
        body: Some(body).filter(|b| !b.is_empty()),
    }
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
}

async fn dispatch(
    route: Route,
    State(app): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request = transport_request(app.listen, &uri, &headers, body);
    let store = app.store.as_ref();

    let session_id = request
        .header("cookie")
        .and_then(|cookie| app.cookie.parse(cookie));
    let mut state = match session_id.map(|id| store.load(id)).transpose() {
        Ok(loaded) => loaded.flatten().unwrap_or_default(),
        Err(e) => {
            error!(error = %e, "Failed to load session");
            return internal_error();
        }
    };

    let Handled { outcome, session } = app.service.handle(route, &request, &mut state, store);

    let set_cookie = match apply_session(&app, session_id, session, &state) {
        Ok(cookie) => cookie,
        Err(e) => {
            error!(error = %e, "Failed to persist session");
            return internal_error();
        }
    };

    let mut response = render(outcome);
    if let Some(cookie) = set_cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Persist the session change. Returns the `Set-Cookie` value to send, if any.
fn apply_session(
    app: &AppState,
    current: Option<SessionId>,
    action: SessionAction,
    state: &SessionState,
) -> Result<Option<String>> {
    let store = app.store.as_ref();
    match action {
        SessionAction::Keep => Ok(None),
        SessionAction::Save => match current {
            Some(id) => {
                store.save(id, state)?;
                Ok(None)
            }
            None => {
                let id = SessionId::new();
                store.save(id, state)?;
                Ok(Some(app.cookie.build(id)))
            }
        },
        SessionAction::Rotate => {
            if let Some(old) = current {
                store.clear(old)?;
            }
            let id = SessionId::new();
            store.save(id, state)?;
            Ok(Some(app.cookie.build(id)))
        }
        SessionAction::Clear => {
            if let Some(old) = current {
                store.clear(old)?;
            }
            Ok(Some(app.cookie.expire()))
        }
    }
}

fn render(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Redirect(location) => match HeaderValue::from_str(&location) {
            Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
            Err(_) => internal_error(),
        },
        Outcome::Render(View::Index(view)) => Json(view).into_response(),
        Outcome::Render(View::Claims(view)) => Json(view).into_response(),
        Outcome::Render(View::Metadata(xml)) => (
            [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
            xml,
        )
            .into_response(),
        Outcome::Fail { status, message } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message,
        )
            .into_response(),
    }
}

fn router(app: AppState) -> Router {
    Router::new()
        .route(
            "/",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::Index, s, u, h, String::new())),
        )
        .route(
            "/login",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::Login, s, u, h, String::new())),
        )
        .route(
            "/acs",
            post(|s: State<AppState>, u: Uri, h: HeaderMap, body: String| dispatch(Route::Acs, s, u, h, body)),
        )
        .route(
            "/claims",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::Claims, s, u, h, String::new())),
        )
        .route(
            "/logout",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::Logout, s, u, h, String::new())),
        )
        .route(
            "/slo",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::Slo, s, u, h, String::new())),
        )
        .route(
            "/slo/callback",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::SloCallback, s, u, h, String::new())),
        )
        .route(
            "/toggle-debug",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::ToggleDebug, s, u, h, String::new())),
        )
        .route(
            "/metadata",
            get(|s: State<AppState>, u: Uri, h: HeaderMap| dispatch(Route::Metadata, s, u, h, String::new())),
        )
        .with_state(app)
}

fn open_store(args: &Args) -> Result<Arc<dyn SessionStore>> {
    match &args.session_store {
        Some(path) => {
            let store = RedbSessionStore::open(path.clone(), args.session_ttl_secs)?;
            info!(path = ?path, "Session store initialized");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No session store path configured, sessions are kept in memory");
            Ok(Arc::new(MemorySessionStore::new(args.session_ttl_secs)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting SAML Service Provider");

    let settings = Settings::load(&args.settings, &args.overrides())
        .with_context(|| format!("Failed to resolve SAML settings from {:?}", args.settings))?;

    info!(
        sp_entity_id = %settings.sp.entity_id,
        idp_entity_id = %settings.idp.entity_id,
        trusted_certificates = settings.idp.certificates.len(),
        slo_enabled = args.enable_slo,
        "Configuration loaded"
    );

    if args.cookie_insecure && args.cookie_same_site == SameSite::None {
        warn!("Browsers drop SameSite=None cookies without Secure; the ACS will not see the session");
    }

    let store = open_store(&args)?;

    info!("Starting session cleanup task");
    let _cleanup_handle = spawn_cleanup_task(Arc::clone(&store), DEFAULT_CLEANUP_INTERVAL_SECS);

    let app = AppState::new(&args, settings, store);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "Server listening");

    axum::serve(listener, router(app))
        .await
        .context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use saml_sp::settings::{resolve, SettingsSchema};
    use std::path::Path;
    use tower::ServiceExt;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["saml-sp"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_rotation_set_is_split_and_trimmed() {
        let args = parse(&["--idp-x509cert-multi", "AAA, BBB,,"]);
        assert_eq!(args.overrides().certificates, vec!["AAA", "BBB"]);
    }

    /// Shipped schema resolved for https://sp.example.com.
    fn shipped_settings(debug: bool) -> Settings {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/settings.json");
        let mut schema = SettingsSchema::from_json(&std::fs::read_to_string(path).unwrap()).unwrap();
        schema.debug = debug;

        let idp = rcgen::generate_simple_self_signed(vec!["idp.example.com".to_string()]).unwrap();
        let overrides = IdpTrustOverrides {
            entity_id: Some("https://sts.windows.net/tenant/".to_string()),
            sso_url: Some("https://login.example.com/saml2".to_string()),
            certificate: Some(idp.cert.pem()),
            sp_base_url: Some("https://sp.example.com/".to_string()),
            ..Default::default()
        };
        resolve(schema, &overrides).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        let options = args.service_options(&shipped_settings(false));
        assert!(!options.debug_default);
        assert!(!options.slo_enabled);
        assert_eq!(options.slo_disabled, SloDisabledBehavior::Redirect);

        let cookie = args.session_cookie();
        assert!(cookie.secure);
        assert_eq!(cookie.same_site, SameSite::None);
        assert_eq!(cookie.max_age_secs, 8 * 60 * 60);
    }

    #[test]
    fn test_schema_debug_is_the_fallback_default() {
        let args = parse(&[]);
        assert!(args.service_options(&shipped_settings(true)).debug_default);

        let args = parse(&["--debug"]);
        assert!(args.service_options(&shipped_settings(false)).debug_default);
    }

    #[test]
    fn test_cookie_flags() {
        let args = parse(&["--cookie-same-site", "lax", "--cookie-insecure"]);
        let cookie = args.session_cookie();
        assert_eq!(cookie.same_site, SameSite::Lax);
        assert!(!cookie.secure);
    }

    #[test]
    fn test_session_ttl_is_bounded() {
        assert!(Args::try_parse_from(["saml-sp", "--session-ttl-secs", "18446744073709551615"]).is_err());
        assert!(Args::try_parse_from(["saml-sp", "--session-ttl-secs", "0"]).is_err());
        assert_eq!(parse(&["--session-ttl-secs", "3600"]).session_ttl_secs, 3600);
    }

    #[tokio::test]
    async fn test_login_cookie_is_sent_on_cross_site_acs_post() {
        let args = parse(&[]);
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(args.session_ttl_secs));
        let app = AppState::new(&args, shipped_settings(false), Arc::clone(&store));

        let response = router(app)
            .oneshot(
                Request::builder()
                    .uri("/login")
                    .header(header::HOST, "sp.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(set_cookie.contains("; SameSite=None"));
        assert!(set_cookie.contains("; Secure"));

        // The outstanding request ID lives under the cookie the ACS post will carry.
        let id = args.session_cookie().parse(set_cookie).unwrap();
        let state = store.load(id).unwrap().unwrap();
        assert!(state.pending_authn_request.is_some());
    }

    #[test]
    fn test_slo_disabled_behavior_flag() {
        let args = parse(&["--slo-disabled-behavior", "forbidden", "--enable-slo"]);
        assert_eq!(args.slo_disabled_behavior, SloDisabledBehavior::Forbidden);
        assert!(args.service_options(&shipped_settings(false)).slo_enabled);
    }

    #[test]
    fn test_transport_request_from_http_parts() {
        let listen: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("sp.example.com"));
        let uri: Uri = "/slo/callback?SAMLResponse=abc".parse().unwrap();

        let request = transport_request(listen, &uri, &headers, String::new());
        assert_eq!(request.path, "/slo/callback");
        assert_eq!(request.query.as_deref(), Some("SAMLResponse=abc"));
        assert_eq!(request.header("Host"), Some("sp.example.com"));
        assert_eq!(request.server_port, 5000);
        assert!(request.body.is_none());
    }
}
