//! Settings resolution.
//!
//! A static [`SettingsSchema`] is overlaid with runtime IdP trust material
//! and validated into an immutable [`Settings`] value. Resolution happens
//! once at startup; the result is shared behind an `Arc` and never mutated.

mod certificate;
pub mod schema;

use chrono::Duration;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub use certificate::{KeyKind, SpSigningKey, TrustedCertificate};
pub use schema::SettingsSchema;

use crate::error::ConfigError;
use schema::{BINDING_HTTP_POST, BINDING_HTTP_REDIRECT};

const BASE_URL_PLACEHOLDER: &str = "{base_url}";

/// Runtime values that take precedence over the static schema.
#[derive(Debug, Clone, Default)]
pub struct IdpTrustOverrides {
    pub entity_id: Option<String>,
    pub sso_url: Option<String>,
    pub slo_url: Option<String>,
    /// Single signing certificate (PEM or base64 DER).
    pub certificate: Option<String>,
    /// Rotation set; when non-empty it wins over `certificate`.
    pub certificates: Vec<String>,
    /// Substituted for `{base_url}` in SP URLs.
    pub sp_base_url: Option<String>,
    pub sp_private_key: Option<String>,
    pub sp_certificate: Option<String>,
}

#[derive(Debug)]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub acs_url: String,
    pub sls_url: Option<String>,
    pub name_id_format: String,
    pub certificate: Option<TrustedCertificate>,
    pub signing_key: Option<SpSigningKey>,
}

#[derive(Debug, Clone)]
pub struct IdentityProviderTrust {
    pub entity_id: String,
    pub sso_url: String,
    slo_url: Option<String>,
    /// Signing certificates in rotation order.
    pub certificates: Vec<TrustedCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("assertion was not verified by a trusted certificate")]
    Unsigned,

    #[error("signer index {0} is outside the trust set")]
    UnknownSigner(usize),
}

impl IdentityProviderTrust {
    /// Single logout endpoint. Falls back to the SSO endpoint.
    pub fn slo_url(&self) -> &str {
        self.slo_url.as_deref().unwrap_or(&self.sso_url)
    }

    /// Fingerprint of the certificate that verified a message.
    pub fn certificate_fingerprint(&self, signer: Option<usize>) -> Result<String, FingerprintError> {
        let index = signer.ok_or(FingerprintError::Unsigned)?;
        self.certificates
            .get(index)
            .map(|cert| cert.fingerprint().to_string())
            .ok_or(FingerprintError::UnknownSigner(index))
    }
}

#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub authn_requests_signed: bool,
    pub logout_request_signed: bool,
    pub want_assertions_signed: bool,
    pub want_messages_signed: bool,
    pub want_name_id: bool,
    pub clock_skew: Duration,
    pub allow_unsolicited: bool,
    pub force_authn: bool,
}

/// Claim URIs consulted by the claims mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub given_name: String,
    pub surname: String,
    pub groups: String,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            given_name: schema::CLAIM_GIVEN_NAME.to_string(),
            surname: schema::CLAIM_SURNAME.to_string(),
            groups: schema::CLAIM_GROUPS.to_string(),
        }
    }
}

/// Static group identifier -> role table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleTable(BTreeMap<String, String>);

impl RoleTable {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    pub fn role_for(&self, group: &str) -> Option<&str> {
        self.0.get(group).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Largest accepted `security.clockSkewSeconds` (one hour).
pub const MAX_CLOCK_SKEW_SECS: i64 = 60 * 60;

/// Validated, immutable configuration.
#[derive(Debug)]
pub struct Settings {
    pub debug: bool,
    pub sp: ServiceProviderConfig,
    pub idp: IdentityProviderTrust,
    pub security: SecurityPolicy,
    pub claims: ClaimPolicy,
    pub roles: RoleTable,
}

impl Settings {
    /// Read the schema at `path` and resolve it against `overrides`.
    pub fn load(path: impl AsRef<Path>, overrides: &IdpTrustOverrides) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let schema =
            SettingsSchema::from_json(&json).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        debug!(path = %path.display(), "Loaded settings schema");
        resolve(schema, overrides)
    }
}

/// Merge the static schema with runtime trust material and validate.
pub fn resolve(schema: SettingsSchema, overrides: &IdpTrustOverrides) -> Result<Settings, ConfigError> {
    if !schema.strict {
        return Err(ConfigError::Invalid {
            field: "strict",
            reason: "non-strict mode is not supported".to_string(),
        });
    }

    let base_url = overrides
        .sp_base_url
        .as_deref()
        .map(|u| u.trim_end_matches('/'));

    let sp_entity_id = required("sp.entityId", expand(&schema.sp.entity_id, base_url, "sp.entityId")?)?;
    let acs = &schema.sp.assertion_consumer_service;
    check_binding("sp.assertionConsumerService.binding", acs.binding.as_deref(), BINDING_HTTP_POST)?;
    let acs_url = required(
        "sp.assertionConsumerService.url",
        expand(&acs.url, base_url, "sp.assertionConsumerService.url")?,
    )?;
    check_url("sp.assertionConsumerService.url", &acs_url)?;

    let sls_url = match &schema.sp.single_logout_service {
        Some(sls) if !sls.url.is_empty() => {
            check_binding("sp.singleLogoutService.binding", sls.binding.as_deref(), BINDING_HTTP_REDIRECT)?;
            let url = expand(&sls.url, base_url, "sp.singleLogoutService.url")?;
            check_url("sp.singleLogoutService.url", &url)?;
            Some(url)
        }
        _ => None,
    };

    let sp_certificate = first_non_empty(overrides.sp_certificate.as_deref(), &schema.sp.x509cert)
        .map(TrustedCertificate::parse)
        .transpose()
        .map_err(|e| relabel(e, "sp.x509cert"))?;
    let signing_key = first_non_empty(overrides.sp_private_key.as_deref(), &schema.sp.private_key)
        .map(SpSigningKey::from_pem)
        .transpose()?;

    let idp_entity_id = required(
        "idp.entityId",
        first_non_empty(overrides.entity_id.as_deref(), &schema.idp.entity_id)
            .unwrap_or_default()
            .to_string(),
    )?;

    check_binding(
        "idp.singleSignOnService.binding",
        schema.idp.single_sign_on_service.binding.as_deref(),
        BINDING_HTTP_REDIRECT,
    )?;
    let sso_url = required(
        "idp.singleSignOnService.url",
        first_non_empty(overrides.sso_url.as_deref(), &schema.idp.single_sign_on_service.url)
            .unwrap_or_default()
            .to_string(),
    )?;
    check_url("idp.singleSignOnService.url", &sso_url)?;

    let schema_slo = schema
        .idp
        .single_logout_service
        .as_ref()
        .map(|e| e.url.as_str())
        .unwrap_or("");
    let idp_slo_url = first_non_empty(overrides.slo_url.as_deref(), schema_slo).map(str::to_string);
    if let Some(ref url) = idp_slo_url {
        check_url("idp.singleLogoutService.url", url)?;
    }

    let certificates = resolve_certificates(&schema, overrides)?;

    let security = &schema.security;
    if security.want_assertions_encrypted {
        return Err(ConfigError::Invalid {
            field: "security.wantAssertionsEncrypted",
            reason: "encrypted assertions are not supported".to_string(),
        });
    }
    if !(0..=MAX_CLOCK_SKEW_SECS).contains(&security.clock_skew_seconds) {
        return Err(ConfigError::Invalid {
            field: "security.clockSkewSeconds",
            reason: format!("must be between 0 and {MAX_CLOCK_SKEW_SECS}"),
        });
    }
    if (security.authn_requests_signed || security.logout_request_signed) && signing_key.is_none() {
        return Err(ConfigError::Invalid {
            field: "security.authnRequestsSigned",
            reason: "request signing requires sp.privateKey".to_string(),
        });
    }
    if let (Some(requested), Some(key)) = (&security.signature_algorithm, &signing_key) {
        if requested != key.algorithm().uri() {
            return Err(ConfigError::Invalid {
                field: "security.signatureAlgorithm",
                reason: format!("{requested} does not match the SP key type"),
            });
        }
    }

    let settings = Settings {
        debug: schema.debug,
        sp: ServiceProviderConfig {
            entity_id: sp_entity_id,
            acs_url,
            sls_url,
            name_id_format: schema.sp.name_id_format.clone(),
            certificate: sp_certificate,
            signing_key,
        },
        idp: IdentityProviderTrust {
            entity_id: idp_entity_id,
            sso_url,
            slo_url: idp_slo_url,
            certificates,
        },
        security: SecurityPolicy {
            authn_requests_signed: security.authn_requests_signed,
            logout_request_signed: security.logout_request_signed,
            want_assertions_signed: security.want_assertions_signed,
            want_messages_signed: security.want_messages_signed,
            want_name_id: security.want_name_id,
            clock_skew: Duration::seconds(security.clock_skew_seconds),
            allow_unsolicited: security.allow_unsolicited,
            force_authn: security.force_authn,
        },
        claims: ClaimPolicy {
            given_name: schema.claims.given_name.clone(),
            surname: schema.claims.surname.clone(),
            groups: schema.claims.groups.clone(),
        },
        roles: RoleTable::new(schema.roles.clone()),
    };

    info!(
        sp = %settings.sp.entity_id,
        idp = %settings.idp.entity_id,
        certificates = settings.idp.certificates.len(),
        roles = settings.roles.len(),
        "Settings resolved"
    );
    for (index, cert) in settings.idp.certificates.iter().enumerate() {
        debug!(index, subject = %cert.subject(), fingerprint = %cert.fingerprint(), "Trusted IdP certificate");
    }

    Ok(settings)
}

/// Rotation set first, then the single certificate, overrides before schema.
fn resolve_certificates(
    schema: &SettingsSchema,
    overrides: &IdpTrustOverrides,
) -> Result<Vec<TrustedCertificate>, ConfigError> {
    let non_empty = |set: &[String]| -> Vec<String> {
        set.iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };

    let schema_multi = schema
        .idp
        .x509cert_multi
        .as_ref()
        .map(|m| non_empty(&m.signing))
        .unwrap_or_default();

    let material: Vec<String> = if !non_empty(&overrides.certificates).is_empty() {
        non_empty(&overrides.certificates)
    } else if let Some(single) = first_non_empty(overrides.certificate.as_deref(), "") {
        vec![single.to_string()]
    } else if !schema_multi.is_empty() {
        schema_multi
    } else if let Some(single) = first_non_empty(None, &schema.idp.x509cert) {
        vec![single.to_string()]
    } else {
        return Err(ConfigError::NoCertificate);
    };

    material.iter().map(|m| TrustedCertificate::parse(m)).collect()
}

fn first_non_empty<'a>(primary: Option<&'a str>, fallback: &'a str) -> Option<&'a str> {
    primary
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| Some(fallback.trim()).filter(|s| !s.is_empty()))
}

fn required(field: &'static str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(field))
    } else {
        Ok(value)
    }
}

fn expand(template: &str, base_url: Option<&str>, field: &'static str) -> Result<String, ConfigError> {
    if !template.contains(BASE_URL_PLACEHOLDER) {
        return Ok(template.to_string());
    }
    let base = base_url.ok_or_else(|| ConfigError::Invalid {
        field,
        reason: "uses {base_url} but no SP base URL was supplied".to_string(),
    })?;
    Ok(template.replace(BASE_URL_PLACEHOLDER, base))
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{value}: {e}"),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

fn check_binding(field: &'static str, binding: Option<&str>, supported: &str) -> Result<(), ConfigError> {
    match binding {
        None => Ok(()),
        Some(b) if b == supported => Ok(()),
        Some(b) => Err(ConfigError::Invalid {
            field,
            reason: format!("unsupported binding {b}"),
        }),
    }
}

fn relabel(err: ConfigError, field: &'static str) -> ConfigError {
    match err {
        ConfigError::Invalid { reason, .. } => ConfigError::Invalid { field, reason },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::IdpKey;

    fn schema() -> SettingsSchema {
        SettingsSchema::from_json(
            r#"{
                "sp": {
                    "entityId": "{base_url}/metadata",
                    "assertionConsumerService": {"url": "{base_url}/acs"},
                    "singleLogoutService": {"url": "{base_url}/slo/callback"}
                },
                "roles": {"g1": "admin", "g2": "reader"}
            }"#,
        )
        .unwrap()
    }

    fn overrides(cert: &str) -> IdpTrustOverrides {
        IdpTrustOverrides {
            entity_id: Some("https://sts.windows.net/tenant/".to_string()),
            sso_url: Some("https://login.example.com/saml2".to_string()),
            certificate: Some(cert.to_string()),
            sp_base_url: Some("https://sp.example.com/".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_overlays_runtime_values() {
        let idp = IdpKey::generate("idp.example.com");
        let settings = resolve(schema(), &overrides(&idp.cert_pem)).unwrap();

        assert_eq!(settings.sp.entity_id, "https://sp.example.com/metadata");
        assert_eq!(settings.sp.acs_url, "https://sp.example.com/acs");
        assert_eq!(
            settings.sp.sls_url.as_deref(),
            Some("https://sp.example.com/slo/callback")
        );
        assert_eq!(settings.idp.entity_id, "https://sts.windows.net/tenant/");
        assert_eq!(settings.idp.certificates.len(), 1);
        // No explicit SLO endpoint: falls back to SSO.
        assert_eq!(settings.idp.slo_url(), "https://login.example.com/saml2");
        assert_eq!(settings.roles.role_for("g1"), Some("admin"));
        assert_eq!(settings.security.clock_skew, Duration::seconds(300));
    }

    #[test]
    fn test_rotation_set_wins_over_single() {
        let a = IdpKey::generate("a.idp.example.com");
        let b = IdpKey::generate("b.idp.example.com");
        let c = IdpKey::generate("c.idp.example.com");

        let mut o = overrides(&c.cert_pem);
        o.certificates = vec![a.cert_pem.clone(), b.cert_pem.clone()];
        let settings = resolve(schema(), &o).unwrap();

        let fingerprints: Vec<&str> = settings.idp.certificates.iter().map(|c| c.fingerprint()).collect();
        assert_eq!(
            fingerprints,
            vec![a.trusted().fingerprint(), b.trusted().fingerprint()]
        );
    }

    #[test]
    fn test_missing_certificate_fails_closed() {
        let mut o = overrides("");
        o.certificate = None;
        assert_eq!(resolve(schema(), &o).unwrap_err(), ConfigError::NoCertificate);

        o.certificates = vec!["   ".to_string()];
        assert_eq!(resolve(schema(), &o).unwrap_err(), ConfigError::NoCertificate);
    }

    #[test]
    fn test_missing_required_values() {
        let idp = IdpKey::generate("idp.example.com");

        let mut o = overrides(&idp.cert_pem);
        o.entity_id = None;
        assert_eq!(resolve(schema(), &o).unwrap_err(), ConfigError::Missing("idp.entityId"));

        let mut o = overrides(&idp.cert_pem);
        o.sso_url = None;
        assert_eq!(
            resolve(schema(), &o).unwrap_err(),
            ConfigError::Missing("idp.singleSignOnService.url")
        );

        let mut o = overrides(&idp.cert_pem);
        o.sp_base_url = None;
        assert!(matches!(
            resolve(schema(), &o).unwrap_err(),
            ConfigError::Invalid { field: "sp.entityId", .. }
        ));
    }

    #[test]
    fn test_rejects_bad_urls_and_signing_without_key() {
        let idp = IdpKey::generate("idp.example.com");

        let mut o = overrides(&idp.cert_pem);
        o.sso_url = Some("ftp://idp.example.com/sso".to_string());
        assert!(matches!(
            resolve(schema(), &o).unwrap_err(),
            ConfigError::Invalid { field: "idp.singleSignOnService.url", .. }
        ));

        let mut s = schema();
        s.security.authn_requests_signed = true;
        assert!(matches!(
            resolve(s, &overrides(&idp.cert_pem)).unwrap_err(),
            ConfigError::Invalid { field: "security.authnRequestsSigned", .. }
        ));
    }

    #[test]
    fn test_clock_skew_bounds() {
        let idp = IdpKey::generate("idp.example.com");
        for skew in [-1, MAX_CLOCK_SKEW_SECS + 1, i64::MAX / 2] {
            let mut s = schema();
            s.security.clock_skew_seconds = skew;
            assert!(matches!(
                resolve(s, &overrides(&idp.cert_pem)).unwrap_err(),
                ConfigError::Invalid { field: "security.clockSkewSeconds", .. }
            ));
        }

        let mut s = schema();
        s.security.clock_skew_seconds = MAX_CLOCK_SKEW_SECS;
        let settings = resolve(s, &overrides(&idp.cert_pem)).unwrap();
        assert_eq!(settings.security.clock_skew, Duration::hours(1));
    }

    #[test]
    fn test_signing_key_from_overrides() {
        let idp = IdpKey::generate("idp.example.com");
        let sp = IdpKey::generate("sp.example.com");

        let mut s = schema();
        s.security.authn_requests_signed = true;
        let mut o = overrides(&idp.cert_pem);
        o.sp_private_key = Some(sp.key_pem.clone());
        o.sp_certificate = Some(sp.cert_pem.clone());

        let settings = resolve(s, &o).unwrap();
        assert!(settings.sp.signing_key.is_some());
        assert!(settings.sp.certificate.is_some());
    }

    #[test]
    fn test_load_reports_unreadable_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            Settings::load(&missing, &IdpTrustOverrides::default()).unwrap_err(),
            ConfigError::Unreadable { .. }
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            Settings::load(&bad, &IdpTrustOverrides::default()).unwrap_err(),
            ConfigError::Malformed(_)
        ));
    }

    #[test]
    fn test_fingerprint_lookup() {
        let idp = IdpKey::generate("idp.example.com");
        let settings = resolve(schema(), &overrides(&idp.cert_pem)).unwrap();

        assert_eq!(
            settings.idp.certificate_fingerprint(Some(0)).unwrap(),
            idp.trusted().fingerprint()
        );
        assert_eq!(
            settings.idp.certificate_fingerprint(None).unwrap_err(),
            FingerprintError::Unsigned
        );
        assert_eq!(
            settings.idp.certificate_fingerprint(Some(4)).unwrap_err(),
            FingerprintError::UnknownSigner(4)
        );
    }

    #[test]
    fn test_shipped_settings_resolve() {
        let idp = IdpKey::generate("idp.example.com");
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/settings.json");
        let settings = Settings::load(path, &overrides(&idp.cert_pem)).unwrap();

        assert_eq!(settings.sp.acs_url, "https://sp.example.com/acs");
        assert_eq!(settings.sp.sls_url.as_deref(), Some("https://sp.example.com/slo/callback"));
        assert_eq!(settings.security.clock_skew, Duration::seconds(300));
        assert_eq!(settings.roles.len(), 2);
    }
}
