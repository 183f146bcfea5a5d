//! Static settings document.
//!
//! The layout follows the `settings.json` convention used by python3-saml
//! deployments, extended with `claims` and `roles` sections. IdP trust
//! material is normally left empty here and supplied at runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
pub const NAMEID_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

pub const CLAIM_GIVEN_NAME: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname";
pub const CLAIM_SURNAME: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/surname";
pub const CLAIM_GROUPS: &str = "http://schemas.microsoft.com/ws/2008/06/identity/claims/groups";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsSchema {
    /// Reject unsigned or malformed messages. Non-strict mode is not supported.
    #[serde(default = "default_true")]
    pub strict: bool,

    #[serde(default)]
    pub debug: bool,

    pub sp: SpSchema,

    #[serde(default)]
    pub idp: IdpSchema,

    #[serde(default)]
    pub security: SecuritySchema,

    #[serde(default)]
    pub claims: ClaimsSchema,

    /// Group identifier -> role name.
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub binding: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpSchema {
    /// May contain `{base_url}`.
    #[serde(rename = "entityId")]
    pub entity_id: String,

    #[serde(rename = "assertionConsumerService")]
    pub assertion_consumer_service: Endpoint,

    #[serde(rename = "singleLogoutService", default)]
    pub single_logout_service: Option<Endpoint>,

    #[serde(rename = "NameIDFormat", default = "default_name_id_format")]
    pub name_id_format: String,

    #[serde(default)]
    pub x509cert: String,

    #[serde(rename = "privateKey", default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpSchema {
    #[serde(rename = "entityId", default)]
    pub entity_id: String,

    #[serde(rename = "singleSignOnService", default)]
    pub single_sign_on_service: Endpoint,

    #[serde(rename = "singleLogoutService", default)]
    pub single_logout_service: Option<Endpoint>,

    #[serde(default)]
    pub x509cert: String,

    #[serde(rename = "x509certMulti", default)]
    pub x509cert_multi: Option<CertificateSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateSet {
    #[serde(default)]
    pub signing: Vec<String>,

    #[serde(default)]
    pub encryption: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SecuritySchema {
    #[serde(default)]
    pub authn_requests_signed: bool,

    #[serde(default)]
    pub logout_request_signed: bool,

    #[serde(default = "default_true")]
    pub want_assertions_signed: bool,

    #[serde(default)]
    pub want_messages_signed: bool,

    #[serde(default = "default_true")]
    pub want_name_id: bool,

    #[serde(default)]
    pub want_assertions_encrypted: bool,

    /// Must match the SP key type when set.
    #[serde(default)]
    pub signature_algorithm: Option<String>,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_seconds: i64,

    #[serde(default)]
    pub allow_unsolicited: bool,

    #[serde(default = "default_true")]
    pub force_authn: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClaimsSchema {
    #[serde(default = "default_given_name_claim")]
    pub given_name: String,

    #[serde(default = "default_surname_claim")]
    pub surname: String,

    #[serde(default = "default_groups_claim")]
    pub groups: String,
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> i64 {
    300 // 5 minutes
}

fn default_name_id_format() -> String {
    NAMEID_UNSPECIFIED.to_string()
}

fn default_given_name_claim() -> String {
    CLAIM_GIVEN_NAME.to_string()
}

fn default_surname_claim() -> String {
    CLAIM_SURNAME.to_string()
}

fn default_groups_claim() -> String {
    CLAIM_GROUPS.to_string()
}

impl Default for SecuritySchema {
    fn default() -> Self {
        Self {
            authn_requests_signed: false,
            logout_request_signed: false,
            want_assertions_signed: true,
            want_messages_signed: false,
            want_name_id: true,
            want_assertions_encrypted: false,
            signature_algorithm: None,
            clock_skew_seconds: default_clock_skew(),
            allow_unsolicited: false,
            force_authn: true,
        }
    }
}

impl Default for ClaimsSchema {
    fn default() -> Self {
        Self {
            given_name: default_given_name_claim(),
            surname: default_surname_claim(),
            groups: default_groups_claim(),
        }
    }
}

impl SettingsSchema {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
