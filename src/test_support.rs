//! Test fixtures: throwaway IdP keys and a minimal IdP that issues signed
//! responses in the shape Microsoft Entra ID produces.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use std::sync::Arc;
use uuid::Uuid;

use crate::request::RequestDescriptor;
use crate::saml::binding::deflate_and_encode;
use crate::saml::signature::{DIGEST_SHA256, DSIG_NS, ECDSA_SHA256, ENVELOPED_SIGNATURE, EXC_C14N};
use crate::saml::xml::{self, Canonicalizer, Element, NsScope};
use crate::settings::{resolve, IdpTrustOverrides, Settings, SettingsSchema, TrustedCertificate};

pub const SP_BASE: &str = "https://sp.example.com";
pub const IDP_ENTITY_ID: &str = "https://sts.windows.net/00000000-tenant/";
pub const IDP_SSO_URL: &str = "https://login.example.com/tenant/saml2";

pub const GIVEN_NAME: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname";
pub const SURNAME: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/surname";
pub const GROUPS: &str = "http://schemas.microsoft.com/ws/2008/06/identity/claims/groups";

/// A self-signed ECDSA P-256 certificate and its key.
pub struct IdpKey {
    pub cert_pem: String,
    pub key_pem: String,
    pkcs8: Vec<u8>,
}

impl IdpKey {
    pub fn generate(common_name: &str) -> Self {
        let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            pkcs8: key_pair.serialize_der(),
        }
    }

    pub fn trusted(&self) -> TrustedCertificate {
        TrustedCertificate::parse(&self.cert_pem).unwrap()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &self.pkcs8, &rng).unwrap();
        key.sign(&rng, message).unwrap().as_ref().to_vec()
    }
}

fn find_by_id<'a>(
    element: &'a Element,
    parent_scope: &NsScope,
    id: &str,
) -> Option<(&'a Element, NsScope)> {
    if element.attr("ID") == Some(id) {
        return Some((element, parent_scope.clone()));
    }
    let scope = element.scope(parent_scope);
    element
        .child_elements()
        .find_map(|child| find_by_id(child, &scope, id))
}

/// Insert an enveloped exclusive-C14N ECDSA-SHA256 signature into the element
/// with `ID="{id}"`, after its Issuer when it has one.
pub fn sign_enveloped(doc: &str, id: &str, key: &IdpKey) -> String {
    let root = xml::parse(doc).unwrap();
    let (target, parent_scope) = find_by_id(&root, &NsScope::new(), id).unwrap();
    let canonical = Canonicalizer::default().canonicalize(target, &parent_scope);
    let digest = ring::digest::digest(&ring::digest::SHA256, canonical.as_bytes());

    let signed_info = format!(
        concat!(
            r#"<ds:SignedInfo xmlns:ds="{ds}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{alg}"/>"#,
            r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
            r#"<ds:Transform Algorithm="{env}"/><ds:Transform Algorithm="{c14n}"/>"#,
            r#"</ds:Transforms><ds:DigestMethod Algorithm="{dig}"/>"#,
            r#"<ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"#,
        ),
        ds = DSIG_NS,
        c14n = EXC_C14N,
        alg = ECDSA_SHA256,
        id = id,
        env = ENVELOPED_SIGNATURE,
        dig = DIGEST_SHA256,
        digest = BASE64.encode(digest.as_ref()),
    );
    let signed_info_el = xml::parse(&signed_info).unwrap();
    let canonical_si = Canonicalizer::default().canonicalize(&signed_info_el, &NsScope::new());
    let signature_value = BASE64.encode(key.sign(canonical_si.as_bytes()));

    let signature = format!(
        r#"<ds:Signature xmlns:ds="{DSIG_NS}">{}<ds:SignatureValue>{signature_value}</ds:SignatureValue></ds:Signature>"#,
        signed_info.replacen(&format!(r#" xmlns:ds="{DSIG_NS}""#), "", 1),
    );

    let id_attr = doc.find(&format!("ID=\"{id}\"")).unwrap();
    let start_end = id_attr + doc[id_attr..].find('>').unwrap() + 1;
    let rest = &doc[start_end..];
    let insert_at = if rest.starts_with("<Issuer") || rest.starts_with("<saml:Issuer") {
        let close = rest.find("</").unwrap();
        start_end + close + rest[close..].find('>').unwrap() + 1
    } else {
        start_end
    };

    let mut signed = doc.to_string();
    signed.insert_str(insert_at, &signature);
    signed
}

fn instant(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Minimal IdP issuing responses to the test SP.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    pub response_id: String,
    pub assertion_id: String,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub recipient: String,
    pub name_id: Option<String>,
    pub session_index: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    /// Bearer confirmation deadline; `not_on_or_after` when unset.
    pub confirmation_not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: Vec<(String, Vec<String>)>,
    pub status: String,
    pub sign_assertion: bool,
    pub sign_response: bool,
}

impl ResponseBuilder {
    pub fn new(in_response_to: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            response_id: format!("_{}", Uuid::new_v4()),
            assertion_id: format!("_{}", Uuid::new_v4()),
            destination: Some(format!("{SP_BASE}/acs")),
            in_response_to: in_response_to.map(str::to_string),
            issuer: IDP_ENTITY_ID.to_string(),
            audience: format!("{SP_BASE}/metadata"),
            recipient: format!("{SP_BASE}/acs"),
            name_id: Some("ada@example.com".to_string()),
            session_index: Some(format!("_{}", Uuid::new_v4())),
            not_before: now - Duration::minutes(5),
            not_on_or_after: now + Duration::hours(1),
            confirmation_not_on_or_after: None,
            attributes: vec![
                (GIVEN_NAME.to_string(), vec!["Ada".to_string()]),
                (SURNAME.to_string(), vec!["Lovelace".to_string()]),
                (GROUPS.to_string(), vec!["g1".to_string()]),
            ],
            status: "urn:oasis:names:tc:SAML:2.0:status:Success".to_string(),
            sign_assertion: true,
            sign_response: false,
        }
    }

    pub fn attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.retain(|(n, _)| n != name);
        self.attributes
            .push((name.to_string(), values.iter().map(|v| v.to_string()).collect()));
        self
    }

    pub fn without_attribute(mut self, name: &str) -> Self {
        self.attributes.retain(|(n, _)| n != name);
        self
    }

    /// Unsigned response XML.
    pub fn xml(&self) -> String {
        let now = Utc::now();
        let irt = self
            .in_response_to
            .as_ref()
            .map(|id| format!(r#" InResponseTo="{id}""#))
            .unwrap_or_default();
        let destination = self
            .destination
            .as_ref()
            .map(|d| format!(r#" Destination="{d}""#))
            .unwrap_or_default();

        let name_id = self
            .name_id
            .as_ref()
            .map(|n| {
                format!(
                    r#"<NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">{n}</NameID>"#
                )
            })
            .unwrap_or_default();

        let session_index = self
            .session_index
            .as_ref()
            .map(|s| format!(r#" SessionIndex="{s}""#))
            .unwrap_or_default();

        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| format!("<AttributeValue>{}</AttributeValue>", xml::escape(v)))
                    .collect();
                format!(r#"<Attribute Name="{name}">{values}</Attribute>"#)
            })
            .collect();

        format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="{rid}" Version="2.0" IssueInstant="{now}"{destination}{irt}>"#,
                r#"<Issuer xmlns="urn:oasis:names:tc:SAML:2.0:assertion">{issuer}</Issuer>"#,
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                r#"<Assertion xmlns="urn:oasis:names:tc:SAML:2.0:assertion" ID="{aid}" IssueInstant="{now}" Version="2.0">"#,
                r#"<Issuer>{issuer}</Issuer>"#,
                r#"<Subject>{name_id}<SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
                r#"<SubjectConfirmationData{irt} NotOnOrAfter="{confirmed}" Recipient="{recipient}"/>"#,
                r#"</SubjectConfirmation></Subject>"#,
                r#"<Conditions NotBefore="{nb}" NotOnOrAfter="{noa}"><AudienceRestriction><Audience>{audience}</Audience></AudienceRestriction></Conditions>"#,
                r#"<AttributeStatement>{attributes}</AttributeStatement>"#,
                r#"<AuthnStatement AuthnInstant="{now}"{session_index}><AuthnContext><AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:Password</AuthnContextClassRef></AuthnContext></AuthnStatement>"#,
                r#"</Assertion></samlp:Response>"#,
            ),
            rid = self.response_id,
            now = instant(now),
            destination = destination,
            irt = irt,
            issuer = self.issuer,
            status = self.status,
            aid = self.assertion_id,
            name_id = name_id,
            noa = instant(self.not_on_or_after),
            confirmed = instant(self.confirmation_not_on_or_after.unwrap_or(self.not_on_or_after)),
            nb = instant(self.not_before),
            recipient = self.recipient,
            audience = self.audience,
            attributes = attributes,
            session_index = session_index,
        )
    }

    /// Signed response XML.
    pub fn signed_xml(&self, key: &IdpKey) -> String {
        let mut doc = self.xml();
        if self.sign_assertion {
            doc = sign_enveloped(&doc, &self.assertion_id, key);
        }
        if self.sign_response {
            doc = sign_enveloped(&doc, &self.response_id, key);
        }
        doc
    }

    /// Base64 value for the `SAMLResponse` form field.
    pub fn encoded(&self, key: &IdpKey) -> String {
        BASE64.encode(self.signed_xml(key))
    }
}

/// Schema used by tests: `{base_url}` templated SP, SLS configured, 0s skew.
pub fn test_schema() -> SettingsSchema {
    SettingsSchema::from_json(
        r#"{
            "strict": true,
            "sp": {
                "entityId": "{base_url}/metadata",
                "assertionConsumerService": {"url": "{base_url}/acs"},
                "singleLogoutService": {"url": "{base_url}/slo/callback"},
                "NameIDFormat": "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress"
            },
            "security": {"clockSkewSeconds": 0},
            "roles": {"g1": "admin", "g2": "auditor"}
        }"#,
    )
    .unwrap()
}

pub fn test_overrides(keys: &[&IdpKey]) -> IdpTrustOverrides {
    IdpTrustOverrides {
        entity_id: Some(IDP_ENTITY_ID.to_string()),
        sso_url: Some(IDP_SSO_URL.to_string()),
        certificates: keys.iter().map(|k| k.cert_pem.clone()).collect(),
        sp_base_url: Some(SP_BASE.to_string()),
        ..Default::default()
    }
}

pub fn test_settings(keys: &[&IdpKey]) -> Arc<Settings> {
    test_settings_with(keys, |_| {})
}

pub fn test_settings_with(keys: &[&IdpKey], customize: impl FnOnce(&mut SettingsSchema)) -> Arc<Settings> {
    let mut schema = test_schema();
    customize(&mut schema);
    Arc::new(resolve(schema, &test_overrides(keys)).unwrap())
}

/// Descriptor for a request to the SP as the browser sees it.
pub fn sp_descriptor(path: &str) -> RequestDescriptor {
    RequestDescriptor {
        https: true,
        host: "sp.example.com".to_string(),
        port: 443,
        path: path.to_string(),
        query: Vec::new(),
        raw_query: Vec::new(),
        form: Vec::new(),
    }
}

pub fn acs_descriptor(saml_response: &str) -> RequestDescriptor {
    let mut descriptor = sp_descriptor("/acs");
    descriptor.form = vec![("SAMLResponse".to_string(), saml_response.to_string())];
    descriptor
}

/// Redirect-binding LogoutResponse as it would arrive at the SLS endpoint.
pub fn logout_response_query(
    in_response_to: &str,
    status: &str,
    signer: Option<&IdpKey>,
) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let xml = format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_{id}" Version="2.0" IssueInstant="{now}" "#,
            r#"Destination="{sp}/slo/callback" InResponseTo="{irt}">"#,
            r#"<Issuer xmlns="urn:oasis:names:tc:SAML:2.0:assertion">{issuer}</Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status></samlp:LogoutResponse>"#,
        ),
        id = Uuid::new_v4(),
        now = instant(Utc::now()),
        sp = SP_BASE,
        irt = in_response_to,
        issuer = IDP_ENTITY_ID,
        status = status,
    );
    let encoded = deflate_and_encode(&xml).unwrap();

    let mut raw = vec![(
        "SAMLResponse".to_string(),
        urlencoding::encode(&encoded).into_owned(),
    )];
    if let Some(key) = signer {
        let sig_alg = urlencoding::encode(ECDSA_SHA256).into_owned();
        let signed = format!("SAMLResponse={}&SigAlg={}", raw[0].1, sig_alg);
        let signature = BASE64.encode(key.sign(signed.as_bytes()));
        raw.push(("SigAlg".to_string(), sig_alg));
        raw.push((
            "Signature".to_string(),
            urlencoding::encode(&signature).into_owned(),
        ));
    }

    let decoded = raw
        .iter()
        .map(|(k, v)| (k.clone(), urlencoding::decode(v).unwrap().into_owned()))
        .collect();
    (raw, decoded)
}
