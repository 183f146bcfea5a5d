//! SAML Service Provider implementation.
//!
//! Handles the SP-initiated SSO flow and SP-initiated single logout.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::binding::{decode_and_inflate, decode_post, deflate_and_encode};
use super::signature::{sign_redirect_query, verify_enveloped, verify_redirect_query, DSIG_NS};
use super::xml::{self, escape, Canonicalizer, Element, NsScope};
use crate::error::{ConfigError, SamlError, ValidationErrors, ValidationFailure};
use crate::request::RequestDescriptor;
use crate::settings::schema::{BINDING_HTTP_POST, BINDING_HTTP_REDIRECT};
use crate::settings::Settings;

pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const STATUS_PREFIX: &str = "urn:oasis:names:tc:SAML:2.0:status:";
const CM_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Redirect to the IdP carrying an AuthnRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnRedirect {
    pub url: String,
    /// ID the response's InResponseTo must echo.
    pub request_id: String,
}

/// Redirect to the IdP carrying a LogoutRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRedirect {
    pub url: String,
    pub request_id: String,
}

/// Per-call inputs for response validation.
#[derive(Debug, Clone)]
pub struct ResponseContext<'a> {
    /// Outstanding AuthnRequest ID, if any.
    pub expected_request_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

impl<'a> ResponseContext<'a> {
    pub fn new(expected_request_id: Option<&'a str>) -> Self {
        Self {
            expected_request_id,
            now: Utc::now(),
        }
    }
}

/// Identity extracted from a validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub session_index: Option<String>,
    /// Claim URI -> values in document order.
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Last instant this assertion would still pass validation: the later of
    /// the Conditions and bearer confirmation NotOnOrAfter, plus clock skew.
    /// The replay ledger must remember the ID at least this long.
    pub valid_until: Option<DateTime<Utc>>,
    /// Index into the trust set of the certificate that verified the assertion.
    pub signer: Option<usize>,
}

/// SAML Service Provider that handles authentication.
pub struct SamlProvider {
    settings: Arc<Settings>,
}

fn new_message_id() -> String {
    format!("_id{}", uuid::Uuid::new_v4())
}

fn issue_instant() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn append_query(base: &str, query: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}{query}")
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn malformed(reason: impl Into<String>) -> SamlError {
    ValidationFailure::Malformed(reason.into()).into()
}

/// Status code and message of a protocol response.
fn read_status(root: &Element, scope: &NsScope) -> Option<(String, Option<String>)> {
    let status = root.child(scope, PROTOCOL_NS, "Status")?;
    let status_scope = status.scope(scope);
    let code = status.child(&status_scope, PROTOCOL_NS, "StatusCode")?;
    let mut value = code.attr("Value")?.to_string();

    // Second-level code, when present, is the useful part ("Requester/RequestDenied").
    let code_scope = code.scope(&status_scope);
    if let Some(sub) = code
        .child(&code_scope, PROTOCOL_NS, "StatusCode")
        .and_then(|c| c.attr("Value"))
    {
        value = format!("{value}/{}", sub.trim_start_matches(STATUS_PREFIX));
    }

    let message = status
        .child(&status_scope, PROTOCOL_NS, "StatusMessage")
        .map(|m| m.text().trim().to_string())
        .filter(|m| !m.is_empty());
    Some((value, message))
}

fn check_status(root: &Element, scope: &NsScope) -> Result<(), SamlError> {
    let (code, message) = read_status(root, scope).ok_or_else(|| malformed("response has no Status"))?;
    if code == STATUS_SUCCESS {
        return Ok(());
    }
    Err(SamlError::Authentication {
        status: code.trim_start_matches(STATUS_PREFIX).to_string(),
        message: message.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

fn issuer_text(element: &Element, scope: &NsScope) -> Option<String> {
    element
        .child(scope, ASSERTION_NS, "Issuer")
        .map(|i| i.text().trim().to_string())
}

impl SamlProvider {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Query string for a redirect-binding message, signed when `sign` is set.
    fn redirect_query(&self, param: &str, xml: &str, sign: bool) -> Result<String, SamlError> {
        let encoded = deflate_and_encode(xml)?;
        if !sign {
            return Ok(format!("{param}={}", urlencoding::encode(&encoded)));
        }
        let key = self
            .settings
            .sp
            .signing_key
            .as_ref()
            .ok_or(ConfigError::Missing("sp.privateKey"))?;
        sign_redirect_query(key, param, &encoded, None)
    }

    /// Create an AuthnRequest and return the redirect to the IdP.
    pub fn build_authn_request(&self, force_authn: bool) -> Result<AuthnRedirect, SamlError> {
        let settings = &self.settings;
        let request_id = new_message_id();

        let authn_request = format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" "#,
                r#"ForceAuthn="{force}" ProtocolBinding="{binding}" AssertionConsumerServiceURL="{acs}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<samlp:NameIDPolicy Format="{format}" AllowCreate="true"/>"#,
                r#"</samlp:AuthnRequest>"#,
            ),
            protocol = PROTOCOL_NS,
            assertion = ASSERTION_NS,
            id = request_id,
            instant = issue_instant(),
            destination = escape(&settings.idp.sso_url),
            force = force_authn,
            binding = BINDING_HTTP_POST,
            acs = escape(&settings.sp.acs_url),
            issuer = escape(&settings.sp.entity_id),
            format = escape(&settings.sp.name_id_format),
        );

        let signed = settings.security.authn_requests_signed;
        let query = self.redirect_query("SAMLRequest", &authn_request, signed)?;
        let url = append_query(&settings.idp.sso_url, &query);

        debug!(
            request_id = %request_id,
            force_authn,
            signed,
            "Created SAML AuthnRequest redirect"
        );
        Ok(AuthnRedirect { url, request_id })
    }

    /// Process a SAML Response from the IdP ACS POST.
    pub fn process_response(
        &self,
        descriptor: &RequestDescriptor,
        context: &ResponseContext<'_>,
    ) -> Result<Assertion, SamlError> {
        let settings = &self.settings;

        let encoded = descriptor
            .form_param("SAMLResponse")
            .ok_or_else(|| ValidationFailure::Decode("missing SAMLResponse".to_string()))?;
        let response_xml = decode_post(encoded)?;
        let root = xml::parse(&response_xml).map_err(|e| malformed(e.to_string()))?;

        let top = NsScope::new();
        let root_scope = root.scope(&top);
        if !root.is(&root_scope, PROTOCOL_NS, "Response") {
            return Err(malformed("root element is not samlp:Response"));
        }

        debug!(
            response_id = root.attr("ID").unwrap_or(""),
            "Processing SAML response"
        );

        check_status(&root, &root_scope)?;

        if !root
            .descendants_named(&root_scope, ASSERTION_NS, "EncryptedAssertion")
            .is_empty()
        {
            return Err(ValidationFailure::EncryptedAssertion.into());
        }

        // Exactly one assertion, directly under the response. Anything else is
        // a signature-wrapping layout.
        let assertions = root.descendants_named(&root_scope, ASSERTION_NS, "Assertion");
        let assertion_el = match assertions.as_slice() {
            [(only, _)] => *only,
            other => {
                return Err(malformed(format!(
                    "expected exactly one assertion, found {}",
                    other.len()
                )))
            }
        };
        let is_direct_child = root
            .child(&root_scope, ASSERTION_NS, "Assertion")
            .is_some_and(|direct| std::ptr::eq(direct, assertion_el));
        if !is_direct_child {
            return Err(malformed("assertion is not a direct child of the response"));
        }
        let assertion_scope = assertion_el.scope(&root_scope);

        let mut errors = ValidationErrors::new();
        let signer = self.verify_signatures(&root, &root_scope, assertion_el, &mut errors);

        // Field extraction runs on the canonical form of the tree we verified,
        // with signatures removed, so no other parse of the raw bytes is trusted.
        let canonical = Canonicalizer {
            strip_signatures: true,
            ..Default::default()
        }
        .canonicalize(&root, &top);
        let response: samael::schema::Response = match canonical.parse() {
            Ok(response) => response,
            Err(e) => {
                errors.push(ValidationFailure::Malformed(format!(
                    "failed to parse SAML response: {e}"
                )));
                return Err(errors.into());
            }
        };
        let Some(assertion) = response.assertion.as_ref() else {
            errors.push(ValidationFailure::Malformed(
                "SAML response contains no assertion".to_string(),
            ));
            return Err(errors.into());
        };

        let current_url = descriptor.self_url();
        let skew = settings.security.clock_skew;
        let now = context.now;

        // Response envelope
        match root.attr("Version") {
            Some("2.0") => {}
            other => errors.push(ValidationFailure::Version(
                other.unwrap_or("<missing>").to_string(),
            )),
        }
        if assertion_el.attr("Version") != Some("2.0") {
            errors.push(ValidationFailure::Version(
                assertion_el.attr("Version").unwrap_or("<missing>").to_string(),
            ));
        }
        if let Some(destination) = root.attr("Destination") {
            if destination != current_url {
                errors.push(ValidationFailure::Destination {
                    expected: current_url.clone(),
                    actual: destination.to_string(),
                });
            }
        }

        let response_issuer = response.issuer.as_ref().and_then(|i| i.value.clone());
        if let Some(issuer) = response_issuer.as_deref().map(str::trim) {
            if issuer != settings.idp.entity_id {
                errors.push(ValidationFailure::Issuer {
                    expected: settings.idp.entity_id.clone(),
                    actual: issuer.to_string(),
                });
            }
        }
        let assertion_issuer = assertion
            .issuer
            .value
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if assertion_issuer != settings.idp.entity_id {
            errors.push(ValidationFailure::Issuer {
                expected: settings.idp.entity_id.clone(),
                actual: assertion_issuer.clone(),
            });
        }

        let in_response_to = response.in_response_to.as_deref();
        match (context.expected_request_id, in_response_to) {
            (Some(expected), Some(actual)) if expected == actual => {}
            (_, Some(actual)) => errors.push(ValidationFailure::InResponseTo {
                actual: actual.to_string(),
            }),
            (_, None) if settings.security.allow_unsolicited => {
                debug!("Accepting unsolicited SAML response");
            }
            (_, None) => errors.push(ValidationFailure::Unsolicited),
        }

        // Conditions
        if let Some(ref conditions) = assertion.conditions {
            if let Some(not_before) = conditions.not_before {
                if now < not_before - skew {
                    errors.push(ValidationFailure::NotYetValid);
                }
            }
            if let Some(not_on_or_after) = conditions.not_on_or_after {
                if now >= not_on_or_after + skew {
                    errors.push(ValidationFailure::Expired);
                }
            }
        }
        self.check_audience(assertion_el, &assertion_scope, &mut errors);
        let confirmed_until = self.check_bearer_confirmation(
            assertion_el,
            &assertion_scope,
            &current_url,
            in_response_to,
            now,
            &mut errors,
        );

        // Subject
        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|s| s.name_id.as_ref());
        let name_id_value = name_id.map(|n| n.value.trim().to_string()).unwrap_or_default();
        if name_id_value.is_empty() && settings.security.want_name_id {
            errors.push(ValidationFailure::MissingNameId);
        }

        if !errors.is_empty() {
            debug!(
                failures = errors.failures().len(),
                last = %errors.last_reason().unwrap_or_default(),
                "SAML response rejected"
            );
            return Err(errors.into());
        }

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|s| s.session_index.clone());

        let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(ref attr_statements) = assertion.attribute_statements {
            for attr_statement in attr_statements {
                for attr in &attr_statement.attributes {
                    if let Some(ref name) = attr.name {
                        let values = attr.values.iter().filter_map(|v| v.value.clone());
                        attributes.entry(name.clone()).or_default().extend(values);
                    }
                }
            }
        }

        let conditions_until = assertion.conditions.as_ref().and_then(|c| c.not_on_or_after);
        let valid_until = conditions_until
            .into_iter()
            .chain(confirmed_until)
            .max()
            .map(|t| t + skew);

        info!(
            user_id = %name_id_value,
            idp = %assertion_issuer,
            attributes = attributes.len(),
            signer = ?signer,
            "SAML assertion validated"
        );

        Ok(Assertion {
            id: assertion.id.clone(),
            issuer: assertion_issuer,
            name_id: name_id_value,
            name_id_format: name_id.and_then(|n| n.format.clone()),
            session_index,
            attributes,
            valid_until,
            signer,
        })
    }

    /// Verify the response and assertion signatures. Returns the index of the
    /// certificate covering the assertion.
    fn verify_signatures(
        &self,
        root: &Element,
        root_scope: &NsScope,
        assertion: &Element,
        errors: &mut ValidationErrors,
    ) -> Option<usize> {
        let trust = &self.settings.idp.certificates;
        let security = &self.settings.security;

        let mut response_signer = None;
        if let Some(sig) = root.child(root_scope, DSIG_NS, "Signature") {
            match verify_enveloped(root, &NsScope::new(), sig, trust) {
                Ok(index) => response_signer = Some(index),
                Err(failure) => errors.push(failure),
            }
        }

        let mut assertion_signer = None;
        let assertion_scope = assertion.scope(root_scope);
        if let Some(sig) = assertion.child(&assertion_scope, DSIG_NS, "Signature") {
            match verify_enveloped(assertion, root_scope, sig, trust) {
                Ok(index) => assertion_signer = Some(index),
                Err(failure) => errors.push(failure),
            }
        }

        if security.want_messages_signed && response_signer.is_none() {
            errors.push(ValidationFailure::Signature(
                "response message is not signed".to_string(),
            ));
        }

        // A response signature covers the assertion it contains.
        let signer = assertion_signer.or(response_signer);
        if security.want_assertions_signed && signer.is_none() && errors.is_empty() {
            errors.push(ValidationFailure::UnsignedAssertion);
        }
        signer
    }

    fn check_audience(&self, assertion: &Element, scope: &NsScope, errors: &mut ValidationErrors) {
        let expected = &self.settings.sp.entity_id;
        let Some(conditions) = assertion.child(scope, ASSERTION_NS, "Conditions") else {
            return;
        };
        let conditions_scope = conditions.scope(scope);
        for restriction in conditions.children_named(&conditions_scope, ASSERTION_NS, "AudienceRestriction") {
            let restriction_scope = restriction.scope(&conditions_scope);
            let matched = restriction
                .children_named(&restriction_scope, ASSERTION_NS, "Audience")
                .any(|audience| audience.text().trim() == expected.as_str());
            if !matched {
                errors.push(ValidationFailure::Audience {
                    expected: expected.clone(),
                });
            }
        }
    }

    /// At least one bearer SubjectConfirmation must be currently valid for this
    /// ACS. Returns the NotOnOrAfter of the one that was accepted.
    fn check_bearer_confirmation(
        &self,
        assertion: &Element,
        scope: &NsScope,
        current_url: &str,
        in_response_to: Option<&str>,
        now: DateTime<Utc>,
        errors: &mut ValidationErrors,
    ) -> Option<DateTime<Utc>> {
        let skew = self.settings.security.clock_skew;
        let Some(subject) = assertion.child(scope, ASSERTION_NS, "Subject") else {
            errors.push(ValidationFailure::SubjectConfirmation(
                "assertion has no Subject".to_string(),
            ));
            return None;
        };
        let subject_scope = subject.scope(scope);

        let mut last_problem = "no bearer SubjectConfirmation".to_string();
        for confirmation in subject.children_named(&subject_scope, ASSERTION_NS, "SubjectConfirmation") {
            if confirmation.attr("Method") != Some(CM_BEARER) {
                continue;
            }
            let confirmation_scope = confirmation.scope(&subject_scope);
            let Some(data) =
                confirmation.child(&confirmation_scope, ASSERTION_NS, "SubjectConfirmationData")
            else {
                last_problem = "missing SubjectConfirmationData".to_string();
                continue;
            };

            if let Some(recipient) = data.attr("Recipient") {
                if recipient != current_url {
                    last_problem = format!("recipient {recipient} does not match {current_url}");
                    continue;
                }
            }
            let not_on_or_after = match data.attr("NotOnOrAfter").map(parse_instant) {
                Some(Some(not_on_or_after)) if now < not_on_or_after + skew => not_on_or_after,
                Some(Some(_)) => {
                    last_problem = "confirmation has expired".to_string();
                    continue;
                }
                Some(None) => {
                    last_problem = "invalid NotOnOrAfter".to_string();
                    continue;
                }
                None => {
                    last_problem = "confirmation has no NotOnOrAfter".to_string();
                    continue;
                }
            };
            if let Some(not_before) = data.attr("NotBefore").and_then(parse_instant) {
                if now < not_before - skew {
                    last_problem = "confirmation not yet valid".to_string();
                    continue;
                }
            }
            if let Some(irt) = data.attr("InResponseTo") {
                if Some(irt) != in_response_to {
                    last_problem = format!("confirmation InResponseTo {irt} does not match");
                    continue;
                }
            }
            return Some(not_on_or_after);
        }

        errors.push(ValidationFailure::SubjectConfirmation(last_problem));
        None
    }

    /// Create a LogoutRequest for an established session and return the
    /// redirect to the IdP SLO endpoint.
    pub fn build_logout_request(
        &self,
        name_id: &str,
        session_index: &str,
        name_id_format: Option<&str>,
    ) -> Result<LogoutRedirect, SamlError> {
        if name_id.trim().is_empty() || session_index.trim().is_empty() {
            return Err(SamlError::Encoding(
                "LogoutRequest requires NameID and SessionIndex".to_string(),
            ));
        }

        let settings = &self.settings;
        let request_id = new_message_id();
        let slo_url = settings.idp.slo_url();
        let format = name_id_format.unwrap_or(&settings.sp.name_id_format);

        let logout_request = format!(
            concat!(
                r#"<samlp:LogoutRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<saml:NameID Format="{format}">{name_id}</saml:NameID>"#,
                r#"<samlp:SessionIndex>{session_index}</samlp:SessionIndex>"#,
                r#"</samlp:LogoutRequest>"#,
            ),
            protocol = PROTOCOL_NS,
            assertion = ASSERTION_NS,
            id = request_id,
            instant = issue_instant(),
            destination = escape(slo_url),
            issuer = escape(&settings.sp.entity_id),
            format = escape(format),
            name_id = escape(name_id),
            session_index = escape(session_index),
        );

        let signed = settings.security.logout_request_signed;
        let query = self.redirect_query("SAMLRequest", &logout_request, signed)?;
        let url = append_query(slo_url, &query);

        debug!(request_id = %request_id, signed, "Created SAML LogoutRequest redirect");
        Ok(LogoutRedirect { url, request_id })
    }

    /// Validate the IdP's LogoutResponse delivered on the redirect binding.
    ///
    /// The caller clears the local session whatever this returns.
    pub fn process_logout_response(
        &self,
        descriptor: &RequestDescriptor,
        expected_request_id: Option<&str>,
    ) -> Result<(), SamlError> {
        let settings = &self.settings;

        let encoded = descriptor
            .query_param("SAMLResponse")
            .ok_or_else(|| ValidationFailure::Decode("missing SAMLResponse".to_string()))?;

        let mut errors = ValidationErrors::new();
        match verify_redirect_query(
            "SAMLResponse",
            &descriptor.raw_query,
            &descriptor.query,
            &settings.idp.certificates,
        ) {
            Ok(Some(index)) => debug!(signer = index, "LogoutResponse query signature verified"),
            Ok(None) if settings.security.want_messages_signed => errors.push(
                ValidationFailure::Signature("logout response is not signed".to_string()),
            ),
            Ok(None) => {}
            Err(failure) => errors.push(failure),
        }

        let response_xml = decode_and_inflate(encoded)?;
        let root = xml::parse(&response_xml).map_err(|e| malformed(e.to_string()))?;
        let root_scope = root.scope(&NsScope::new());
        if !root.is(&root_scope, PROTOCOL_NS, "LogoutResponse") {
            return Err(malformed("root element is not samlp:LogoutResponse"));
        }

        if root.attr("Version") != Some("2.0") {
            errors.push(ValidationFailure::Version(
                root.attr("Version").unwrap_or("<missing>").to_string(),
            ));
        }
        if let Some(issuer) = issuer_text(&root, &root_scope) {
            if issuer != settings.idp.entity_id {
                errors.push(ValidationFailure::Issuer {
                    expected: settings.idp.entity_id.clone(),
                    actual: issuer,
                });
            }
        }
        match (expected_request_id, root.attr("InResponseTo")) {
            (Some(expected), Some(actual)) if expected == actual => {}
            (_, Some(actual)) => errors.push(ValidationFailure::InResponseTo {
                actual: actual.to_string(),
            }),
            (_, None) => errors.push(ValidationFailure::Unsolicited),
        }
        if let Some(destination) = root.attr("Destination") {
            let current_url = descriptor.self_url();
            if destination != current_url {
                errors.push(ValidationFailure::Destination {
                    expected: current_url,
                    actual: destination.to_string(),
                });
            }
        }

        errors.into_result()?;
        check_status(&root, &root_scope)?;

        info!(
            request_id = expected_request_id.unwrap_or(""),
            "SAML logout confirmed by IdP"
        );
        Ok(())
    }

    /// SP metadata document.
    pub fn sp_metadata(&self) -> String {
        let sp = &self.settings.sp;
        let security = &self.settings.security;

        let key_descriptor = sp
            .certificate
            .as_ref()
            .map(|cert| {
                format!(
                    concat!(
                        r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="{ds}"><ds:X509Data>"#,
                        r#"<ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
                    ),
                    ds = DSIG_NS,
                    cert = cert.to_base64(),
                )
            })
            .unwrap_or_default();

        let single_logout = sp
            .sls_url
            .as_ref()
            .map(|url| {
                format!(
                    r#"<md:SingleLogoutService Binding="{}" Location="{}"/>"#,
                    BINDING_HTTP_REDIRECT,
                    escape(url)
                )
            })
            .unwrap_or_default();

        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<md:EntityDescriptor xmlns:md="{md}" entityID="{entity_id}">"#,
                r#"<md:SPSSODescriptor AuthnRequestsSigned="{authn_signed}" WantAssertionsSigned="{want_signed}" "#,
                r#"protocolSupportEnumeration="{protocol}">"#,
                r#"{key_descriptor}{single_logout}"#,
                r#"<md:NameIDFormat>{name_id_format}</md:NameIDFormat>"#,
                r#"<md:AssertionConsumerService Binding="{post}" Location="{acs}" index="1"/>"#,
                r#"</md:SPSSODescriptor></md:EntityDescriptor>"#,
            ),
            md = METADATA_NS,
            entity_id = escape(&sp.entity_id),
            authn_signed = security.authn_requests_signed,
            want_signed = security.want_assertions_signed,
            protocol = PROTOCOL_NS,
            key_descriptor = key_descriptor,
            single_logout = single_logout,
            name_id_format = escape(&sp.name_id_format),
            post = BINDING_HTTP_POST,
            acs = escape(&sp.acs_url),
        )
    }
}
