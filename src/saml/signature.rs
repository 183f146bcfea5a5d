//! XML-DSig enveloped signature verification and redirect-binding signatures.
//!
//! Only the trusted certificates from configuration are ever used as
//! verification keys. `KeyInfo` carried in the message is ignored.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::{digest, signature};
use tracing::debug;

use super::xml::{Canonicalizer, Element, NsScope};
use crate::error::{SamlError, ValidationFailure};
use crate::settings::{KeyKind, SpSigningKey, TrustedCertificate};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";

pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha256,
    RsaSha1,
    EcdsaSha256,
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            RSA_SHA256 => Some(Self::RsaSha256),
            RSA_SHA1 => Some(Self::RsaSha1),
            ECDSA_SHA256 => Some(Self::EcdsaSha256),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::RsaSha256 => RSA_SHA256,
            Self::RsaSha1 => RSA_SHA1,
            Self::EcdsaSha256 => ECDSA_SHA256,
        }
    }

    /// True when `sig` over `message` verifies with the certificate's key.
    pub fn verify(self, cert: &TrustedCertificate, message: &[u8], sig: &[u8]) -> bool {
        let key = cert.public_key();
        match (self, cert.key_kind()) {
            (Self::RsaSha256, KeyKind::Rsa) => {
                signature::UnparsedPublicKey::new(&signature::RSA_PKCS1_2048_8192_SHA256, key)
                    .verify(message, sig)
                    .is_ok()
            }
            (Self::RsaSha1, KeyKind::Rsa) => signature::UnparsedPublicKey::new(
                &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
                key,
            )
            .verify(message, sig)
            .is_ok(),
            // XML-DSig mandates r||s; some redirect-binding signers emit DER.
            (Self::EcdsaSha256, KeyKind::Ec) => {
                signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, key)
                    .verify(message, sig)
                    .is_ok()
                    || signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, key)
                        .verify(message, sig)
                        .is_ok()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha1,
}

impl DigestAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            DIGEST_SHA256 => Some(Self::Sha256),
            DIGEST_SHA1 => Some(Self::Sha1),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::Sha256 => DIGEST_SHA256,
            Self::Sha1 => DIGEST_SHA1,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let alg = match self {
            Self::Sha256 => &digest::SHA256,
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        };
        digest::digest(alg, data).as_ref().to_vec()
    }
}

fn failure(reason: impl Into<String>) -> ValidationFailure {
    ValidationFailure::Signature(reason.into())
}

fn decode_b64(text: &str) -> Result<Vec<u8>, ValidationFailure> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| failure(format!("invalid base64: {e}")))
}

fn inclusive_prefixes(method: &Element, scope: &NsScope) -> Vec<String> {
    let scope = method.scope(scope);
    method
        .child(&scope, EXC_C14N, "InclusiveNamespaces")
        .and_then(|inc| inc.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn required_child<'a>(
    parent: &'a Element,
    scope: &NsScope,
    name: &'static str,
) -> Result<&'a Element, ValidationFailure> {
    parent
        .child(scope, DSIG_NS, name)
        .ok_or_else(|| failure(format!("missing ds:{name}")))
}

/// Verify `signature`, an enveloped signature that is a direct child of
/// `target`, against the trust set in order.
///
/// `parent_scope` is the namespace scope inherited by `target`. Returns the
/// index of the certificate that verified the signature.
pub fn verify_enveloped(
    target: &Element,
    parent_scope: &NsScope,
    signature: &Element,
    trust: &[TrustedCertificate],
) -> Result<usize, ValidationFailure> {
    let target_scope = target.scope(parent_scope);
    let sig_scope = signature.scope(&target_scope);

    let signed_info = required_child(signature, &sig_scope, "SignedInfo")?;
    let si_scope = signed_info.scope(&sig_scope);

    let c14n_method = required_child(signed_info, &si_scope, "CanonicalizationMethod")?;
    if c14n_method.attr("Algorithm") != Some(EXC_C14N) {
        return Err(failure("unsupported canonicalization method"));
    }

    let sig_method = required_child(signed_info, &si_scope, "SignatureMethod")?;
    let algorithm = sig_method
        .attr("Algorithm")
        .and_then(SignatureAlgorithm::from_uri)
        .ok_or_else(|| failure("unsupported signature method"))?;

    let references: Vec<&Element> = signed_info.children_named(&si_scope, DSIG_NS, "Reference").collect();
    let reference = match references.as_slice() {
        [only] => *only,
        _ => return Err(failure("exactly one ds:Reference is required")),
    };
    let ref_scope = reference.scope(&si_scope);

    let target_id = target
        .attr("ID")
        .ok_or_else(|| failure("signed element has no ID"))?;
    let uri = reference.attr("URI").unwrap_or("");
    if uri.strip_prefix('#') != Some(target_id) {
        return Err(failure(format!(
            "reference {uri} does not point at the enveloping element"
        )));
    }

    let mut ref_prefixes = Vec::new();
    let mut saw_c14n = false;
    if let Some(transforms) = reference.child(&ref_scope, DSIG_NS, "Transforms") {
        let tr_scope = transforms.scope(&ref_scope);
        for transform in transforms.children_named(&tr_scope, DSIG_NS, "Transform") {
            match transform.attr("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => {}
                Some(EXC_C14N) => {
                    saw_c14n = true;
                    ref_prefixes = inclusive_prefixes(transform, &tr_scope);
                }
                other => {
                    return Err(failure(format!(
                        "unsupported transform {}",
                        other.unwrap_or("<none>")
                    )))
                }
            }
        }
    }
    if !saw_c14n {
        return Err(failure("reference is not canonicalized with exclusive C14N"));
    }

    let digest_alg = required_child(reference, &ref_scope, "DigestMethod")?
        .attr("Algorithm")
        .and_then(DigestAlgorithm::from_uri)
        .ok_or_else(|| failure("unsupported digest method"))?;
    let expected_digest = decode_b64(&required_child(reference, &ref_scope, "DigestValue")?.text())?;

    let canonical_target = Canonicalizer {
        inclusive_prefixes: ref_prefixes,
        skip: Some(signature),
        strip_signatures: false,
    }
    .canonicalize(target, parent_scope);

    if digest_alg.digest(canonical_target.as_bytes()) != expected_digest {
        return Err(failure(format!("digest mismatch for #{target_id}")));
    }

    let canonical_signed_info = Canonicalizer {
        inclusive_prefixes: inclusive_prefixes(c14n_method, &si_scope),
        skip: None,
        strip_signatures: false,
    }
    .canonicalize(signed_info, &sig_scope);

    let signature_value = decode_b64(&required_child(signature, &sig_scope, "SignatureValue")?.text())?;

    for (index, cert) in trust.iter().enumerate() {
        if algorithm.verify(cert, canonical_signed_info.as_bytes(), &signature_value) {
            debug!(
                reference = %target_id,
                signer = index,
                fingerprint = %cert.fingerprint(),
                "XML signature verified"
            );
            return Ok(index);
        }
    }

    Err(failure("signature does not match any trusted certificate"))
}

/// Sign a redirect-binding message. Returns the complete query string.
///
/// `encoded` is the deflated, base64-encoded message (not yet URL-encoded).
pub fn sign_redirect_query(
    key: &SpSigningKey,
    param: &str,
    encoded: &str,
    relay_state: Option<&str>,
) -> Result<String, SamlError> {
    let mut query = format!("{}={}", param, urlencoding::encode(encoded));
    if let Some(state) = relay_state {
        query.push_str(&format!("&RelayState={}", urlencoding::encode(state)));
    }
    query.push_str(&format!(
        "&SigAlg={}",
        urlencoding::encode(key.algorithm().uri())
    ));

    let sig = key.sign(query.as_bytes())?;
    query.push_str(&format!(
        "&Signature={}",
        urlencoding::encode(&BASE64.encode(sig))
    ));
    Ok(query)
}

/// Verify a redirect-binding query signature.
///
/// `raw` holds the query pairs exactly as received (still percent-encoded);
/// `decoded` holds the same pairs decoded. Returns `Ok(None)` when the query
/// carries no signature.
pub fn verify_redirect_query(
    param: &str,
    raw: &[(String, String)],
    decoded: &[(String, String)],
    trust: &[TrustedCertificate],
) -> Result<Option<usize>, ValidationFailure> {
    let lookup = |pairs: &[(String, String)], key: &str| -> Option<String> {
        pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    };

    let Some(signature_b64) = lookup(decoded, "Signature") else {
        return Ok(None);
    };

    let algorithm = lookup(decoded, "SigAlg")
        .as_deref()
        .and_then(SignatureAlgorithm::from_uri)
        .ok_or_else(|| failure("missing or unsupported SigAlg"))?;

    let message = lookup(raw, param).ok_or_else(|| failure(format!("missing {param}")))?;
    let mut signed = format!("{param}={message}");
    if let Some(state) = lookup(raw, "RelayState") {
        signed.push_str(&format!("&RelayState={state}"));
    }
    let sig_alg = lookup(raw, "SigAlg").unwrap_or_default();
    signed.push_str(&format!("&SigAlg={sig_alg}"));

    let sig = decode_b64(&signature_b64)?;
    trust
        .iter()
        .position(|cert| algorithm.verify(cert, signed.as_bytes(), &sig))
        .map(Some)
        .ok_or_else(|| failure("query signature does not match any trusted certificate"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::xml;
    use crate::test_support::{sign_enveloped, IdpKey};

    fn signed_doc(signer: &IdpKey) -> String {
        let unsigned = r#"<r:Root xmlns:r="urn:root" ID="_r1"><r:Item>value</r:Item></r:Root>"#;
        sign_enveloped(unsigned, "_r1", signer)
    }

    fn verify(doc: &str, trust: &[TrustedCertificate]) -> Result<usize, ValidationFailure> {
        let root = xml::parse(doc).unwrap();
        let scope = root.scope(&NsScope::new());
        let sig = root.child(&scope, DSIG_NS, "Signature").unwrap();
        verify_enveloped(&root, &NsScope::new(), sig, trust)
    }

    #[test]
    fn test_verifies_with_matching_certificate() {
        let idp = IdpKey::generate("idp.example.com");
        let doc = signed_doc(&idp);
        assert_eq!(verify(&doc, &[idp.trusted()]).unwrap(), 0);
    }

    #[test]
    fn test_rotation_picks_second_certificate() {
        let old = IdpKey::generate("old.idp.example.com");
        let new = IdpKey::generate("new.idp.example.com");
        let doc = signed_doc(&new);
        assert_eq!(verify(&doc, &[old.trusted(), new.trusted()]).unwrap(), 1);
    }

    #[test]
    fn test_rejects_foreign_signer() {
        let idp = IdpKey::generate("idp.example.com");
        let attacker = IdpKey::generate("evil.example.com");
        let doc = signed_doc(&attacker);
        let err = verify(&doc, &[idp.trusted()]).unwrap_err();
        assert!(matches!(err, ValidationFailure::Signature(_)));
        assert!(err.to_string().contains("signature check failed"));
    }

    #[test]
    fn test_rejects_tampered_content() {
        let idp = IdpKey::generate("idp.example.com");
        let doc = signed_doc(&idp).replace(">value<", ">other<");
        let err = verify(&doc, &[idp.trusted()]).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn test_rejects_reference_to_other_element() {
        let idp = IdpKey::generate("idp.example.com");
        let doc = signed_doc(&idp).replace("URI=\"#_r1\"", "URI=\"#_elsewhere\"");
        let err = verify(&doc, &[idp.trusted()]).unwrap_err();
        assert!(err.to_string().contains("does not point at"));
    }

    /// Entra-style response signed with libxmlsec1: RSA-SHA1 over the response,
    /// RSA-SHA256 over the assertion, pretty-printed.
    const RSA_RESPONSE: &str = include_str!("../../testdata/rsa_signed_response.xml");
    const RSA_CERT: &str = include_str!("../../testdata/rsa_idp_cert.pem");

    fn rsa_trusted() -> TrustedCertificate {
        TrustedCertificate::parse(RSA_CERT).unwrap()
    }

    fn verify_rsa_assertion(doc: &str, trust: &[TrustedCertificate]) -> Result<usize, ValidationFailure> {
        let root = xml::parse(doc).unwrap();
        let top = NsScope::new();
        let root_scope = root.scope(&top);
        let (assertion, _) = root
            .descendants_named(&root_scope, crate::saml::provider::ASSERTION_NS, "Assertion")
            .into_iter()
            .next()
            .unwrap();
        let assertion_scope = assertion.scope(&root_scope);
        let sig = assertion.child(&assertion_scope, DSIG_NS, "Signature").unwrap();
        verify_enveloped(assertion, &root_scope, sig, trust)
    }

    #[test]
    fn test_verifies_externally_signed_rsa_assertion() {
        assert_eq!(rsa_trusted().key_kind(), KeyKind::Rsa);
        assert_eq!(verify_rsa_assertion(RSA_RESPONSE, &[rsa_trusted()]).unwrap(), 0);

        let other = IdpKey::generate("idp.example.com");
        assert_eq!(
            verify_rsa_assertion(RSA_RESPONSE, &[other.trusted(), rsa_trusted()]).unwrap(),
            1
        );
    }

    #[test]
    fn test_verifies_externally_signed_rsa_sha1_response() {
        assert_eq!(verify(RSA_RESPONSE, &[rsa_trusted()]).unwrap(), 0);
    }

    #[test]
    fn test_rejects_tampered_rsa_assertion() {
        let doc = RSA_RESPONSE.replace("ada@example.com", "eve@example.com");
        let err = verify_rsa_assertion(&doc, &[rsa_trusted()]).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        // The response signature covers the assertion too.
        assert!(verify(&doc, &[rsa_trusted()]).is_err());
    }

    #[test]
    fn test_redirect_signature_roundtrip() {
        let sp = IdpKey::generate("sp.example.com");
        let key = SpSigningKey::from_pem(&sp.key_pem).unwrap();
        let query = sign_redirect_query(&key, "SAMLResponse", "abc+/=", Some("state 1")).unwrap();

        let raw: Vec<(String, String)> = query
            .split('&')
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let decoded: Vec<(String, String)> = raw
            .iter()
            .map(|(k, v)| (k.clone(), urlencoding::decode(v).unwrap().into_owned()))
            .collect();

        let signer = verify_redirect_query("SAMLResponse", &raw, &decoded, &[sp.trusted()]);
        assert_eq!(signer.unwrap(), Some(0));

        let other = IdpKey::generate("other.example.com");
        assert!(verify_redirect_query("SAMLResponse", &raw, &decoded, &[other.trusted()]).is_err());

        let unsigned = vec![("SAMLResponse".to_string(), "abc".to_string())];
        assert_eq!(
            verify_redirect_query("SAMLResponse", &unsigned, &unsigned, &[sp.trusted()]).unwrap(),
            None
        );
    }
}
