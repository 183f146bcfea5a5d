//! Key material: trusted IdP certificates and the optional SP signing key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, RsaKeyPair};
use x509_parser::prelude::parse_x509_certificate;

use crate::error::{ConfigError, SamlError};
use crate::saml::signature::SignatureAlgorithm;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ec,
}

/// An X.509 certificate the IdP may sign with.
#[derive(Debug, Clone)]
pub struct TrustedCertificate {
    der: Vec<u8>,
    public_key: Vec<u8>,
    key_kind: KeyKind,
    subject: String,
    fingerprint: String,
}

impl TrustedCertificate {
    /// Parse PEM or bare base64 DER. Escaped `\n` sequences (common in
    /// environment variables) are accepted.
    pub fn parse(material: &str) -> Result<Self, ConfigError> {
        let material = material.trim().replace("\\n", "\n");
        if material.is_empty() {
            return Err(ConfigError::NoCertificate);
        }

        let der = if material.contains("-----BEGIN") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(material.as_bytes()).map_err(|e| {
                ConfigError::Invalid {
                    field: "idp.x509cert",
                    reason: format!("invalid PEM: {e:?}"),
                }
            })?;
            pem.contents
        } else {
            let compact: String = material.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64.decode(compact).map_err(|e| ConfigError::Invalid {
                field: "idp.x509cert",
                reason: format!("invalid base64: {e}"),
            })?
        };

        Self::from_der(der)
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self, ConfigError> {
        let (public_key, key_kind, subject) = {
            let (_, cert) = parse_x509_certificate(&der).map_err(|e| ConfigError::Invalid {
                field: "idp.x509cert",
                reason: format!("not an X.509 certificate: {e}"),
            })?;

            let spki = cert.public_key();
            let key_kind = match spki.algorithm.algorithm.to_id_string().as_str() {
                OID_RSA_ENCRYPTION => KeyKind::Rsa,
                OID_EC_PUBLIC_KEY => KeyKind::Ec,
                other => {
                    return Err(ConfigError::Invalid {
                        field: "idp.x509cert",
                        reason: format!("unsupported public key algorithm {other}"),
                    })
                }
            };

            (
                spki.subject_public_key.data.to_vec(),
                key_kind,
                cert.subject().to_string(),
            )
        };

        let fingerprint = fingerprint_sha256(&der);

        Ok(Self {
            der,
            public_key,
            key_kind,
            subject,
            fingerprint,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 DER, as embedded in metadata `X509Certificate` elements.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.der)
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Uppercase, colon-separated SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint_sha256(der: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Private key used to sign redirect-binding requests.
pub enum SpSigningKey {
    Rsa(RsaKeyPair),
    Ecdsa(EcdsaKeyPair),
}

impl std::fmt::Debug for SpSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SpSigningKey")
            .field(&self.algorithm().uri())
            .finish()
    }
}

impl SpSigningKey {
    /// Load a PKCS#8 (RSA or ECDSA P-256) or PKCS#1 RSA key from PEM.
    pub fn from_pem(material: &str) -> Result<Self, ConfigError> {
        let material = material.trim().replace("\\n", "\n");
        let (_, pem) = x509_parser::pem::parse_x509_pem(material.as_bytes()).map_err(|e| {
            ConfigError::Invalid {
                field: "sp.privateKey",
                reason: format!("invalid PEM: {e:?}"),
            }
        })?;

        match pem.label.as_str() {
            "RSA PRIVATE KEY" => RsaKeyPair::from_der(&pem.contents)
                .map(SpSigningKey::Rsa)
                .map_err(|e| ConfigError::Invalid {
                    field: "sp.privateKey",
                    reason: format!("rejected PKCS#1 key: {e}"),
                }),
            "PRIVATE KEY" => {
                if let Ok(rsa) = RsaKeyPair::from_pkcs8(&pem.contents) {
                    return Ok(SpSigningKey::Rsa(rsa));
                }
                let rng = SystemRandom::new();
                EcdsaKeyPair::from_pkcs8(
                    &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
                    &pem.contents,
                    &rng,
                )
                .map(SpSigningKey::Ecdsa)
                .map_err(|e| ConfigError::Invalid {
                    field: "sp.privateKey",
                    reason: format!("rejected PKCS#8 key: {e}"),
                })
            }
            other => Err(ConfigError::Invalid {
                field: "sp.privateKey",
                reason: format!("unsupported PEM label {other}"),
            }),
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            SpSigningKey::Rsa(_) => SignatureAlgorithm::RsaSha256,
            SpSigningKey::Ecdsa(_) => SignatureAlgorithm::EcdsaSha256,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SamlError> {
        let rng = SystemRandom::new();
        match self {
            SpSigningKey::Rsa(key) => {
                let mut sig = vec![0u8; key.public().modulus_len()];
                key.sign(&signature::RSA_PKCS1_SHA256, &rng, message, &mut sig)
                    .map_err(|_| SamlError::Encoding("RSA signing failed".to_string()))?;
                Ok(sig)
            }
            SpSigningKey::Ecdsa(key) => key
                .sign(&rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| SamlError::Encoding("ECDSA signing failed".to_string())),
        }
    }
}
