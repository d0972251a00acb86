use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::SigningKey;
use rustls::SignatureScheme;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;
use x509_parser::x509::SubjectPublicKeyInfo;

/// Schemes offered when proving key possession, one per supported key type
const POSSESSION_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ED25519,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::RSA_PKCS1_SHA256,
];

const POSSESSION_CHALLENGE: &[u8] = b"pve-cert-sync key possession check";

/// X.509 certificate utility
pub struct X509Utils;

impl X509Utils {
    /// Parse a DER certificate
    pub fn parse(der: &[u8]) -> Result<X509Certificate<'_>, String> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| format!("failed to parse X.509 certificate: {}", e))?;
        Ok(cert)
    }

    /// SHA-256 over the DER encoding, as colon-separated upper-case hex
    pub fn fingerprint_sha256(der: &[u8]) -> String {
        Sha256::digest(der)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Canonical form for comparing fingerprints from different sources
    pub fn normalize_fingerprint(fingerprint: &str) -> String {
        fingerprint
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    pub fn not_after(cert: &X509Certificate<'_>) -> DateTime<Utc> {
        timestamp_to_utc(cert.validity().not_after.timestamp())
    }

    /// Names a client may reach the certificate under: SAN DNS names,
    /// SAN IP addresses and subject common names, lower-cased
    pub fn covered_names(cert: &X509Certificate<'_>) -> BTreeSet<String> {
        let mut names = BTreeSet::new();

        match cert.subject_alternative_name() {
            Ok(Some(san)) => {
                for name in &san.value.general_names {
                    match name {
                        GeneralName::DNSName(dns) => {
                            names.insert(dns.to_ascii_lowercase());
                        }
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                names.insert(ip.to_string());
                            }
                        }
                        other => trace!("Ignoring SAN entry {:?}", other),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Unreadable SubjectAltName extension: {}", e),
        }

        for cn in cert.subject().iter_common_name() {
            if let Ok(cn) = cn.as_str() {
                names.insert(cn.to_ascii_lowercase());
            }
        }

        names
    }

    /// Whether `key` is the private half of the certificate's public key.
    ///
    /// Signs a fixed challenge with the key and verifies it against the
    /// certificate's SubjectPublicKeyInfo.
    pub fn key_matches_certificate(cert: &X509Certificate<'_>, key: &PrivateKeyDer<'_>) -> bool {
        match rustls::crypto::ring::sign::any_supported_type(key) {
            Ok(signing_key) => proves_possession(signing_key.as_ref(), cert.public_key()),
            Err(e) => {
                debug!("Unsupported private key: {}", e);
                false
            }
        }
    }

    /// Verify that `leaf` chains into `chain`.
    ///
    /// Each link must match issuer to subject, be signed by a CA
    /// certificate, and that issuer must be valid at `now`. The walk ends
    /// at a self-signed certificate or at the top of the supplied chain.
    pub fn verify_chain<'a>(
        leaf: &'a X509Certificate<'a>,
        chain: &'a [X509Certificate<'a>],
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let now = now.timestamp();
        let mut current = leaf;

        for depth in 0..=chain.len() {
            let candidates: Vec<&X509Certificate<'a>> = chain
                .iter()
                .filter(|c| c.subject().as_raw() == current.issuer().as_raw())
                .collect();

            if candidates.is_empty() {
                if depth == 0 {
                    return Err(format!("issuer '{}' not found in CA chain", current.issuer()));
                }
                trace!("Chain anchored at supplied certificate '{}'", current.subject());
                return Ok(());
            }

            let issuer = candidates
                .into_iter()
                .find(|c| current.verify_signature(Some(c.public_key())).is_ok())
                .ok_or_else(|| {
                    format!(
                        "signature of '{}' does not verify against '{}'",
                        current.subject(),
                        current.issuer()
                    )
                })?;

            if !is_ca(issuer) {
                return Err(format!("issuer '{}' is not a CA certificate", issuer.subject()));
            }

            let validity = issuer.validity();
            if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
                return Err(format!(
                    "issuer '{}' is outside its validity period",
                    issuer.subject()
                ));
            }

            if issuer.subject().as_raw() == issuer.issuer().as_raw() {
                trace!("Chain anchored at self-signed root '{}'", issuer.subject());
                return Ok(());
            }

            current = issuer;
        }

        Err("issuer loop detected in CA chain".to_string())
    }
}

fn proves_possession(key: &dyn SigningKey, spki: &SubjectPublicKeyInfo<'_>) -> bool {
    let signer = match key.choose_scheme(POSSESSION_SCHEMES) {
        Some(signer) => signer,
        None => {
            debug!("Private key algorithm {:?} not supported", key.algorithm());
            return false;
        }
    };

    let proof = match signer.sign(POSSESSION_CHALLENGE) {
        Ok(proof) => proof,
        Err(e) => {
            debug!("Signing with private key failed: {}", e);
            return false;
        }
    };

    let algorithm: &'static dyn VerificationAlgorithm = match signer.scheme() {
        SignatureScheme::ED25519 => &signature::ED25519,
        SignatureScheme::ECDSA_NISTP256_SHA256 => &signature::ECDSA_P256_SHA256_ASN1,
        SignatureScheme::ECDSA_NISTP384_SHA384 => &signature::ECDSA_P384_SHA384_ASN1,
        SignatureScheme::RSA_PKCS1_SHA256 => &signature::RSA_PKCS1_2048_8192_SHA256,
        _ => return false,
    };

    let public_key: &[u8] = &spki.subject_public_key.data;
    UnparsedPublicKey::new(algorithm, public_key)
        .verify(POSSESSION_CHALLENGE, &proof)
        .is_ok()
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
