use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::crypto::hostname::is_covered;
use crate::crypto::pem::PemUtils;
use crate::crypto::x509::X509Utils;
use crate::domain::{CertificateBundle, ValidationFailure, ValidationResult};
use crate::error::Error;
use crate::types::Result;

/// Cryptographic and naming checks on a loaded bundle
#[derive(Debug, Clone)]
pub struct CryptoValidator {
    expected_hostnames: Vec<String>,
    min_remaining_validity: Duration,
}

impl CryptoValidator {
    pub fn new(expected_hostnames: Vec<String>, min_remaining_validity: Duration) -> Self {
        Self {
            expected_hostnames,
            min_remaining_validity,
        }
    }

    /// Validate against the current time
    pub fn validate(&self, bundle: &CertificateBundle) -> Result<ValidationResult> {
        self.validate_at(bundle, Utc::now())
    }

    /// Validate as if the clock read `now`.
    ///
    /// Every check runs; failures are collected in check order so a single
    /// run reports everything that is wrong with the bundle.
    pub fn validate_at(&self, bundle: &CertificateBundle, now: DateTime<Utc>) -> Result<ValidationResult> {
        let certs = PemUtils::load_certificates(bundle.certificate_pem())
            .map_err(|e| Error::Precondition(format!("certificate not loadable: {}", e)))?;
        let leaf_der = &certs[0];
        let leaf = X509Utils::parse(leaf_der)
            .map_err(|e| Error::Precondition(format!("certificate not loadable: {}", e)))?;
        let key = PemUtils::load_private_key(bundle.private_key_pem())
            .map_err(|e| Error::Precondition(format!("private key not loadable: {}", e)))?;

        let fingerprint = X509Utils::fingerprint_sha256(leaf_der);
        let not_after = X509Utils::not_after(&leaf);
        let covered_hostnames = X509Utils::covered_names(&leaf);
        let mut failures = Vec::new();

        debug!(%fingerprint, subject = %leaf.subject(), "Validating certificate");

        // 1. key/certificate correspondence
        if !X509Utils::key_matches_certificate(&leaf, &key) {
            failures.push(ValidationFailure::KeyMismatch);
        }

        // 2. chain, only when a CA chain was supplied
        if let Some(chain_pem) = bundle.ca_chain_pem() {
            if let Some(failure) = check_chain(&leaf, &certs[1..], chain_pem, now) {
                failures.push(failure);
            }
        } else {
            debug!("No CA chain supplied, skipping chain verification");
        }

        // 3. expiry
        if not_after <= now {
            failures.push(ValidationFailure::Expired { not_after });
        } else {
            let remaining = not_after - now;
            if remaining < self.min_remaining_validity {
                let remaining_days = remaining.num_days();
                warn!(
                    %not_after,
                    remaining_days,
                    "Certificate is inside the renewal window"
                );
                failures.push(ValidationFailure::ExpiringSoon {
                    not_after,
                    remaining_days,
                });
            }
        }

        // 4. hostname coverage
        for host in &self.expected_hostnames {
            if !is_covered(&covered_hostnames, host) {
                failures.push(ValidationFailure::HostnameNotCovered(host.clone()));
            }
        }

        let result = ValidationResult::new(failures, fingerprint, not_after, covered_hostnames);

        if result.valid {
            info!(
                fingerprint = %result.fingerprint,
                not_after = %result.not_after,
                "Certificate validation succeeded"
            );
        } else {
            for failure in result.fatal_failures() {
                warn!(%failure, "Certificate validation check failed");
            }
        }

        Ok(result)
    }
}

/// Intermediates that follow the leaf in the certificate file are tried
/// ahead of the CA chain.
fn check_chain(
    leaf: &x509_parser::certificate::X509Certificate<'_>,
    bundled_intermediates: &[rustls::pki_types::CertificateDer<'static>],
    chain_pem: &[u8],
    now: DateTime<Utc>,
) -> Option<ValidationFailure> {
    let ca_ders = match PemUtils::load_certificates(chain_pem) {
        Ok(ders) => ders,
        Err(e) => {
            return Some(ValidationFailure::ChainInvalid {
                reason: format!("CA chain unreadable: {}", e),
            })
        }
    };

    let mut chain = Vec::with_capacity(bundled_intermediates.len() + ca_ders.len());
    for der in bundled_intermediates.iter().chain(ca_ders.iter()) {
        match X509Utils::parse(der) {
            Ok(cert) => chain.push(cert),
            Err(reason) => return Some(ValidationFailure::ChainInvalid { reason }),
        }
    }

    match X509Utils::verify_chain(leaf, &chain, now) {
        Ok(()) => None,
        Err(reason) => Some(ValidationFailure::ChainInvalid { reason }),
    }
}
