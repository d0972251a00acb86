use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

/// A single reason a bundle is (or is about to become) unsuitable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// The private key does not belong to the certificate
    KeyMismatch,
    /// The certificate does not chain to the supplied CA bundle
    ChainInvalid { reason: String },
    /// `notAfter` is in the past
    Expired { not_after: DateTime<Utc> },
    /// Still valid, but inside the configured renewal window
    ExpiringSoon {
        not_after: DateTime<Utc>,
        remaining_days: i64,
    },
    /// An expected hostname is not among the certificate's names
    HostnameNotCovered(String),
}

impl ValidationFailure {
    /// Whether this failure blocks a sync
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ValidationFailure::ExpiringSoon { .. })
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::KeyMismatch => {
                write!(f, "private key does not match certificate public key")
            }
            ValidationFailure::ChainInvalid { reason } => {
                write!(f, "certificate chain invalid: {}", reason)
            }
            ValidationFailure::Expired { not_after } => {
                write!(f, "certificate expired at {}", not_after.to_rfc3339())
            }
            ValidationFailure::ExpiringSoon {
                not_after,
                remaining_days,
            } => write!(
                f,
                "certificate expires in {} days (at {})",
                remaining_days,
                not_after.to_rfc3339()
            ),
            ValidationFailure::HostnameNotCovered(host) => {
                write!(f, "hostname {} not covered by certificate", host)
            }
        }
    }
}

/// Outcome of validating one bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// True when no fatal failure was recorded
    pub valid: bool,
    /// Every failure found, in check order
    pub failures: Vec<ValidationFailure>,
    /// SHA-256 of the leaf certificate, colon-separated upper-case hex
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
    /// Lower-cased DNS names, IP addresses and common names
    pub covered_hostnames: BTreeSet<String>,
}

impl ValidationResult {
    pub fn new(
        failures: Vec<ValidationFailure>,
        fingerprint: String,
        not_after: DateTime<Utc>,
        covered_hostnames: BTreeSet<String>,
    ) -> Self {
        let valid = !failures.iter().any(ValidationFailure::is_fatal);
        Self {
            valid,
            failures,
            fingerprint,
            not_after,
            covered_hostnames,
        }
    }

    pub fn fatal_failures(&self) -> Vec<ValidationFailure> {
        self.failures
            .iter()
            .filter(|f| f.is_fatal())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiring_soon_alone_is_valid() {
        let not_after = Utc::now() + Duration::days(5);
        let result = ValidationResult::new(
            vec![ValidationFailure::ExpiringSoon {
                not_after,
                remaining_days: 5,
            }],
            "AA:BB".into(),
            not_after,
            BTreeSet::new(),
        );

        assert!(result.valid);
        assert!(result.fatal_failures().is_empty());
    }

    #[test]
    fn test_any_fatal_failure_invalidates() {
        let not_after = Utc::now() + Duration::days(90);
        let result = ValidationResult::new(
            vec![
                ValidationFailure::HostnameNotCovered("a.example.com".into()),
                ValidationFailure::KeyMismatch,
            ],
            "AA:BB".into(),
            not_after,
            BTreeSet::new(),
        );

        assert!(!result.valid);
        assert_eq!(result.fatal_failures().len(), 2);
    }
}
