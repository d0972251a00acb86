use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::Error;

/// What the node reports as its installed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCertificateState {
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

/// Whether a run should push the candidate bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    Skip(String),
    Apply,
}

impl fmt::Display for SyncDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDecision::Skip(reason) => write!(f, "skip ({})", reason),
            SyncDecision::Apply => write!(f, "apply"),
        }
    }
}

/// Everything one run did, reported at exit
#[derive(Debug)]
pub struct SyncOutcome {
    pub decision: SyncDecision,
    pub uploaded: bool,
    pub restarted_services: BTreeSet<String>,
    pub errors: Vec<Error>,
    /// Whether the node reported the new fingerprint after the restarts;
    /// `None` when that could not be checked
    pub remote_verified: Option<bool>,
}

impl SyncOutcome {
    pub fn new(decision: SyncDecision) -> Self {
        Self {
            decision,
            uploaded: false,
            restarted_services: BTreeSet::new(),
            errors: Vec::new(),
            remote_verified: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
