use tracing::debug;

use crate::crypto::X509Utils;
use crate::domain::{RemoteCertificateState, SyncDecision, ValidationResult};
use crate::error::Error;
use crate::types::Result;

/// Decides whether a validated bundle needs to be pushed
pub struct ChangeDetector;

impl ChangeDetector {
    /// `remote` is `None` when the node's state could not be read; that
    /// counts as stale.
    pub fn decide(
        validation: &ValidationResult,
        remote: Option<&RemoteCertificateState>,
        force: bool,
    ) -> Result<SyncDecision> {
        if !validation.valid {
            return Err(Error::Precondition(
                "change detection requested for an invalid bundle".into(),
            ));
        }

        if force {
            debug!("Forced sync requested");
            return Ok(SyncDecision::Apply);
        }

        let Some(remote) = remote else {
            debug!("Remote state unknown, assuming stale");
            return Ok(SyncDecision::Apply);
        };

        let local = X509Utils::normalize_fingerprint(&validation.fingerprint);
        let installed = X509Utils::normalize_fingerprint(&remote.fingerprint);
        debug!(local = %validation.fingerprint, remote = %remote.fingerprint, "Comparing fingerprints");

        if local == installed {
            Ok(SyncDecision::Skip("fingerprint unchanged".to_string()))
        } else {
            Ok(SyncDecision::Apply)
        }
    }
}
