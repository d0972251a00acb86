use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::bundle::{BundleLoader, BundleSource};
use crate::config::Settings;
use crate::crypto::{CryptoValidator, X509Utils};
use crate::domain::{CertificateBundle, SyncDecision, SyncOutcome, ValidationResult};
use crate::error::{Error, ErrorKind};
use crate::remote::{Credentials, NodeApi, Session};
use crate::sync::detector::ChangeDetector;

/// Where a run stands
pub enum SyncState {
    Start,
    Loaded {
        bundle: CertificateBundle,
    },
    Validated {
        bundle: CertificateBundle,
        validation: ValidationResult,
    },
    Decided {
        bundle: CertificateBundle,
        validation: ValidationResult,
        session: Session,
        decision: SyncDecision,
    },
    Uploading {
        bundle: CertificateBundle,
        validation: ValidationResult,
        session: Session,
    },
    Restarting {
        validation: ValidationResult,
        session: Session,
        outcome: SyncOutcome,
    },
    Finished(Terminal),
}

impl SyncState {
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Start => "start",
            SyncState::Loaded { .. } => "loaded",
            SyncState::Validated { .. } => "validated",
            SyncState::Decided { .. } => "decided",
            SyncState::Uploading { .. } => "uploading",
            SyncState::Restarting { .. } => "restarting",
            SyncState::Finished(terminal) => terminal.name(),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Terminal {
    /// Uploaded; `errors` lists any failed restarts
    Done(SyncOutcome),
    /// Nothing to do
    SkippedDone(SyncOutcome),
    /// Would have applied, but dry-run was set
    DryRunDone(SyncOutcome),
    Failed(Error),
}

impl Terminal {
    pub fn name(&self) -> &'static str {
        match self {
            Terminal::Done(_) => "done",
            Terminal::SkippedDone(_) => "skipped",
            Terminal::DryRunDone(_) => "dry_run",
            Terminal::Failed(_) => "failed",
        }
    }

    pub fn outcome(&self) -> Option<&SyncOutcome> {
        match self {
            Terminal::Done(outcome) | Terminal::SkippedDone(outcome) | Terminal::DryRunDone(outcome) => Some(outcome),
            Terminal::Failed(_) => None,
        }
    }
}

/// Process exit status for a finished run
pub fn exit_code(terminal: &Terminal) -> u8 {
    match terminal {
        Terminal::Done(outcome) if !outcome.is_clean() => 1,
        Terminal::Done(_) | Terminal::SkippedDone(_) | Terminal::DryRunDone(_) => 0,
        Terminal::Failed(err) => match err.kind() {
            ErrorKind::Config => 2,
            ErrorKind::Load | ErrorKind::Validation => 3,
            ErrorKind::Precondition => 4,
            ErrorKind::RemoteUnavailable
            | ErrorKind::Auth
            | ErrorKind::RemoteProtocol
            | ErrorKind::Upload
            | ErrorKind::Restart
            | ErrorKind::Internal => 1,
        },
    }
}

/// Drives one load, validate, compare and apply cycle against one node
pub struct SyncOrchestrator<A> {
    api: A,
    node: String,
    credentials: Credentials,
    source: BundleSource,
    validator: CryptoValidator,
    services: Vec<String>,
    dry_run: bool,
    force: bool,
}

impl<A: NodeApi> SyncOrchestrator<A> {
    pub fn new(
        api: A,
        node: impl Into<String>,
        credentials: Credentials,
        source: BundleSource,
        validator: CryptoValidator,
    ) -> Self {
        Self {
            api,
            node: node.into(),
            credentials,
            source,
            validator,
            services: vec!["pveproxy".to_string()],
            dry_run: false,
            force: false,
        }
    }

    pub fn from_settings(api: A, settings: &Settings) -> Self {
        let validator = CryptoValidator::new(
            settings.sync.expected_hostnames.clone(),
            Duration::days(settings.sync.min_validity_days),
        );
        Self::new(
            api,
            settings.api.node.clone(),
            settings.api.credentials.clone(),
            settings.bundle.source(),
            validator,
        )
            .with_services(settings.sync.services.clone())
            .dry_run(settings.sync.dry_run)
            .force(settings.sync.force)
    }

    /// Services restarted after upload, in this order
    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Run the state machine to completion
    pub async fn run(&self) -> Terminal {
        let mut state = SyncState::Start;
        loop {
            state = match self.advance(state).await {
                SyncState::Finished(terminal) => {
                    report(&terminal);
                    return terminal;
                }
                next => {
                    info!(state = next.name(), "Sync state");
                    next
                }
            };
        }
    }

    /// Perform exactly one transition
    pub async fn advance(&self, state: SyncState) -> SyncState {
        match state {
            SyncState::Start => match BundleLoader::load(&self.source).await {
                Ok(bundle) => SyncState::Loaded { bundle },
                Err(e) => failed(e.into()),
            },

            SyncState::Loaded { bundle } => match self.validator.validate(&bundle) {
                Ok(validation) if validation.valid => SyncState::Validated { bundle, validation },
                Ok(validation) => failed(Error::Validation(validation.fatal_failures())),
                Err(e) => failed(e),
            },

            SyncState::Validated { bundle, validation } => {
                let (session, reachable) = match self.api.authenticate(&self.credentials).await {
                    Ok(session) => (session, true),
                    Err(e) if is_unavailable(&e) => {
                        warn!(error = %e, kind = %e.kind(), "Node unreachable, assuming its certificate is stale");
                        (Session::new(self.node.as_str(), &self.credentials), false)
                    }
                    Err(e) => return failed(e),
                };

                let remote = if !reachable {
                    None
                } else {
                    match self.api.fetch_current_certificate(&session).await {
                        Ok(remote) => Some(remote),
                        Err(e) if is_unavailable(&e) => {
                            warn!(error = %e, kind = %e.kind(), "Remote certificate unavailable, assuming stale");
                            None
                        }
                        Err(e) => return failed(e),
                    }
                };

                match ChangeDetector::decide(&validation, remote.as_ref(), self.force) {
                    Ok(decision) => {
                        info!(%decision, fingerprint = %validation.fingerprint, "Sync decision");
                        SyncState::Decided {
                            bundle,
                            validation,
                            session,
                            decision,
                        }
                    }
                    Err(e) => failed(e),
                }
            }

            SyncState::Decided {
                bundle,
                validation,
                session,
                decision,
            } => match decision {
                SyncDecision::Skip(_) => SyncState::Finished(Terminal::SkippedDone(SyncOutcome::new(decision))),
                SyncDecision::Apply if self.dry_run => {
                    info!(
                        node = %session.node(),
                        fingerprint = %validation.fingerprint,
                        services = ?self.services,
                        "Dry run: would upload certificate and restart services"
                    );
                    SyncState::Finished(Terminal::DryRunDone(SyncOutcome::new(decision)))
                }
                SyncDecision::Apply => SyncState::Uploading {
                    bundle,
                    validation,
                    session,
                },
            },

            SyncState::Uploading {
                bundle,
                validation,
                session,
            } => match self.api.upload_certificate(&session, &bundle).await {
                Ok(()) => {
                    let mut outcome = SyncOutcome::new(SyncDecision::Apply);
                    outcome.uploaded = true;
                    SyncState::Restarting {
                        validation,
                        session,
                        outcome,
                    }
                }
                Err(e) => failed(e),
            },

            SyncState::Restarting {
                validation,
                session,
                mut outcome,
            } => {
                for service in &self.services {
                    match self.api.restart_service(&session, service).await {
                        Ok(()) => {
                            outcome.restarted_services.insert(service.clone());
                        }
                        Err(e) => {
                            error!(%service, error = %e, "Service restart failed");
                            outcome.errors.push(e);
                        }
                    }
                }

                outcome.remote_verified = self.verify_installed(&session, &validation).await;
                SyncState::Finished(Terminal::Done(outcome))
            }

            finished @ SyncState::Finished(_) => finished,
        }
    }

    /// Best-effort re-read of the node's certificate after an apply
    async fn verify_installed(&self, session: &Session, validation: &ValidationResult) -> Option<bool> {
        match self.api.fetch_current_certificate(session).await {
            Ok(remote) => {
                let matches = X509Utils::normalize_fingerprint(&remote.fingerprint)
                    == X509Utils::normalize_fingerprint(&validation.fingerprint);
                if matches {
                    debug!(fingerprint = %remote.fingerprint, "Node reports the new certificate");
                } else {
                    warn!(
                        expected = %validation.fingerprint,
                        reported = %remote.fingerprint,
                        "Node still reports a different certificate"
                    );
                }
                Some(matches)
            }
            Err(e) => {
                warn!(error = %e, "Could not verify installed certificate");
                None
            }
        }
    }
}

/// Remote errors that leave the node's state unknown rather than refused
fn is_unavailable(error: &Error) -> bool {
    matches!(error.kind(), ErrorKind::RemoteUnavailable | ErrorKind::RemoteProtocol)
}

fn failed(error: Error) -> SyncState {
    error!(kind = %error.kind(), %error, "Sync failed");
    SyncState::Finished(Terminal::Failed(error))
}

fn report(terminal: &Terminal) {
    match terminal.outcome() {
        Some(outcome) => info!(
            result = terminal.name(),
            decision = %outcome.decision,
            uploaded = outcome.uploaded,
            restarted = ?outcome.restarted_services,
            errors = outcome.errors.len(),
            remote_verified = ?outcome.remote_verified,
            exit_code = exit_code(terminal),
            "Sync finished"
        ),
        None => info!(result = terminal.name(), exit_code = exit_code(terminal), "Sync finished"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RemoteCertificateState, ValidationFailure};
    use crate::remote::MockNodeApi;
    use chrono::Utc;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use time::{Duration as TimeDuration, OffsetDateTime};

    const HOST: &str = "pve.example.com";

    struct Bundle {
        dir: TempDir,
        fingerprint: String,
    }

    impl Bundle {
        fn source(&self) -> BundleSource {
            BundleSource::in_directory(self.dir.path(), "tls.crt", "tls.key", "ca.crt")
        }
    }

    /// Write a CA-signed leaf for `HOST`, valid for `valid_days` from now
    fn write_bundle(valid_days: i64, mismatched_key: bool) -> Bundle {
        let dir = tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.distinguished_name.push(DnType::CommonName, "Sync Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![HOST.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, HOST);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(30);
        params.not_after = now + TimeDuration::days(valid_days);
        let leaf = params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        let key_pem = if mismatched_key {
            KeyPair::generate().unwrap().serialize_pem()
        } else {
            leaf_key.serialize_pem()
        };

        write(dir.path(), "tls.crt", &leaf.pem());
        write(dir.path(), "tls.key", &key_pem);
        write(dir.path(), "ca.crt", &ca.pem());

        Bundle {
            dir,
            fingerprint: X509Utils::fingerprint_sha256(leaf.der()),
        }
    }

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn orchestrator(api: MockNodeApi, bundle: &Bundle) -> SyncOrchestrator<MockNodeApi> {
        let validator = CryptoValidator::new(vec![HOST.to_string()], Duration::days(20));
        SyncOrchestrator::new(
            api,
            "pve",
            Credentials::new("sync@pve!cert", "secret"),
            bundle.source(),
            validator,
        )
    }

    fn remote(fingerprint: &str) -> RemoteCertificateState {
        RemoteCertificateState {
            fingerprint: fingerprint.to_string(),
            expires_at: Utc::now() + Duration::days(5),
        }
    }

    fn expect_session(api: &mut MockNodeApi) {
        api.expect_authenticate()
            .times(1)
            .returning(|creds| Ok(Session::new("pve", creds)));
    }

    #[tokio::test]
    async fn test_changed_certificate_is_uploaded_and_services_restarted() {
        let bundle = write_bundle(90, false);
        let installed = bundle.fingerprint.clone();
        let mut api = MockNodeApi::new();
        expect_session(&mut api);

        let mut fetches = 0;
        api.expect_fetch_current_certificate().times(2).returning(move |_| {
            fetches += 1;
            if fetches == 1 {
                Ok(remote("00:11:22:33"))
            } else {
                Ok(remote(&installed))
            }
        });
        api.expect_upload_certificate().times(1).returning(|_, _| Ok(()));
        api.expect_restart_service().times(2).returning(|_, _| Ok(()));

        let terminal = orchestrator(api, &bundle)
            .with_services(vec!["pveproxy".into(), "spiceproxy".into()])
            .run()
            .await;

        match &terminal {
            Terminal::Done(outcome) => {
                assert!(outcome.uploaded);
                assert!(outcome.is_clean());
                assert_eq!(outcome.restarted_services.len(), 2);
                assert_eq!(outcome.remote_verified, Some(true));
            }
            other => panic!("unexpected terminal state: {:?}", other),
        }
        assert_eq!(exit_code(&terminal), 0);
    }

    #[tokio::test]
    async fn test_expired_bundle_makes_no_remote_calls() {
        let bundle = write_bundle(-1, false);
        let mut api = MockNodeApi::new();
        api.expect_authenticate().never();
        api.expect_fetch_current_certificate().never();
        api.expect_upload_certificate().never();
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).run().await;

        match &terminal {
            Terminal::Failed(Error::Validation(failures)) => {
                assert!(matches!(failures[0], ValidationFailure::Expired { .. }));
            }
            other => panic!("unexpected terminal state: {:?}", other),
        }
        assert_eq!(exit_code(&terminal), 3);
    }

    #[tokio::test]
    async fn test_key_mismatch_never_reaches_upload() {
        let bundle = write_bundle(90, true);
        let mut api = MockNodeApi::new();
        api.expect_authenticate().never();
        api.expect_upload_certificate().never();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(
            terminal,
            Terminal::Failed(Error::Validation(ref failures)) if failures.contains(&ValidationFailure::KeyMismatch)
        ));
    }

    #[tokio::test]
    async fn test_partial_restart_failure_is_reported() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        expect_session(&mut api);
        api.expect_fetch_current_certificate()
            .returning(|_| Ok(remote("00:11:22:33")));
        api.expect_upload_certificate().times(1).returning(|_, _| Ok(()));
        api.expect_restart_service().times(2).returning(|_, service| {
            if service == "pve-cluster" {
                Err(Error::RestartFailed {
                    service: service.to_string(),
                    reason: "HTTP 500".into(),
                })
            } else {
                Ok(())
            }
        });

        let terminal = orchestrator(api, &bundle)
            .with_services(vec!["pve-cluster".into(), "pveproxy".into()])
            .run()
            .await;

        match &terminal {
            Terminal::Done(outcome) => {
                assert!(outcome.uploaded);
                assert_eq!(outcome.errors.len(), 1);
                assert!(outcome.restarted_services.contains("pveproxy"));
                assert!(!outcome.restarted_services.contains("pve-cluster"));
                assert_eq!(outcome.remote_verified, Some(false));
            }
            other => panic!("unexpected terminal state: {:?}", other),
        }
        assert_eq!(exit_code(&terminal), 1);
    }

    #[tokio::test]
    async fn test_unchanged_fingerprint_skips_mutations() {
        let bundle = write_bundle(90, false);
        let installed = bundle.fingerprint.to_lowercase();
        let mut api = MockNodeApi::new();
        expect_session(&mut api);
        api.expect_fetch_current_certificate()
            .times(1)
            .returning(move |_| Ok(remote(&installed)));
        api.expect_upload_certificate().never();
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(terminal, Terminal::SkippedDone(_)));
        assert_eq!(exit_code(&terminal), 0);
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        expect_session(&mut api);
        api.expect_fetch_current_certificate()
            .returning(|_| Ok(remote("00:11:22:33")));
        api.expect_upload_certificate().never();
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).dry_run(true).run().await;

        match &terminal {
            Terminal::DryRunDone(outcome) => assert_eq!(outcome.decision, SyncDecision::Apply),
            other => panic!("unexpected terminal state: {:?}", other),
        }
        assert_eq!(exit_code(&terminal), 0);
    }

    #[tokio::test]
    async fn test_unavailable_remote_state_fails_open() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        expect_session(&mut api);
        api.expect_fetch_current_certificate().returning(|_| {
            Err(Error::RemoteUnavailable {
                operation: "fetch certificate",
                message: "connection reset".into(),
            })
        });
        api.expect_upload_certificate().times(1).returning(|_, _| Ok(()));
        api.expect_restart_service().times(1).returning(|_, _| Ok(()));

        let terminal = orchestrator(api, &bundle).run().await;

        match &terminal {
            Terminal::Done(outcome) => {
                assert!(outcome.is_clean());
                assert_eq!(outcome.remote_verified, None);
            }
            other => panic!("unexpected terminal state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_rejection_skips_restarts() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        expect_session(&mut api);
        api.expect_fetch_current_certificate()
            .returning(|_| Ok(remote("00:11:22:33")));
        api.expect_upload_certificate().times(1).returning(|_, _| {
            Err(Error::UploadRejected {
                status: 400,
                message: "bad chain".into(),
            })
        });
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(terminal, Terminal::Failed(Error::UploadRejected { status: 400, .. })));
        assert_eq!(exit_code(&terminal), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        api.expect_authenticate().times(1).returning(|_| {
            Err(Error::Auth {
                status: 401,
                message: "invalid token".into(),
            })
        });
        api.expect_fetch_current_certificate().never();
        api.expect_upload_certificate().never();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(terminal, Terminal::Failed(Error::Auth { .. })));
        assert_eq!(exit_code(&terminal), 1);
    }

    #[tokio::test]
    async fn test_rejected_fetch_credentials_are_fatal() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        expect_session(&mut api);
        api.expect_fetch_current_certificate().times(1).returning(|_| {
            Err(Error::Auth {
                status: 403,
                message: "permission check failed".into(),
            })
        });
        api.expect_upload_certificate().never();
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(terminal, Terminal::Failed(Error::Auth { status: 403, .. })));
        assert_eq!(exit_code(&terminal), 1);
    }

    #[tokio::test]
    async fn test_unreachable_node_dry_run_still_reports_decision() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        api.expect_authenticate().times(1).returning(|_| {
            Err(Error::RemoteUnavailable {
                operation: "authenticate",
                message: "connection refused".into(),
            })
        });
        api.expect_fetch_current_certificate().never();
        api.expect_upload_certificate().never();
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).dry_run(true).run().await;

        match &terminal {
            Terminal::DryRunDone(outcome) => assert_eq!(outcome.decision, SyncDecision::Apply),
            other => panic!("unexpected terminal state: {:?}", other),
        }
        assert_eq!(exit_code(&terminal), 0);
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_at_upload() {
        let bundle = write_bundle(90, false);
        let mut api = MockNodeApi::new();
        api.expect_authenticate().times(1).returning(|_| {
            Err(Error::RemoteUnavailable {
                operation: "authenticate",
                message: "connection refused".into(),
            })
        });
        api.expect_fetch_current_certificate().never();
        api.expect_upload_certificate().times(1).returning(|session, _| {
            assert_eq!(session.node(), "pve");
            Err(Error::RemoteUnavailable {
                operation: "upload certificate",
                message: "connection refused".into(),
            })
        });
        api.expect_restart_service().never();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(terminal, Terminal::Failed(Error::RemoteUnavailable { .. })));
        assert_eq!(exit_code(&terminal), 1);
    }

    #[tokio::test]
    async fn test_missing_bundle_is_load_failure() {
        let bundle = write_bundle(90, false);
        std::fs::remove_file(bundle.dir.path().join("tls.crt")).unwrap();
        let api = MockNodeApi::new();

        let terminal = orchestrator(api, &bundle).run().await;

        assert!(matches!(terminal, Terminal::Failed(Error::Load(_))));
        assert_eq!(exit_code(&terminal), 3);
    }

    #[test]
    fn test_exit_codes() {
        let restart_error = Error::RestartFailed {
            service: "pveproxy".into(),
            reason: "timeout".into(),
        };
        let mut partial = SyncOutcome::new(SyncDecision::Apply);
        partial.errors.push(restart_error);

        assert_eq!(exit_code(&Terminal::Done(SyncOutcome::new(SyncDecision::Apply))), 0);
        assert_eq!(exit_code(&Terminal::Done(partial)), 1);
        assert_eq!(
            exit_code(&Terminal::SkippedDone(SyncOutcome::new(SyncDecision::Skip("same".into())))),
            0
        );
        assert_eq!(exit_code(&Terminal::Failed(Error::Precondition("x".into()))), 4);
        assert_eq!(exit_code(&Terminal::Failed(Error::Config("x".into()))), 2);
        assert_eq!(
            exit_code(&Terminal::Failed(Error::RemoteUnavailable {
                operation: "authenticate",
                message: "down".into()
            })),
            1
        );
    }
}
