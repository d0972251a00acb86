use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ApiSettings;
use crate::domain::{CertificateBundle, RemoteCertificateState};
use crate::error::Error;
use crate::remote::api::NodeApi;
use crate::remote::retry::{retry, Attempt, RetryPolicy};
use crate::remote::session::{Credentials, Session};
use crate::types::Result;

const USER_AGENT: &str = concat!("pve-cert-sync/", env!("CARGO_PKG_VERSION"));

/// Certificate files reported by the node, most specific first
const ACTIVE_CERTIFICATE_FILES: [&str; 2] = ["pveproxy-ssl.pem", "pve-ssl.pem"];

/// Standard `{"data": ...}` envelope of every API response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CertificateInfo {
    filename: String,
    fingerprint: Option<String>,
    notafter: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

/// Client for the Proxmox VE node API
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    node: String,
    include_ca_bundle: bool,
    poll_task: bool,
    poll_interval: Duration,
    poll_timeout: Duration,
    read_policy: RetryPolicy,
    write_policy: RetryPolicy,
}

impl ProxmoxClient {
    /// Create a new client
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT);

        if !settings.verify_tls {
            warn!("TLS verification of the node API is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(path) = &settings.ca_bundle_path {
            let pem = std::fs::read(path)
                .map_err(|e| Error::Config(format!("failed to read CA bundle {}: {}", path.display(), e)))?;
            let root = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid CA bundle {}: {}", path.display(), e)))?;
            builder = builder.add_root_certificate(root);
            debug!(path = %path.display(), "Trusting extra CA for node API");
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base().to_string(),
            node: settings.node.clone(),
            include_ca_bundle: settings.include_ca_bundle,
            poll_task: settings.poll_task,
            poll_interval: settings.poll_interval,
            poll_timeout: settings.poll_timeout,
            read_policy: RetryPolicy::read_only(settings.max_retries, settings.retry_delay),
            write_policy: RetryPolicy::mutating(settings.retry_delay),
        })
    }

    fn node_url(&self, session: &Session, path: &str) -> String {
        format!("{}/api2/json/nodes/{}/{}", self.base_url, session.node(), path)
    }

    /// Send an idempotent request, retrying network errors and gateway failures
    async fn send_read<F>(&self, operation: &'static str, request: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        retry(&self.read_policy, operation, || {
            let pending = request().send();
            async move {
                match pending.await {
                    Ok(response) if is_transient(response.status()) => {
                        Err(Attempt::Retry(Error::RemoteUnavailable {
                            operation,
                            message: format!("HTTP {}", response.status()),
                        }))
                    }
                    Ok(response) => Ok(response),
                    Err(e) => Err(Attempt::Retry(unavailable(operation, &e))),
                }
            }
        })
        .await
    }

    /// Send a state-changing request; only a refused connection is retried
    async fn send_mutating<F>(&self, operation: &'static str, request: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        retry(&self.write_policy, operation, || {
            let pending = request().send();
            async move {
                match pending.await {
                    Ok(response) => Ok(response),
                    Err(e) if e.is_connect() => Err(Attempt::Retry(unavailable(operation, &e))),
                    Err(e) => Err(Attempt::Abort(unavailable(operation, &e))),
                }
            }
        })
        .await
    }

    async fn wait_for_task(&self, session: &Session, upid: &str) -> Result<()> {
        let url = self.node_url(session, &format!("tasks/{}/status", upid));
        let deadline = Instant::now() + self.poll_timeout;

        info!(%upid, "Waiting for node task");

        loop {
            let response = self
                .send_read("task status", || {
                    self.client.get(&url).header(AUTHORIZATION, session.authorization())
                })
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::RemoteProtocol {
                    operation: "task status",
                    message: format!("HTTP {}: {}", status, error_body(response).await),
                });
            }

            let task: TaskStatus = parse_data(response, "task status").await?;
            debug!(%upid, status = %task.status, "Task status");

            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some("OK") => {
                        info!(%upid, "Node task finished");
                        Ok(())
                    }
                    other => Err(Error::TaskFailed {
                        upid: upid.to_string(),
                        exit_status: other.unwrap_or("unknown").to_string(),
                    }),
                };
            }

            if Instant::now() >= deadline {
                return Err(Error::TaskTimeout {
                    upid: upid.to_string(),
                    waited_secs: self.poll_timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl NodeApi for ProxmoxClient {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session> {
        let session = Session::new(&self.node, credentials);
        let url = format!("{}/api2/json/version", self.base_url);

        let response = self
            .send_read("authenticate", || {
                self.client.get(&url).header(AUTHORIZATION, session.authorization())
            })
            .await?;

        let status = response.status();
        if is_auth_failure(status) {
            return Err(Error::Auth {
                status: status.as_u16(),
                message: error_body(response).await,
            });
        }
        if !status.is_success() {
            return Err(Error::RemoteProtocol {
                operation: "authenticate",
                message: format!("HTTP {}: {}", status, error_body(response).await),
            });
        }

        let version: VersionInfo = parse_data(response, "authenticate").await?;
        info!(
            node = %self.node,
            version = version.version.as_deref().unwrap_or("unknown"),
            "Authenticated with node API"
        );

        Ok(session)
    }

    async fn fetch_current_certificate(&self, session: &Session) -> Result<RemoteCertificateState> {
        let url = self.node_url(session, "certificates/info");

        let response = self
            .send_read("fetch certificate", || {
                self.client.get(&url).header(AUTHORIZATION, session.authorization())
            })
            .await?;

        let status = response.status();
        if is_auth_failure(status) {
            return Err(Error::Auth {
                status: status.as_u16(),
                message: error_body(response).await,
            });
        }
        if !status.is_success() {
            return Err(Error::RemoteProtocol {
                operation: "fetch certificate",
                message: format!("HTTP {}: {}", status, error_body(response).await),
            });
        }

        let entries: Vec<CertificateInfo> = parse_data(response, "fetch certificate").await?;
        let active = ACTIVE_CERTIFICATE_FILES
            .iter()
            .find_map(|name| entries.iter().find(|entry| entry.filename == *name))
            .ok_or_else(|| Error::RemoteProtocol {
                operation: "fetch certificate",
                message: "no active certificate reported".into(),
            })?;

        let fingerprint = active.fingerprint.clone().ok_or_else(|| Error::RemoteProtocol {
            operation: "fetch certificate",
            message: format!("{} has no fingerprint", active.filename),
        })?;
        let expires_at = active
            .notafter
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .ok_or_else(|| Error::RemoteProtocol {
                operation: "fetch certificate",
                message: format!("{} has no valid notafter", active.filename),
            })?;

        debug!(file = %active.filename, %fingerprint, %expires_at, "Remote certificate");

        Ok(RemoteCertificateState {
            fingerprint,
            expires_at,
        })
    }

    async fn upload_certificate(&self, session: &Session, bundle: &CertificateBundle) -> Result<()> {
        let url = self.node_url(session, "certificates/custom");
        let form = [
            ("certificates", bundle.upload_certificates(self.include_ca_bundle)),
            ("key", bundle.private_key_text()),
            ("force", "1".to_string()),
        ];

        let response = self
            .send_mutating("upload certificate", || {
                self.client
                    .post(&url)
                    .header(AUTHORIZATION, session.authorization())
                    .form(&form)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UploadRejected {
                status: status.as_u16(),
                message: error_body(response).await,
            });
        }

        let task = match response.json::<ApiResponse<serde_json::Value>>().await {
            Ok(body) => body.data.as_str().filter(|d| d.starts_with("UPID:")).map(str::to_string),
            Err(e) => {
                debug!(error = %e, "Upload response carried no task id");
                None
            }
        };

        match task {
            Some(upid) if self.poll_task => self.wait_for_task(session, &upid).await?,
            Some(upid) => info!(%upid, "Upload task started, not waiting for it"),
            None => {}
        }

        info!(node = %session.node(), "Certificate uploaded");
        Ok(())
    }

    async fn restart_service(&self, session: &Session, service: &str) -> Result<()> {
        let url = self.node_url(session, &format!("services/{}/restart", service));

        let response = self
            .send_mutating("restart service", || {
                self.client.post(&url).header(AUTHORIZATION, session.authorization())
            })
            .await
            .map_err(|e| Error::RestartFailed {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RestartFailed {
                service: service.to_string(),
                reason: format!("HTTP {}: {}", status, error_body(response).await),
            });
        }

        info!(%service, "Service restart requested");
        Ok(())
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn unavailable(operation: &'static str, err: &reqwest::Error) -> Error {
    Error::RemoteUnavailable {
        operation,
        message: err.to_string(),
    }
}

async fn error_body(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string())
}

async fn parse_data<T: DeserializeOwned>(response: Response, operation: &'static str) -> Result<T> {
    response
        .json::<ApiResponse<T>>()
        .await
        .map(|body| body.data)
        .map_err(|e| Error::RemoteProtocol {
            operation,
            message: format!("unexpected response body: {}", e),
        })
}
