use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::bundle::BundleSource;
use crate::remote::Credentials;
use crate::types::LogFormat;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// Node API connection
    pub api: ApiSettings,

    /// Where the bundle is read from
    pub bundle: BundleSettings,

    /// Validation and sync behaviour
    pub sync: SyncSettings,

    /// Logging output
    pub logging: LoggingSettings,
}

/// Node API connection
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Base URL without trailing slash, e.g. `https://pve.example.com:8006`
    pub base_url: Url,

    /// Node name as known to the cluster
    pub node: String,

    /// API token
    pub credentials: Credentials,

    /// Verify the node's TLS certificate
    pub verify_tls: bool,

    /// Extra trust anchor for the node's TLS certificate
    pub ca_bundle_path: Option<PathBuf>,

    /// Append the CA chain to the uploaded certificate
    pub include_ca_bundle: bool,

    /// Per-request timeout
    pub request_timeout: Duration,

    /// Wait for the upload task to finish
    pub poll_task: bool,

    pub poll_interval: Duration,

    pub poll_timeout: Duration,

    /// Attempts for read-only calls
    pub max_retries: u32,

    /// Base delay for retry backoff
    pub retry_delay: Duration,
}

impl ApiSettings {
    /// Base URL as a string, without trailing slash
    pub fn base(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }
}

/// Bundle file locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSettings {
    pub directory: PathBuf,
    pub certificate_file: String,
    pub key_file: String,
    pub ca_file: String,
}

impl BundleSettings {
    pub fn source(&self) -> BundleSource {
        BundleSource::in_directory(&self.directory, &self.certificate_file, &self.key_file, &self.ca_file)
    }
}

/// Validation and sync behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Names the certificate must cover
    pub expected_hostnames: Vec<String>,

    /// Below this, validation warns but does not fail
    pub min_validity_days: i64,

    /// Services restarted after a successful upload, in order
    pub services: Vec<String>,

    pub dry_run: bool,

    /// Upload even when the fingerprint is unchanged
    pub force: bool,
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
