pub mod settings;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::remote::Credentials;
use crate::types::{LogFormat, Result};

pub use settings::{ApiSettings, BundleSettings, LoggingSettings, Settings, SyncSettings};

/// Flat view of the environment, one field per variable
#[derive(Debug, Deserialize)]
#[serde(default)]
struct EnvSettings {
    proxmox_api_url: String,
    proxmox_node_name: String,
    proxmox_token_id: String,
    proxmox_token_secret: String,
    certificate_directory: PathBuf,
    tls_cert_key: String,
    tls_key_key: String,
    tls_ca_key: String,
    include_ca_bundle: bool,
    verify_tls: bool,
    ca_bundle_path: Option<String>,
    #[serde(deserialize_with = "comma_list")]
    expected_hostnames: Vec<String>,
    min_validity_days: i64,
    #[serde(deserialize_with = "comma_list")]
    services_to_restart: Vec<String>,
    dry_run: bool,
    force_sync: bool,
    poll_task: bool,
    poll_interval_seconds: u64,
    poll_timeout_seconds: u64,
    max_retries: u32,
    retry_delay_seconds: u64,
    request_timeout_seconds: u64,
    log_level: String,
    log_format: String,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            proxmox_api_url: String::new(),
            proxmox_node_name: String::new(),
            proxmox_token_id: String::new(),
            proxmox_token_secret: String::new(),
            certificate_directory: PathBuf::from("/certs"),
            tls_cert_key: "tls.crt".to_string(),
            tls_key_key: "tls.key".to_string(),
            tls_ca_key: "ca.crt".to_string(),
            include_ca_bundle: true,
            verify_tls: true,
            ca_bundle_path: None,
            expected_hostnames: Vec::new(),
            min_validity_days: 20,
            services_to_restart: vec!["pveproxy".to_string()],
            dry_run: false,
            force_sync: false,
            poll_task: true,
            poll_interval_seconds: 2,
            poll_timeout_seconds: 60,
            max_retries: 3,
            retry_delay_seconds: 1,
            request_timeout_seconds: 30,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// Load configuration from an optional `CONFIG_FILE` and the process environment
pub fn load_settings() -> Result<Settings> {
    let mut builder = Config::builder();

    if let Ok(path) = env::var("CONFIG_FILE") {
        debug!(%path, "Loading configuration file");
        builder = builder.add_source(File::with_name(&path));
    }

    let config = builder.add_source(Environment::default()).build()?;
    settings_from(config)
}

/// A list given either as one comma-separated string (environment) or as a
/// sequence (configuration file)
fn comma_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListValue {
        Joined(String),
        Items(Vec<String>),
    }

    Ok(match ListValue::deserialize(deserializer)? {
        ListValue::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        ListValue::Items(items) => items,
    })
}

fn settings_from(config: Config) -> Result<Settings> {
    let raw: EnvSettings = config.try_deserialize()?;
    let settings = raw.into_settings()?;
    validate_settings(&settings)?;
    Ok(settings)
}

impl EnvSettings {
    fn into_settings(self) -> Result<Settings> {
        let api_url = required("PROXMOX_API_URL", &self.proxmox_api_url)?;
        let base_url = Url::parse(api_url.trim_end_matches('/'))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "PROXMOX_API_URL must be http(s), got '{}'",
                base_url.scheme()
            )));
        }

        let node = required("PROXMOX_NODE_NAME", &self.proxmox_node_name)?;
        let token_id = required("PROXMOX_TOKEN_ID", &self.proxmox_token_id)?;
        let secret = required("PROXMOX_TOKEN_SECRET", &self.proxmox_token_secret)?;

        let mut expected_hostnames = clean_list(self.expected_hostnames);
        if expected_hostnames.is_empty() {
            let host = base_url
                .host_str()
                .ok_or_else(|| Error::Config("PROXMOX_API_URL has no host".into()))?;
            expected_hostnames.push(host.trim_start_matches('[').trim_end_matches(']').to_string());
        }

        let format = self
            .log_format
            .parse::<LogFormat>()
            .map_err(|e| Error::Config(format!("LOG_FORMAT: {}", e)))?;

        Ok(Settings {
            api: ApiSettings {
                base_url,
                node: node.to_string(),
                credentials: Credentials::new(token_id, secret),
                verify_tls: self.verify_tls,
                ca_bundle_path: self
                    .ca_bundle_path
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
                include_ca_bundle: self.include_ca_bundle,
                request_timeout: Duration::from_secs(self.request_timeout_seconds),
                poll_task: self.poll_task,
                poll_interval: Duration::from_secs(self.poll_interval_seconds),
                poll_timeout: Duration::from_secs(self.poll_timeout_seconds),
                max_retries: self.max_retries,
                retry_delay: Duration::from_secs(self.retry_delay_seconds),
            },
            bundle: BundleSettings {
                directory: self.certificate_directory,
                certificate_file: self.tls_cert_key,
                key_file: self.tls_key_key,
                ca_file: self.tls_ca_key,
            },
            sync: SyncSettings {
                expected_hostnames,
                min_validity_days: self.min_validity_days,
                services: clean_list(self.services_to_restart),
                dry_run: self.dry_run,
                force: self.force_sync,
            },
            logging: LoggingSettings {
                level: self.log_level.trim().to_lowercase(),
                format,
            },
        })
    }
}

/// Validate configuration values
fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.sync.min_validity_days < 0 {
        return Err(Error::Config("MIN_VALIDITY_DAYS cannot be negative".into()));
    }

    if settings.api.request_timeout.is_zero() {
        return Err(Error::Config("REQUEST_TIMEOUT_SECONDS cannot be zero".into()));
    }

    if settings.api.poll_task && settings.api.poll_interval.is_zero() {
        return Err(Error::Config("POLL_INTERVAL_SECONDS cannot be zero".into()));
    }

    for file in [
        &settings.bundle.certificate_file,
        &settings.bundle.key_file,
        &settings.bundle.ca_file,
    ] {
        if file.trim().is_empty() {
            return Err(Error::Config("bundle file names cannot be empty".into()));
        }
    }

    if !matches!(
        settings.logging.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(Error::Config(format!("unknown LOG_LEVEL '{}'", settings.logging.level)));
    }

    Ok(())
}

fn required<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Config(format!("{} is required", name)));
    }
    Ok(value)
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
