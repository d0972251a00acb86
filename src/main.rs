use std::process::ExitCode;

use anyhow::{Context, Result};
use pve_cert_sync::{
    config::load_settings,
    error::{Error, ErrorKind},
    remote::ProxmoxClient,
    sync::{exit_code, SyncOrchestrator},
    telemetry,
};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("pve-cert-sync: {:#}", err);
            match err.downcast_ref::<Error>().map(Error::kind) {
                Some(ErrorKind::Config) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run() -> Result<u8> {
    // 1. Optional .env next to the binary's working directory
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(Error::Config(format!("failed to read .env: {}", e)).into());
        }
    }

    // 2. Load configuration before touching files or the network
    let settings = load_settings().context("Failed to load configuration")?;

    // 3. Initialize logging
    telemetry::init_logging(&settings.logging).context("Failed to initialise logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %settings.api.node,
        api = %settings.api.base(),
        dry_run = settings.sync.dry_run,
        force = settings.sync.force,
        "Starting certificate sync"
    );

    // 4. Build the node API client
    let client = ProxmoxClient::new(&settings.api).context("Failed to create node API client")?;

    // 5. One sync attempt
    let terminal = SyncOrchestrator::from_settings(client, &settings).run().await;

    Ok(exit_code(&terminal))
}
