//! pve-cert-sync - keeps a Proxmox VE node's TLS certificate in sync with an
//! externally issued bundle
//!
//! Loads and validates the bundle, compares it with what the node serves,
//! and uploads it only when it changed.

// Foundational layer
pub mod error;
pub mod types;
pub mod config;
pub mod telemetry;

// Core layer
pub mod domain;
pub mod crypto;
pub mod bundle;

// Application layer
pub mod remote;
pub mod sync;

// Public key types
pub use crate::error::{Error, ErrorKind};
pub use crate::types::{LogFormat, Result};
pub use crate::config::{load_settings, Settings};
pub use crate::domain::{CertificateBundle, SyncDecision, SyncOutcome, ValidationFailure, ValidationResult};
pub use crate::remote::{NodeApi, ProxmoxClient};
pub use crate::sync::{exit_code, SyncOrchestrator, Terminal};
