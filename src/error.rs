use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::ValidationFailure;

/// Failure to read the certificate bundle from its local source
#[derive(Error, Debug)]
pub enum BundleLoadError {
    /// A required file does not exist
    #[error("required file missing: {}", path.display())]
    Missing { path: PathBuf },

    /// The file exists but could not be read
    #[error("failed to read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file was read but does not hold the expected PEM content
    #[error("malformed PEM in {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Crate-wide error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bundle could not be loaded
    #[error("Load error: {0}")]
    Load(#[from] BundleLoadError),

    /// Bundle failed one or more fatal validation checks
    #[error("Validation failed: {}", join_failures(.0))]
    Validation(Vec<ValidationFailure>),

    /// Network-level failure talking to the node
    #[error("Remote unavailable during {operation}: {message}")]
    RemoteUnavailable {
        operation: &'static str,
        message: String,
    },

    /// Credentials were refused
    #[error("Authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// The node answered with something we could not interpret
    #[error("Unexpected response from node during {operation}: {message}")]
    RemoteProtocol {
        operation: &'static str,
        message: String,
    },

    /// The node refused the uploaded certificate
    #[error("Certificate upload rejected (HTTP {status}): {message}")]
    UploadRejected { status: u16, message: String },

    /// The node accepted the upload but its worker task failed
    #[error("Task {upid} finished with status {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    /// Gave up waiting for a node task
    #[error("Timed out after {waited_secs}s waiting for task {upid}")]
    TaskTimeout { upid: String, waited_secs: u64 },

    /// A service restart was refused or could not be issued
    #[error("Failed to restart service {service}: {reason}")]
    RestartFailed { service: String, reason: String },

    /// Internal ordering contract broken by a caller
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Logging could not be initialised
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Coarse classification of [`Error`], used for logging and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Load,
    Validation,
    RemoteUnavailable,
    Auth,
    RemoteProtocol,
    Upload,
    Restart,
    Precondition,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Load(_) => ErrorKind::Load,
            Error::Validation(_) => ErrorKind::Validation,
            Error::RemoteUnavailable { .. } => ErrorKind::RemoteUnavailable,
            Error::Auth { .. } => ErrorKind::Auth,
            Error::RemoteProtocol { .. } => ErrorKind::RemoteProtocol,
            Error::UploadRejected { .. } | Error::TaskFailed { .. } | Error::TaskTimeout { .. } => {
                ErrorKind::Upload
            }
            Error::RestartFailed { .. } => ErrorKind::Restart,
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::Logging(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::Load => "load",
            ErrorKind::Validation => "validation",
            ErrorKind::RemoteUnavailable => "remote_unavailable",
            ErrorKind::Auth => "auth",
            ErrorKind::RemoteProtocol => "remote_protocol",
            ErrorKind::Upload => "upload",
            ErrorKind::Restart => "restart",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {}", err))
    }
}

fn join_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
