//! Data model shared by every stage of a sync run.

pub mod bundle;
pub mod sync;
pub mod validation;

pub use bundle::CertificateBundle;
pub use sync::{RemoteCertificateState, SyncDecision, SyncOutcome};
pub use validation::{ValidationFailure, ValidationResult};
