pub mod detector;
pub mod orchestrator;

pub use detector::ChangeDetector;
pub use orchestrator::{exit_code, SyncOrchestrator, SyncState, Terminal};
