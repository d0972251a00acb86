pub mod api;
pub mod proxmox;
pub mod retry;
pub mod session;

pub use api::NodeApi;
#[cfg(test)]
pub use api::MockNodeApi;
pub use proxmox::ProxmoxClient;
pub use retry::RetryPolicy;
pub use session::{Credentials, Session};
