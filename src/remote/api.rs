use async_trait::async_trait;

use crate::domain::{CertificateBundle, RemoteCertificateState};
use crate::remote::session::{Credentials, Session};
use crate::types::Result;

/// Management API of the node whose certificate is being synced
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Establish an authenticated session; `Error::Auth` on 401/403
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session>;

    /// Read the certificate the node is serving now
    async fn fetch_current_certificate(&self, session: &Session) -> Result<RemoteCertificateState>;

    /// Install `bundle` as the node's custom certificate
    async fn upload_certificate(&self, session: &Session, bundle: &CertificateBundle) -> Result<()>;

    /// Restart one node service
    async fn restart_service(&self, session: &Session, service: &str) -> Result<()>;
}
