use std::fmt;
use std::time::Instant;

use tracing::debug;

/// API token credentials
#[derive(Clone)]
pub struct Credentials {
    token_id: String,
    secret: String,
}

impl Credentials {
    pub fn new(token_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            secret: secret.into(),
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Value of the `Authorization` header for API token auth
    pub fn authorization_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.secret)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token_id", &self.token_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Authenticated context for one run against one node.
///
/// Released when dropped, on every exit path of the run.
pub struct Session {
    node: String,
    authorization: String,
    opened_at: Instant,
}

impl Session {
    pub fn new(node: impl Into<String>, credentials: &Credentials) -> Self {
        let node = node.into();
        debug!(%node, token_id = credentials.token_id(), "API session opened");
        Self {
            node,
            authorization: credentials.authorization_header(),
            opened_at: Instant::now(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub(crate) fn authorization(&self) -> &str {
        &self.authorization
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.authorization.clear();
        debug!(
            node = %self.node,
            elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
            "API session released"
        );
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("node", &self.node)
            .field("authorization", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_header_format() {
        let creds = Credentials::new("sync@pve!cert", "0000-1111");
        assert_eq!(creds.authorization_header(), "PVEAPIToken=sync@pve!cert=0000-1111");
    }

    #[test]
    fn test_debug_never_shows_secret() {
        let creds = Credentials::new("sync@pve!cert", "0000-1111");
        let session = Session::new("pve", &creds);

        assert!(!format!("{:?}", creds).contains("0000-1111"));
        assert!(!format!("{:?}", session).contains("0000-1111"));
        assert_eq!(session.node(), "pve");
    }
}
