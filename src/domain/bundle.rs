use std::fmt;

/// Certificate, private key and optional CA chain, treated as one unit.
///
/// The bytes are kept exactly as read from disk. A bundle is built once by
/// the loader and never mutated afterwards.
#[derive(Clone)]
pub struct CertificateBundle {
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
    ca_chain_pem: Option<Vec<u8>>,
}

impl CertificateBundle {
    pub fn new(certificate_pem: Vec<u8>, private_key_pem: Vec<u8>, ca_chain_pem: Option<Vec<u8>>) -> Self {
        Self {
            certificate_pem,
            private_key_pem,
            ca_chain_pem,
        }
    }

    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn ca_chain_pem(&self) -> Option<&[u8]> {
        self.ca_chain_pem.as_deref()
    }

    /// Certificate text as uploaded to the node, optionally followed by the CA chain
    pub fn upload_certificates(&self, include_ca_chain: bool) -> String {
        let mut certificates = String::from_utf8_lossy(&self.certificate_pem).trim_end().to_string();
        certificates.push('\n');

        if include_ca_chain {
            if let Some(chain) = &self.ca_chain_pem {
                let chain = String::from_utf8_lossy(chain);
                let chain = chain.trim();
                if !chain.is_empty() {
                    certificates.push_str(chain);
                    certificates.push('\n');
                }
            }
        }

        certificates
    }

    pub fn private_key_text(&self) -> String {
        String::from_utf8_lossy(&self.private_key_pem).into_owned()
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("certificate_pem_len", &self.certificate_pem.len())
            .field("private_key_pem", &"<redacted>")
            .field("ca_chain_pem_len", &self.ca_chain_pem.as_ref().map(Vec::len))
            .finish()
    }
}
