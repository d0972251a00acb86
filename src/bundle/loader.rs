use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use crate::crypto::{PemUtils, X509Utils};
use crate::domain::CertificateBundle;
use crate::error::BundleLoadError;

/// Where the bundle files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    /// Optional; a missing file means "no chain"
    pub ca_chain: Option<PathBuf>,
}

impl BundleSource {
    /// Files named `cert_file`, `key_file` and `ca_file` inside `dir`
    pub fn in_directory(dir: impl AsRef<Path>, cert_file: &str, key_file: &str, ca_file: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            certificate: dir.join(cert_file),
            private_key: dir.join(key_file),
            ca_chain: Some(dir.join(ca_file)),
        }
    }
}

/// Reads a bundle from disk and checks that it is structurally sound
pub struct BundleLoader;

impl BundleLoader {
    pub async fn load(source: &BundleSource) -> Result<CertificateBundle, BundleLoadError> {
        let certificate_pem = read_required(&source.certificate).await?;
        let certs = PemUtils::load_certificates(&certificate_pem).map_err(|e| malformed(&source.certificate, e))?;
        X509Utils::parse(&certs[0]).map_err(|reason| BundleLoadError::Malformed {
            path: source.certificate.clone(),
            reason,
        })?;

        let private_key_pem = read_required(&source.private_key).await?;
        PemUtils::load_private_key(&private_key_pem).map_err(|e| malformed(&source.private_key, e))?;

        let ca_chain_pem = match &source.ca_chain {
            Some(path) => match read_optional(path).await? {
                Some(pem) if pem.iter().all(u8::is_ascii_whitespace) => {
                    debug!(path = %path.display(), "CA chain file is empty, ignoring it");
                    None
                }
                Some(pem) => {
                    let chain = PemUtils::load_certificates(&pem).map_err(|e| malformed(path, e))?;
                    debug!(path = %path.display(), certificates = chain.len(), "Loaded CA chain");
                    Some(pem)
                }
                None => {
                    debug!(path = %path.display(), "No CA chain file present");
                    None
                }
            },
            None => None,
        };

        info!(
            certificate = %source.certificate.display(),
            certificates = certs.len(),
            ca_chain = ca_chain_pem.is_some(),
            "Certificate bundle loaded"
        );

        Ok(CertificateBundle::new(certificate_pem, private_key_pem, ca_chain_pem))
    }
}

async fn read_required(path: &Path) -> Result<Vec<u8>, BundleLoadError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BundleLoadError::Missing {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(BundleLoadError::Unreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, BundleLoadError> {
    match read_required(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(BundleLoadError::Missing { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn malformed(path: &Path, err: impl ToString) -> BundleLoadError {
    BundleLoadError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use tempfile::tempdir;

    fn write_pair(dir: &Path) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["pve.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let (cert_pem, key_pem) = (cert.pem(), key.serialize_pem());
        std::fs::write(dir.join("tls.crt"), &cert_pem).unwrap();
        std::fs::write(dir.join("tls.key"), &key_pem).unwrap();
        (cert_pem, key_pem)
    }

    fn source(dir: &Path) -> BundleSource {
        BundleSource::in_directory(dir, "tls.crt", "tls.key", "ca.crt")
    }

    #[tokio::test]
    async fn test_load_without_ca() {
        let dir = tempdir().unwrap();
        let (cert_pem, key_pem) = write_pair(dir.path());

        let bundle = BundleLoader::load(&source(dir.path())).await.unwrap();

        assert_eq!(bundle.certificate_pem(), cert_pem.as_bytes());
        assert_eq!(bundle.private_key_pem(), key_pem.as_bytes());
        assert!(bundle.ca_chain_pem().is_none());
    }

    #[tokio::test]
    async fn test_load_with_ca() {
        let dir = tempdir().unwrap();
        let (cert_pem, _) = write_pair(dir.path());
        std::fs::write(dir.path().join("ca.crt"), &cert_pem).unwrap();

        let bundle = BundleLoader::load(&source(dir.path())).await.unwrap();

        assert_eq!(bundle.ca_chain_pem(), Some(cert_pem.as_bytes()));
    }

    #[tokio::test]
    async fn test_missing_key_is_reported() {
        let dir = tempdir().unwrap();
        write_pair(dir.path());
        std::fs::remove_file(dir.path().join("tls.key")).unwrap();

        let err = BundleLoader::load(&source(dir.path())).await.unwrap_err();

        match err {
            BundleLoadError::Missing { path } => assert!(path.ends_with("tls.key")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_certificate_is_malformed() {
        let dir = tempdir().unwrap();
        write_pair(dir.path());
        std::fs::write(dir.path().join("tls.crt"), "hello").unwrap();

        let err = BundleLoader::load(&source(dir.path())).await.unwrap_err();

        assert!(matches!(err, BundleLoadError::Malformed { ref path, .. } if path.ends_with("tls.crt")));
    }

    #[tokio::test]
    async fn test_empty_ca_file_means_no_chain() {
        let dir = tempdir().unwrap();
        write_pair(dir.path());

        std::fs::write(dir.path().join("ca.crt"), "").unwrap();
        let bundle = BundleLoader::load(&source(dir.path())).await.unwrap();
        assert!(bundle.ca_chain_pem().is_none());

        std::fs::write(dir.path().join("ca.crt"), " \n\n").unwrap();
        let bundle = BundleLoader::load(&source(dir.path())).await.unwrap();
        assert!(bundle.ca_chain_pem().is_none());
    }

    #[tokio::test]
    async fn test_garbage_ca_file_is_malformed() {
        let dir = tempdir().unwrap();
        write_pair(dir.path());
        std::fs::write(dir.path().join("ca.crt"), "not a certificate").unwrap();

        let err = BundleLoader::load(&source(dir.path())).await.unwrap_err();

        assert!(matches!(err, BundleLoadError::Malformed { ref path, .. } if path.ends_with("ca.crt")));
    }

    #[tokio::test]
    async fn test_key_file_without_key_is_malformed() {
        let dir = tempdir().unwrap();
        let (cert_pem, _) = write_pair(dir.path());
        std::fs::write(dir.path().join("tls.key"), &cert_pem).unwrap();

        let err = BundleLoader::load(&source(dir.path())).await.unwrap_err();

        assert!(matches!(err, BundleLoadError::Malformed { ref path, .. } if path.ends_with("tls.key")));
    }
}
