use std::io;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::Item;
use thiserror::Error;

/// Structural PEM problems
#[derive(Error, Debug)]
pub enum PemError {
    #[error("invalid PEM encoding: {0}")]
    Encoding(#[from] io::Error),

    #[error("no CERTIFICATE block found")]
    NoCertificates,

    #[error("no unencrypted private key block found")]
    NoPrivateKey,

    #[error("expected one private key, found {0}")]
    MultiplePrivateKeys(usize),
}

/// PEM utilities
pub struct PemUtils;

impl PemUtils {
    /// Load every certificate from a PEM blob, in file order
    pub fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, PemError> {
        let mut reader = io::BufReader::new(pem);
        let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;

        if certs.is_empty() {
            return Err(PemError::NoCertificates);
        }

        Ok(certs)
    }

    /// Load the single private key (PKCS#1, PKCS#8 or SEC1) from a PEM blob
    pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, PemError> {
        let mut reader = io::BufReader::new(pem);
        let mut keys: Vec<PrivateKeyDer<'static>> = Vec::new();

        for item in rustls_pemfile::read_all(&mut reader) {
            match item? {
                Item::Pkcs1Key(key) => keys.push(key.into()),
                Item::Pkcs8Key(key) => keys.push(key.into()),
                Item::Sec1Key(key) => keys.push(key.into()),
                _ => {}
            }
        }

        match keys.len() {
            0 => Err(PemError::NoPrivateKey),
            1 => Ok(keys.remove(0)),
            n => Err(PemError::MultiplePrivateKeys(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    #[test]
    fn test_load_certificates_keeps_order() {
        let first = CertificateParams::new(vec!["a.example.com".to_string()])
            .unwrap()
            .self_signed(&KeyPair::generate().unwrap())
            .unwrap();
        let second = CertificateParams::new(vec!["b.example.com".to_string()])
            .unwrap()
            .self_signed(&KeyPair::generate().unwrap())
            .unwrap();
        let pem = format!("{}{}", first.pem(), second.pem());

        let certs = PemUtils::load_certificates(pem.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].as_ref(), first.der().as_ref());
        assert_eq!(certs[1].as_ref(), second.der().as_ref());
    }

    #[test]
    fn test_load_certificates_rejects_non_pem() {
        let result = PemUtils::load_certificates(b"not a certificate");
        assert!(matches!(result, Err(PemError::NoCertificates)));
    }

    #[test]
    fn test_load_private_key_pkcs8() {
        let key = KeyPair::generate().unwrap();
        let parsed = PemUtils::load_private_key(key.serialize_pem().as_bytes()).unwrap();

        assert!(matches!(parsed, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_load_private_key_rejects_two_keys() {
        let pem = format!(
            "{}{}",
            KeyPair::generate().unwrap().serialize_pem(),
            KeyPair::generate().unwrap().serialize_pem()
        );

        let result = PemUtils::load_private_key(pem.as_bytes());
        assert!(matches!(result, Err(PemError::MultiplePrivateKeys(2))));
    }

    #[test]
    fn test_load_private_key_ignores_certificates() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["pve.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let result = PemUtils::load_private_key(cert.pem().as_bytes());
        assert!(matches!(result, Err(PemError::NoPrivateKey)));
    }
}
