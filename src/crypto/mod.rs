pub mod hostname;
pub mod pem;
pub mod validator;
pub mod x509;

// Re-export key types
pub use pem::{PemError, PemUtils};
pub use validator::CryptoValidator;
pub use x509::X509Utils;
