pub mod loader;

pub use loader::{BundleLoader, BundleSource};
