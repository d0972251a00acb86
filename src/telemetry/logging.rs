use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::config::LoggingSettings;
use crate::error::Error;
use crate::types::LogFormat;

/// Initialize the logging system.
///
/// `RUST_LOG`, when set, replaces the configured level.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), Error> {
    let filter = build_filter(settings)?;

    let result = match settings.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true).with_current_span(false);
            tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))
        }
        LogFormat::Text => {
            let layer = fmt::layer().with_target(true).with_ansi(false);
            tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))
        }
    };

    result.map_err(|e| Error::Logging(format!("Failed to set global default subscriber: {}", e)))
}

fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, Error> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| Error::Logging(format!("invalid log level '{}': {}", settings.level, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_level() {
        let settings = LoggingSettings {
            level: "debug".into(),
            format: LogFormat::Json,
        };

        assert!(build_filter(&settings).is_ok());
    }
}
