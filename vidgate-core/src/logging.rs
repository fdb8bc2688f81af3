//! Logging setup and request IDs.
//!
//! The gateway logs structured events (breadcrumb flushes included) via
//! `tracing`; output format and destination come from [`LoggingConfig`].

use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber: json or pretty format, stdout or file
/// destination. A `RUST_LOG` environment filter wins over the configured
/// level when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = Level::from_str(&config.level)
        .map_err(|_| anyhow::anyhow!("invalid log level: {}", config.level))?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let writer = log_writer(config)?;

    let base = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        base.with(fmt::layer().json().with_target(true).with_writer(writer))
            .init();
    } else {
        base.with(fmt::layer().pretty().with_writer(writer)).init();
    }
    Ok(())
}

fn log_writer(config: &LoggingConfig) -> anyhow::Result<BoxMakeWriter> {
    match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(BoxMakeWriter::new(Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
    }
}

/// Generate an opaque request ID for the `X-Request-ID` header.
#[must_use]
pub fn generate_request_id() -> String {
    nanoid::nanoid!(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_level_is_rejected_before_install() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_writer_opens_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        let config = LoggingConfig {
            file_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert!(log_writer(&config).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();

        assert_eq!(id1.len(), 16);
        assert_ne!(id1, id2);
    }
}
