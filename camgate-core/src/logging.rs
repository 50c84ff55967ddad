use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize structured logging based on configuration
///
/// Supports both JSON (production) and pretty (development) formats
/// with configurable log levels and optional file output.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let log_level = parse_log_level(&config.level)?;

    // Create env filter from config level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        // JSON format for production (structured logging)
        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        if let Some(file_path) = &config.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            let file_layer = json_layer.with_writer(std::sync::Arc::new(file));
            registry.with(file_layer).init();
        } else {
            registry.with(json_layer).init();
        }
    } else {
        // Pretty format for development (human-readable)
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);

        if let Some(file_path) = &config.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            let file_layer = pretty_layer.with_writer(std::sync::Arc::new(file));
            registry.with(file_layer).init();
        } else {
            registry.with(pretty_layer).init();
        }
    }

    Ok(())
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::InvalidLogLevel(level.to_string())),
    }
}
