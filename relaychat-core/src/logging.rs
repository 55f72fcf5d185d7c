use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stdout unless `file_path` is set, in which case it is appended to that file.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => Some(std::sync::Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true);

        match file {
            Some(file) => registry.with(json_layer.with_writer(file)).try_init()?,
            None => registry.with(json_layer).try_init()?,
        }
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);

        match file {
            Some(file) => registry
                .with(pretty_layer.with_ansi(false).with_writer(file))
                .try_init()?,
            None => registry.with(pretty_layer).try_init()?,
        }
    }

    Ok(())
}

/// Parse log level string to tracing Level
pub fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
