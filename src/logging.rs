use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

const LOG_FILE_PREFIX: &str = "gitplan.log";

/// `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingSection) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log filter '{}'", config.level)),
    }
}

/// Install the global subscriber: stderr in text or JSON, plus daily
/// rolling files when `dir` is set. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init_tracing(config: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config)?;

    let stderr = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_is_used() {
        let config = LoggingSection {
            level: "gitplan=debug,warn".into(),
            ..Default::default()
        };
        let filter = env_filter(&config).unwrap();
        if std::env::var("RUST_LOG").is_err() {
            assert!(filter.to_string().contains("gitplan=debug"));
        }
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingSection {
            level: "gitplan=notalevel".into(),
            ..Default::default()
        };
        assert!(env_filter(&config).is_err());
    }
}
