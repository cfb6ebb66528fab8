//! Logging Configuration
//!
//! Builds the `tracing` subscriber from the `[logging]` config section.
//! `RUST_LOG` directives take precedence over the configured level.

use anyhow::{anyhow, Result};
use std::str::FromStr;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human-readable output
    #[default]
    Compact,
    /// Multi-line human-readable output
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Build a subscriber writing to `writer`
///
/// `verbose` raises the default level to DEBUG.
pub fn subscriber<W>(
    config: &LoggingConfig,
    verbose: bool,
    writer: W,
) -> Result<Box<dyn Subscriber + Send + Sync>>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()?
    };
    let format: LogFormat = config.format.parse().map_err(|e: String| anyhow!(e))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let layer = match format {
        LogFormat::Compact => fmt::layer().compact().with_writer(writer).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_writer(writer).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    Ok(Box::new(tracing_subscriber::registry().with(layer.with_filter(filter))))
}

/// Install the global subscriber, logging to stderr
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    subscriber(config, verbose, std::io::stderr)?.try_init()?;
    tracing::debug!(
        "Logging initialized: level={}, format={}",
        config.level,
        config.format
    );
    Ok(())
}
