//! Tracing subscriber setup for operators built on this crate

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the log layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global tracing subscriber.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Returns an error
/// if a subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> crate::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    result.map_err(|e| crate::Error::ConfigError(format!("cannot install tracing subscriber: {e}")))
}
