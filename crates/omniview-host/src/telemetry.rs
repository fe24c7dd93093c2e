//! Process-wide `tracing` subscriber for the host.
//!
//! Plugin stderr is forwarded through the same subscriber, so host and
//! plugin records share one stream on the host's stderr.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, time::UtcTime};

use omniview_config::{Config, LogFormat};

static INSTALLED: OnceCell<TelemetryHandle> = OnceCell::new();

/// Proof that the global subscriber is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format chosen by the call that installed the subscriber.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured filter expression does not parse.
    #[error("invalid log filter '{expression}': {message}")]
    Filter {
        /// Expression from configuration.
        expression: String,
        /// Parser diagnostic.
        message: String,
    },
    /// Another subscriber was already installed by someone else.
    #[error("failed to install telemetry subscriber: {0}")]
    Install(#[source] SetGlobalDefaultError),
}

/// Installs the global subscriber on first use.
///
/// The filter is validated on every call. Only the first successful call
/// installs anything; later calls return the original handle.
///
/// # Errors
///
/// [`TelemetryError::Filter`] for a bad filter expression and
/// [`TelemetryError::Install`] when a foreign subscriber is already set.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter()).map_err(|error| TelemetryError::Filter {
        expression: config.log_filter().to_owned(),
        message: error.to_string(),
    })?;
    INSTALLED
        .get_or_try_init(|| install(filter, config.log_format()))
        .copied()
}

fn install(filter: EnvFilter, format: LogFormat) -> Result<TelemetryHandle, TelemetryError> {
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(UtcTime::rfc_3339());

    let subscriber: Box<dyn Subscriber + Send + Sync> = match format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Install)?;
    Ok(TelemetryHandle { format })
}
