//! The host's main loop.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::bootstrap::{BootstrapError, ConfigLoader, Host, bootstrap_with};
use crate::health::HealthReporter;
use crate::shutdown::{ShutdownError, ShutdownSignal};

const RUN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::run");

/// Why the host exited abnormally.
#[derive(Debug, Error)]
pub enum HostError {
    /// Bootstrap failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// The shutdown listener failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Bootstraps, starts every enabled plugin, waits for `shutdown` and stops
/// the plugins again.
///
/// Plugins that fail to start are reported and skipped.
///
/// # Errors
///
/// [`HostError::Bootstrap`] or [`HostError::Shutdown`]. Plugins are stopped
/// before a shutdown error is returned.
pub fn run_host(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    shutdown: &dyn ShutdownSignal,
) -> Result<Host, HostError> {
    let mut host = bootstrap_with(loader, reporter)?;
    let failures = host.plugins_mut().start_all();
    if !failures.is_empty() {
        warn!(target: RUN_TARGET, failed = failures.len(), "some plugins did not start");
    }
    let waited = shutdown.wait();
    host.plugins_mut().shutdown();
    waited?;
    Ok(host)
}
