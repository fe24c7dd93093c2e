//! Lifecycle events for operators.

use omniview_config::Config;
use omniview_plugins::{PluginDescriptor, PluginError, PluginProcess};

use crate::bootstrap::BootstrapError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer for host and plugin lifecycle transitions.
pub trait HealthReporter: Send + Sync {
    /// Before configuration is loaded.
    fn bootstrap_starting(&self);

    /// After the host is ready to start plugins.
    fn bootstrap_succeeded(&self, config: &Config);

    /// When bootstrap stops early.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Before a plugin process is launched.
    fn plugin_starting(&self, descriptor: &PluginDescriptor);

    /// After a plugin passed its handshake.
    fn plugin_ready(&self, process: &PluginProcess);

    /// When a plugin could not be started.
    fn plugin_failed(&self, id: &str, error: &PluginError);

    /// After a plugin process was stopped.
    fn plugin_stopped(&self, id: &str);
}

/// Reports lifecycle events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(target: HEALTH_TARGET, event = "bootstrap_starting", "starting host bootstrap");
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            plugins_dir = %config.plugins_dir(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            "host bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "host bootstrap failed"
        );
    }

    fn plugin_starting(&self, descriptor: &PluginDescriptor) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "plugin_starting",
            plugin = descriptor.id(),
            version = descriptor.version(),
            dev_mode = descriptor.flags().dev_mode,
            "starting plugin"
        );
    }

    fn plugin_ready(&self, process: &PluginProcess) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "plugin_ready",
            plugin = process.id(),
            pid = process.pid(),
            capabilities = ?process.capabilities(),
            "plugin ready"
        );
    }

    fn plugin_failed(&self, id: &str, error: &PluginError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "plugin_failed",
            plugin = id,
            fatal = error.is_fatal(),
            error = %error,
            "plugin failed to start"
        );
    }

    fn plugin_stopped(&self, id: &str) {
        tracing::info!(target: HEALTH_TARGET, event = "plugin_stopped", plugin = id, "plugin stopped");
    }
}
