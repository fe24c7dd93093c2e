//! The Omniview plugin host.
//!
//! Bootstrap loads layered configuration, installs structured telemetry,
//! prepares the plugins directory and discovers installed plugins. The
//! [`PluginManager`] then starts them, reports each transition through a
//! [`HealthReporter`] and routes resource events from running plugins to
//! per-type subscribers. The host stops every plugin when it receives a
//! termination signal.

mod bootstrap;
mod health;
mod manager;
mod run;
mod shutdown;
pub mod telemetry;

pub use bootstrap::{
    BootstrapError, ConfigLoader, Host, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use manager::PluginManager;
pub use run::{HostError, run_host};
pub use shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
