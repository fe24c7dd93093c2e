//! Host bootstrap: configuration, telemetry, plugin discovery.

use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use omniview_config::{Config, DirectoryError};
use omniview_plugins::informer::SYNC_TIMEOUT_ENV;
use omniview_plugins::{Launcher, PluginError};
use omniview_sso::TokenCache;

use crate::health::HealthReporter;
use crate::manager::PluginManager;
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Source of the host configuration.
pub trait ConfigLoader: Send + Sync {
    /// Loads the configuration.
    ///
    /// # Errors
    ///
    /// Returns the loader's error.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loads from files, environment and the process arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Hands out a fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Loader that always yields `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry could not be initialised.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The plugins directory could not be prepared.
    #[error("failed to prepare plugins directory: {source}")]
    PluginsDirectory {
        /// Filesystem error.
        #[source]
        source: DirectoryError,
    },
    /// The plugins directory could not be scanned.
    #[error("failed to discover plugins: {source}")]
    Discovery {
        /// Registry error.
        #[source]
        source: PluginError,
    },
}

/// A bootstrapped host with its plugins discovered but not yet started.
pub struct Host {
    config: Config,
    plugins: PluginManager,
    tokens: TokenCache,
    telemetry: TelemetryHandle,
}

impl Host {
    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Plugin lifecycle.
    #[must_use]
    pub const fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    /// Mutable plugin lifecycle.
    pub const fn plugins_mut(&mut self) -> &mut PluginManager {
        &mut self.plugins
    }

    /// SSO token cache at the configured location.
    #[must_use]
    pub const fn token_cache(&self) -> &TokenCache {
        &self.tokens
    }

    /// Telemetry installed during bootstrap.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }
}

/// Bootstraps the host with the supplied collaborators.
///
/// # Errors
///
/// Returns the first [`BootstrapError`]; the reporter sees it first.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
) -> Result<Host, BootstrapError> {
    reporter.bootstrap_starting();
    let fail = |error: BootstrapError| {
        reporter.bootstrap_failed(&error);
        error
    };

    let config = loader
        .load()
        .map_err(|source| fail(BootstrapError::Configuration { source }))?;
    let telemetry = telemetry::initialise(&config)
        .map_err(|source| fail(BootstrapError::Telemetry { source }))?;
    let plugins_dir = config
        .prepare_plugins_dir()
        .map_err(|source| fail(BootstrapError::PluginsDirectory { source }))?;

    let launcher = Launcher::new(config.handshake_timeout()).with_env(
        SYNC_TIMEOUT_ENV,
        config.informer_sync_timeout().as_millis().to_string(),
    );
    let mut plugins = PluginManager::new(launcher, Arc::clone(&reporter));
    plugins
        .discover(plugins_dir.as_std_path())
        .map_err(|source| fail(BootstrapError::Discovery { source }))?;

    reporter.bootstrap_succeeded(&config);
    let tokens = TokenCache::new(config.sso_cache_dir().into_std_path_buf());
    Ok(Host {
        config,
        plugins,
        tokens,
        telemetry,
    })
}
