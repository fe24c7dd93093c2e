//! Host-side plugin lifecycle with health reporting and event routing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use omniview_plugins::informer::EventRouter;
use omniview_plugins::{
    CancellationToken, CapabilityClient, Launcher, PluginContext, PluginDescriptor, PluginError,
    PluginRegistry, ResourceClient,
};

use crate::health::HealthReporter;

const MANAGER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::manager");

struct EventRoute {
    router: EventRouter,
    stop: CancellationToken,
    worker: JoinHandle<()>,
}

/// Owns the [`PluginRegistry`] and reports every lifecycle transition.
pub struct PluginManager {
    registry: PluginRegistry,
    reporter: Arc<dyn HealthReporter>,
    routes: HashMap<String, EventRoute>,
}

impl PluginManager {
    /// Manager launching plugins with `launcher`.
    #[must_use]
    pub fn new(launcher: Launcher, reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            registry: PluginRegistry::new(launcher),
            reporter,
            routes: HashMap::new(),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Registers every valid plugin under `dir`.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::discover`].
    pub fn discover(&mut self, dir: &Path) -> Result<Vec<String>, PluginError> {
        let found = self.registry.discover(dir)?;
        info!(
            target: MANAGER_TARGET,
            dir = %dir.display(),
            count = found.len(),
            "plugin discovery finished"
        );
        Ok(found)
    }

    /// Registers one plugin outside discovery, for example a dev-mode build.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::register`].
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), PluginError> {
        self.registry.register(descriptor)
    }

    /// Starts `id`, reporting the outcome.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::start`].
    pub fn start(&mut self, id: &str) -> Result<(), PluginError> {
        let descriptor = self
            .registry
            .get(id)
            .ok_or_else(|| PluginError::NotFound { id: id.to_owned() })?;
        if self.registry.is_running(id) {
            return Ok(());
        }
        self.reporter.plugin_starting(descriptor);
        if let Err(error) = self.registry.start(id) {
            self.reporter.plugin_failed(id, &error);
            return Err(error);
        }
        let process = self.registry.process(id)?;
        self.reporter.plugin_ready(process);
        Ok(())
    }

    /// Starts every enabled plugin and returns the failures. A failing
    /// plugin never prevents the others from starting.
    pub fn start_all(&mut self) -> Vec<PluginError> {
        let enabled: Vec<String> = self
            .registry
            .descriptors()
            .filter(|descriptor| descriptor.flags().enabled)
            .map(|descriptor| descriptor.id().to_owned())
            .collect();
        enabled
            .iter()
            .filter_map(|id| self.start(id).err())
            .collect()
    }

    /// Stops `id` and its event routing.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for unknown IDs.
    pub fn stop(&mut self, id: &str) -> Result<(), PluginError> {
        let was_running = self.registry.is_running(id);
        self.stop_events(id);
        self.registry.stop(id)?;
        if was_running {
            self.reporter.plugin_stopped(id);
        }
        Ok(())
    }

    /// Restarts `id` with a fresh process.
    ///
    /// # Errors
    ///
    /// As for [`Self::stop`] and [`Self::start`].
    pub fn reload(&mut self, id: &str) -> Result<(), PluginError> {
        self.stop(id)?;
        self.start(id)
    }

    /// Enables or disables `id`. Disabling stops it.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for unknown IDs.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), PluginError> {
        if !enabled {
            self.stop(id)?;
        }
        self.registry.set_enabled(id, enabled)
    }

    /// A capability client for plugin `id`.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::dispense`].
    pub fn dispense<C: CapabilityClient>(&self, id: &str) -> Result<C, PluginError> {
        self.registry.dispense::<C>(id)
    }

    /// Router carrying plugin `id`'s resource events, subscribing to the
    /// plugin's event stream on first use.
    ///
    /// # Errors
    ///
    /// As for [`Self::dispense`] with [`ResourceClient`], or
    /// [`PluginError::SpawnFailed`] when the pump thread cannot start.
    pub fn events(&mut self, id: &str, ctx: PluginContext) -> Result<EventRouter, PluginError> {
        if let Some(route) = self.routes.get(id)
            && !route.worker.is_finished()
        {
            return Ok(route.router.clone());
        }
        self.stop_events(id);
        let client: ResourceClient = self.dispense(id)?;
        let router = EventRouter::default();
        let stop = CancellationToken::new();
        let worker = router
            .spawn(Arc::new(client), ctx, stop.clone())
            .map_err(|source| PluginError::SpawnFailed {
                id: id.to_owned(),
                message: String::from("event router thread could not be spawned"),
                source: Some(Arc::new(source)),
            })?;
        debug!(target: MANAGER_TARGET, plugin = id, "routing plugin events");
        self.routes.insert(
            id.to_owned(),
            EventRoute {
                router: router.clone(),
                stop,
                worker,
            },
        );
        Ok(router)
    }

    /// Stops every plugin.
    pub fn shutdown(&mut self) {
        let running: Vec<String> = self
            .registry
            .descriptors()
            .filter(|descriptor| self.registry.is_running(descriptor.id()))
            .map(|descriptor| descriptor.id().to_owned())
            .collect();
        for id in &running {
            if let Err(error) = self.stop(id) {
                warn!(target: MANAGER_TARGET, plugin = %id, %error, "failed to stop plugin");
            }
        }
        info!(target: MANAGER_TARGET, stopped = running.len(), "all plugins stopped");
    }

    fn stop_events(&mut self, id: &str) {
        if let Some(route) = self.routes.remove(id) {
            route.stop.cancel();
            // The pump exits once the plugin's stream closes, which happens
            // when the process is killed right after this.
            drop(route.worker);
        }
    }
}
