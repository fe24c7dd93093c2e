//! The host's registry of installed plugins and their processes.
//!
//! [`PluginRegistry`] is an explicit object owned by the host rather than a
//! global map. It discovers descriptors under the plugins directory, starts
//! and stops processes through a [`Launcher`], and dispenses capability
//! clients for running plugins.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::capability::CapabilityClient;
use crate::descriptor::{DESCRIPTOR_FILE, PluginDescriptor};
use crate::error::PluginError;
use crate::launcher::{LAUNCHER_TARGET, Launcher, PluginProcess};

struct Entry {
    descriptor: PluginDescriptor,
    process: Option<PluginProcess>,
}

/// Installed plugins keyed by ID.
///
/// # Example
///
/// ```
/// use omniview_plugins::{Launcher, PluginDescriptor, PluginRegistry};
/// use std::path::PathBuf;
///
/// let mut registry = PluginRegistry::new(Launcher::default());
/// registry
///     .register(PluginDescriptor::new("kubernetes", "0.4.1", PathBuf::from("/opt/kube/plugin")))
///     .expect("registration succeeds");
/// assert!(registry.get("kubernetes").is_some());
/// assert!(!registry.is_running("kubernetes"));
/// ```
pub struct PluginRegistry {
    launcher: Launcher,
    plugins: BTreeMap<String, Entry>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            plugins: BTreeMap::new(),
        }
    }

    /// Loads every `<dir>/<id>/plugin.json`. Invalid or duplicate
    /// descriptors are logged and skipped; a missing directory yields no
    /// plugins.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Descriptor`] if `dir` exists but cannot be
    /// read.
    pub fn discover(&mut self, dir: &Path) -> Result<Vec<String>, PluginError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(target: LAUNCHER_TARGET, dir = %dir.display(), "plugins directory does not exist");
                return Ok(Vec::new());
            }
            Err(error) => {
                return Err(PluginError::Descriptor {
                    message: format!("cannot read plugins directory '{}': {error}", dir.display()),
                });
            }
        };

        let mut candidates: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.join(DESCRIPTOR_FILE).is_file())
            .collect();
        candidates.sort();

        let mut discovered = Vec::new();
        for plugin_dir in candidates {
            let registered = PluginDescriptor::load(&plugin_dir).and_then(|descriptor| {
                let id = descriptor.id().to_owned();
                self.register(descriptor).map(|()| id)
            });
            match registered {
                Ok(id) => discovered.push(id),
                Err(error) => warn!(
                    target: LAUNCHER_TARGET,
                    dir = %plugin_dir.display(),
                    %error,
                    "skipping plugin"
                ),
            }
        }
        info!(target: LAUNCHER_TARGET, count = discovered.len(), "plugins discovered");
        Ok(discovered)
    }

    /// Adds a validated descriptor.
    ///
    /// # Errors
    ///
    /// [`PluginError::Descriptor`] if validation fails and
    /// [`PluginError::Duplicate`] if the ID is taken.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), PluginError> {
        descriptor.validate()?;
        let id = descriptor.id().to_owned();
        if self.plugins.contains_key(&id) {
            return Err(PluginError::Duplicate { id });
        }
        self.plugins.insert(
            id,
            Entry {
                descriptor,
                process: None,
            },
        );
        Ok(())
    }

    /// Stops and forgets a plugin.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for unknown IDs.
    pub fn remove(&mut self, id: &str) -> Result<PluginDescriptor, PluginError> {
        let mut entry = self.plugins.remove(id).ok_or_else(|| not_found(id))?;
        drop(entry.process.take());
        entry.descriptor.set_running(false);
        Ok(entry.descriptor)
    }

    /// The descriptor registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(id).map(|entry| &entry.descriptor)
    }

    /// Every descriptor, ordered by ID.
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.values().map(|entry| &entry.descriptor)
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Whether a process is running for `id`.
    #[must_use]
    pub fn is_running(&self, id: &str) -> bool {
        self.plugins
            .get(id)
            .is_some_and(|entry| entry.process.is_some())
    }

    /// Launches the plugin unless it is already running.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for unknown IDs, otherwise any launch
    /// failure.
    pub fn start(&mut self, id: &str) -> Result<(), PluginError> {
        let entry = self.plugins.get_mut(id).ok_or_else(|| not_found(id))?;
        if entry.process.is_some() {
            debug!(target: LAUNCHER_TARGET, plugin = id, "plugin already running");
            return Ok(());
        }
        let process = self.launcher.launch(&entry.descriptor)?;
        entry.process = Some(process);
        entry.descriptor.set_running(true);
        Ok(())
    }

    /// Starts every enabled plugin and returns the failures.
    pub fn start_enabled(&mut self) -> Vec<PluginError> {
        let enabled: Vec<String> = self
            .plugins
            .values()
            .filter(|entry| entry.descriptor.flags().enabled)
            .map(|entry| entry.descriptor.id().to_owned())
            .collect();
        enabled
            .iter()
            .filter_map(|id| self.start(id).err())
            .collect()
    }

    /// Kills the plugin's process, if any.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for unknown IDs.
    pub fn stop(&mut self, id: &str) -> Result<(), PluginError> {
        let entry = self.plugins.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(mut process) = entry.process.take() {
            process.kill();
        }
        entry.descriptor.set_running(false);
        Ok(())
    }

    /// Restarts the plugin with a fresh process.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::stop`] and [`PluginRegistry::start`].
    pub fn reload(&mut self, id: &str) -> Result<(), PluginError> {
        info!(target: LAUNCHER_TARGET, plugin = id, "reloading plugin");
        self.stop(id)?;
        self.start(id)
    }

    /// Enables or disables the plugin; disabling stops it.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for unknown IDs.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), PluginError> {
        if !enabled {
            self.stop(id)?;
        }
        let entry = self.plugins.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.descriptor.set_enabled(enabled);
        Ok(())
    }

    /// The running process for `id`.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] or [`PluginError::NotRunning`].
    pub fn process(&self, id: &str) -> Result<&PluginProcess, PluginError> {
        self.plugins
            .get(id)
            .ok_or_else(|| not_found(id))?
            .process
            .as_ref()
            .ok_or_else(|| PluginError::NotRunning { id: id.to_owned() })
    }

    /// A client shim for capability `C` of plugin `id`.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`], [`PluginError::NotRunning`] or
    /// [`PluginError::InterfaceViolation`].
    pub fn dispense<C: CapabilityClient>(&self, id: &str) -> Result<C, PluginError> {
        self.process(id)?.dispense::<C>()
    }

    /// Stops every running plugin.
    pub fn shutdown(&mut self) {
        for entry in self.plugins.values_mut() {
            if let Some(mut process) = entry.process.take() {
                process.kill();
            }
            entry.descriptor.set_running(false);
        }
    }
}

fn not_found(id: &str) -> PluginError {
    PluginError::NotFound { id: id.to_owned() }
}
