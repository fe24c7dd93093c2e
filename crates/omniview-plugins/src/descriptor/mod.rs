//! Plugin descriptors: identity, capabilities and lifecycle flags.
//!
//! A [`PluginDescriptor`] is created when the host scans its plugins
//! directory. Each installed plugin lives in `<plugins_dir>/<id>/` with a
//! `plugin.json` describing it and the binary alongside.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// File name of the descriptor inside a plugin directory.
pub const DESCRIPTOR_FILE: &str = "plugin.json";

/// A named RPC service a plugin may implement.
///
/// # Example
///
/// ```
/// use omniview_plugins::Capability;
///
/// assert_eq!(Capability::Resource.as_str(), "resource");
/// assert_eq!("exec".parse::<Capability>().ok(), Some(Capability::Exec));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// CRUD operations over resource types.
    Resource,
    /// Named commands with opaque payloads.
    Command,
    /// Plugin-scoped settings.
    Settings,
    /// Interactive terminal sessions.
    Exec,
    /// Port forwarding.
    Networker,
    /// Log streaming.
    Log,
    /// Metric collection.
    Metric,
    /// Remote filesystem access.
    Filesystem,
    /// Diagnostic reporting.
    Reporter,
    /// UI contributions.
    Ui,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Resource,
        Self::Command,
        Self::Settings,
        Self::Exec,
        Self::Networker,
        Self::Log,
        Self::Metric,
        Self::Filesystem,
        Self::Reporter,
        Self::Ui,
    ];

    /// Well-known key used for service lookup.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Command => "command",
            Self::Settings => "settings",
            Self::Exec => "exec",
            Self::Networker => "networker",
            Self::Log => "log",
            Self::Metric => "metric",
            Self::Filesystem => "filesystem",
            Self::Reporter => "reporter",
            Self::Ui => "ui",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|capability| capability.as_str() == s)
            .ok_or_else(|| PluginError::Descriptor {
                message: format!("unknown capability '{s}'"),
            })
    }
}

/// Lifecycle flags tracked by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleFlags {
    /// The user has enabled the plugin.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// A process for the plugin is currently running.
    #[serde(default, skip_serializing)]
    pub running: bool,
    /// The plugin is loaded from a development build.
    #[serde(default)]
    pub dev_mode: bool,
}

const fn enabled_by_default() -> bool {
    true
}

/// Identity, capabilities and location of an installed plugin.
///
/// # Example
///
/// ```
/// use omniview_plugins::{Capability, PluginDescriptor};
/// use std::path::PathBuf;
///
/// let descriptor = PluginDescriptor::new("kubernetes", "0.4.1", PathBuf::from("/opt/kube/plugin"))
///     .with_capabilities(vec![Capability::Resource, Capability::Exec]);
/// assert!(descriptor.validate().is_ok());
/// assert!(descriptor.supports(Capability::Exec));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    id: String,
    version: String,
    #[serde(default)]
    capabilities: Vec<Capability>,
    binary: PathBuf,
    #[serde(flatten)]
    flags: LifecycleFlags,
}

impl PluginDescriptor {
    /// Creates an enabled descriptor with no declared capabilities.
    #[must_use]
    pub fn new(id: impl Into<String>, version: impl Into<String>, binary: PathBuf) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            capabilities: Vec::new(),
            binary,
            flags: LifecycleFlags {
                enabled: true,
                running: false,
                dev_mode: false,
            },
        }
    }

    /// Declares the capability set.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Marks the descriptor as a development build.
    #[must_use]
    pub const fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.flags.dev_mode = dev_mode;
        self
    }

    /// Reads `plugin.json` from `dir`, resolving a relative binary path
    /// against the directory.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Descriptor`] if the file is missing, not valid
    /// JSON, or fails [`PluginDescriptor::validate`].
    pub fn load(dir: &Path) -> Result<Self, PluginError> {
        let path = dir.join(DESCRIPTOR_FILE);
        let text = std::fs::read_to_string(&path).map_err(|err| PluginError::Descriptor {
            message: format!("cannot read '{}': {err}", path.display()),
        })?;
        let mut descriptor: Self =
            serde_json::from_str(&text).map_err(|err| PluginError::Descriptor {
                message: format!("invalid descriptor '{}': {err}", path.display()),
            })?;
        if descriptor.binary.is_relative() {
            descriptor.binary = dir.join(&descriptor.binary);
        }
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validates identity and binary location.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Descriptor`] if the ID is empty or contains
    /// path separators, the version is not `major.minor.patch`, or the
    /// binary path is not absolute.
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::Descriptor {
                message: String::from("plugin id must not be empty"),
            });
        }
        if self.id.contains(['/', '\\']) {
            return Err(PluginError::Descriptor {
                message: format!("plugin id '{}' must not contain path separators", self.id),
            });
        }
        if !is_semver(&self.version) {
            return Err(PluginError::Descriptor {
                message: format!(
                    "plugin '{}' version '{}' is not a semantic version",
                    self.id, self.version
                ),
            });
        }
        if !self.binary.is_absolute() {
            return Err(PluginError::Descriptor {
                message: format!(
                    "plugin binary must be an absolute path, got '{}'",
                    self.binary.display()
                ),
            });
        }
        Ok(())
    }

    /// Plugin ID.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Semantic version string.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Whether `capability` is declared.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Absolute path to the plugin binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Lifecycle flags.
    #[must_use]
    pub const fn flags(&self) -> LifecycleFlags {
        self.flags
    }

    /// Enables or disables the plugin.
    pub const fn set_enabled(&mut self, enabled: bool) {
        self.flags.enabled = enabled;
    }

    /// Records whether a process is running for the plugin.
    pub const fn set_running(&mut self, running: bool) {
        self.flags.running = running;
    }
}

/// Accepts `major.minor.patch` with an optional `-pre` or `+build` suffix.
fn is_semver(version: &str) -> bool {
    let core = version
        .split_once(['-', '+'])
        .map_or(version, |(core, _)| core);
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests;
