//! Plugin lifecycle errors.
//!
//! [`PluginError`] separates fatal startup failures, which disable a plugin,
//! from in-place failures such as a lost connection. Use
//! [`PluginError::is_fatal`] to decide which UI treatment applies.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::capability::CapabilityError;
use crate::descriptor::Capability;
use crate::handshake::HandshakeError;
use crate::rpc::RpcError;

/// Errors arising from plugin discovery, launch and capability dispensing.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin with this ID is registered.
    #[error("plugin '{id}' not found in registry")]
    NotFound {
        /// ID that was looked up.
        id: String,
    },

    /// A plugin with this ID is already registered.
    #[error("plugin '{id}' is already registered")]
    Duplicate {
        /// Conflicting ID.
        id: String,
    },

    /// The plugin binary does not exist.
    #[error("plugin '{id}' not found: no binary at {}", .path.display())]
    BinaryNotFound {
        /// Plugin ID.
        id: String,
        /// Path that was checked.
        path: PathBuf,
    },

    /// The plugin binary exists but lacks execute permission.
    #[error("plugin '{id}' binary is not executable: {}", .path.display())]
    NotExecutable {
        /// Plugin ID.
        id: String,
        /// Path that was checked.
        path: PathBuf,
    },

    /// The plugin process could not be spawned.
    #[error("plugin '{id}' failed to start: {message}")]
    SpawnFailed {
        /// Plugin ID.
        id: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The handshake completed but did not match.
    #[error("plugin handshake failed for '{id}': {reason}{}", diagnostic_suffix(.diagnostic))]
    HandshakeFailed {
        /// Plugin ID.
        id: String,
        /// What did not match.
        #[source]
        reason: HandshakeError,
        /// Captured plugin stderr.
        diagnostic: String,
    },

    /// The plugin did not complete the handshake in time.
    #[error("plugin '{id}' handshake timed out after {timeout_ms}ms{}", diagnostic_suffix(.diagnostic))]
    HandshakeTimeout {
        /// Plugin ID.
        id: String,
        /// Configured budget.
        timeout_ms: u64,
        /// Captured plugin stderr.
        diagnostic: String,
    },

    /// The plugin does not serve a capability the host tried to dispense.
    #[error("shared interface violation: plugin '{id}' does not serve the {capability} capability")]
    InterfaceViolation {
        /// Plugin ID.
        id: String,
        /// Requested capability.
        capability: Capability,
    },

    /// A capability could not be registered or dispensed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// The plugin is registered but has no running process.
    #[error("plugin '{id}' is not running")]
    NotRunning {
        /// Plugin ID.
        id: String,
    },

    /// A plugin descriptor failed to load or validate.
    #[error("descriptor error: {message}")]
    Descriptor {
        /// Description of the validation failure.
        message: String,
    },

    /// A transport failure after the plugin was activated.
    #[error("plugin '{id}' transport error: {source}")]
    Rpc {
        /// Plugin ID.
        id: String,
        /// Underlying RPC error.
        #[source]
        source: RpcError,
    },
}

impl PluginError {
    /// Returns `true` for startup failures that must disable the plugin and
    /// must not be retried.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BinaryNotFound { .. }
                | Self::NotExecutable { .. }
                | Self::SpawnFailed { .. }
                | Self::HandshakeFailed { .. }
                | Self::HandshakeTimeout { .. }
                | Self::InterfaceViolation { .. }
        )
    }
}

fn diagnostic_suffix(diagnostic: &str) -> String {
    if diagnostic.trim().is_empty() {
        String::new()
    } else {
        format!(" (plugin stderr: {})", diagnostic.trim())
    }
}

#[cfg(test)]
mod tests;
