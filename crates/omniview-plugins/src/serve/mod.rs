//! Plugin-side entry point.
//!
//! A plugin binary builds a [`PluginHandle`], registers its capabilities and
//! hands it to [`serve`]. Stdout belongs to the protocol once `serve` starts:
//! plugins must log to stderr, which the host forwards to its own logs.

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::capability::{CapabilityImpl, PluginHandle};
use crate::descriptor::Capability;
use crate::handshake::HandshakeError;
use crate::interceptor::InterceptorChain;
use crate::rpc::{Frame, FrameReader, RpcError, RpcServer, shared_writer, write_shared};
use crate::settings::SettingsProvider;

const SERVE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::serve");

/// Why a plugin stopped serving.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The process was not launched by a host expecting this plugin.
    #[error("refusing to serve: {0}")]
    Handshake(#[from] HandshakeError),
    /// The connection to the host failed.
    #[error(transparent)]
    Transport(#[from] RpcError),
}

/// What a plugin serves.
pub struct PluginServeConfig {
    handle: PluginHandle,
    settings: Option<Arc<dyn SettingsProvider>>,
}

impl PluginServeConfig {
    /// Serves every capability registered on `handle`. A registered settings
    /// capability is also attached to each inbound plugin context.
    #[must_use]
    pub fn new(handle: PluginHandle) -> Self {
        let settings = match handle.get(Capability::Settings) {
            Some(CapabilityImpl::Settings(provider)) => Some(Arc::clone(provider)),
            _ => None,
        };
        Self { handle, settings }
    }

    /// Overrides the settings provider attached to inbound contexts.
    #[must_use]
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// The plugin being served.
    #[must_use]
    pub const fn handle(&self) -> &PluginHandle {
        &self.handle
    }
}

/// Serves the plugin over stdio until the host disconnects.
///
/// # Errors
///
/// [`ServeError::Handshake`] when the environment cookie is missing or
/// wrong, [`ServeError::Transport`] when the connection fails.
pub fn serve(config: PluginServeConfig) -> Result<(), ServeError> {
    serve_with(config, |key| std::env::var(key).ok(), io::stdin(), io::stdout())
}

/// [`serve`] over arbitrary streams and environment lookup.
///
/// # Errors
///
/// As for [`serve`].
pub fn serve_with<F, R, W>(config: PluginServeConfig, lookup: F, reader: R, writer: W) -> Result<(), ServeError>
where
    F: Fn(&str) -> Option<String>,
    R: Read,
    W: Write + Send + 'static,
{
    let handshake = config.handle.handshake();
    handshake.check_environment(lookup)?;

    let output = shared_writer(writer);
    let capabilities = config.handle.capabilities();
    write_shared(&output, &Frame::Handshake(handshake.frame(capabilities.clone())))?;

    let mut server = RpcServer::new(InterceptorChain::standard(config.settings));
    for (name, service) in config.handle.services() {
        server.register(name, service);
    }
    info!(
        target: SERVE_TARGET,
        plugin = config.handle.id(),
        version = config.handle.version(),
        ?capabilities,
        "serving plugin"
    );
    server.serve_framed(FrameReader::new(reader), output)?;
    info!(target: SERVE_TARGET, plugin = config.handle.id(), "host disconnected");
    Ok(())
}
