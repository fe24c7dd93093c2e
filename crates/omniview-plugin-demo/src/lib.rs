//! An Omniview plugin that serves every capability.
//!
//! It backs the resource capability with an in-memory [`Inventory`] per
//! connection, runs exec sessions on native pseudo-terminals, forwards
//! ports to its own loopback and exposes a `greet` command whose wording
//! comes from the `greeting` setting. It exists to exercise the host end to
//! end and as a starting point for real plugins.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use omniview_plugins::controller::{ConnectedClient, ConnectionManager};
use omniview_plugins::exec::NativePtyBackend;
use omniview_plugins::settings::{SettingDefinition, SettingKind, SettingsError};
use omniview_plugins::{
    CapabilityError, CapabilityImpl, CommandRouter, Connection, PluginContext, PluginHandle,
    PortForwardManager, ResourceController, RpcStatus, SessionManager, SettingsStore,
    register_plugin,
};

mod forward;
mod inventory;

pub use forward::LoopbackForwarder;
pub use inventory::{DEFAULT_NAMESPACE, Inventory, ItemResourcer, item_definition, item_meta};

/// Plugin ID announced in the handshake.
pub const PLUGIN_ID: &str = "demo";

/// Connection every demo request runs against.
pub const LOCAL_CONNECTION: &str = "local";

/// Why the plugin could not be assembled.
#[derive(Debug, Error)]
pub enum DemoError {
    /// A setting definition was rejected.
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// A capability could not be registered.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

fn settings() -> Result<SettingsStore, SettingsError> {
    SettingsStore::new([
        SettingDefinition::new("greeting", "Greeting", SettingKind::Text, json!("hello"))
            .with_description("Word used by the greet command"),
    ])
}

fn commands() -> CommandRouter {
    CommandRouter::new()
        .with_command("greet", |ctx: &PluginContext, payload: Value| {
            let greeting = ctx
                .settings()
                .and_then(|settings| settings.value("greeting"))
                .and_then(|value| value.as_str().map(str::to_owned))
                .unwrap_or_else(|| String::from("hello"));
            let name = payload
                .as_str()
                .map_or_else(|| ctx.requester_id().to_owned(), str::to_owned);
            Ok(json!(format!("{greeting} {name}")))
        })
        .with_command("echo", |_ctx: &PluginContext, payload: Value| Ok(payload))
}

fn resources() -> ResourceController {
    let connections = ConnectionManager::new(
        |_ctx: &PluginContext| -> Result<Vec<Connection>, RpcStatus> {
            let mut connection = Connection::new(LOCAL_CONNECTION, "Local inventory");
            connection
                .labels
                .insert(String::from("kind"), String::from("in-memory"));
            Ok(vec![connection])
        },
        |_ctx: &PluginContext, connection: &Connection| -> Result<ConnectedClient, RpcStatus> {
            Ok(ConnectedClient::new(Inventory::seeded(&connection.id)))
        },
    );
    let controller = ResourceController::new(Arc::new(connections));
    controller.register(item_meta(), item_definition(), ItemResourcer);
    controller
}

/// Builds the demo plugin with every capability registered.
///
/// # Errors
///
/// [`DemoError`] when a built-in definition is rejected.
pub fn plugin_handle() -> Result<PluginHandle, DemoError> {
    let mut handle = PluginHandle::new(PLUGIN_ID, env!("CARGO_PKG_VERSION"));
    let item_key = item_meta().key();
    let implementations = [
        CapabilityImpl::Settings(Arc::new(settings()?)),
        CapabilityImpl::Command(Arc::new(commands())),
        CapabilityImpl::Resource(Arc::new(resources())),
        CapabilityImpl::Exec(Arc::new(SessionManager::new(Arc::new(NativePtyBackend)))),
        CapabilityImpl::Networker(Arc::new(
            PortForwardManager::new().with_forwarder(Arc::new(LoopbackForwarder::new(item_key))),
        )),
    ];
    for implementation in implementations {
        register_plugin(Some(&mut handle), implementation)?;
    }
    Ok(handle)
}
