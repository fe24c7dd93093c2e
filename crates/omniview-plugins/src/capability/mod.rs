//! Capability registration and the RPC shims for each capability.
//!
//! Every capability comes as a pair: a server shim wrapping the in-process
//! implementation as an RPC [`Service`], and a client shim implementing the
//! same trait over an [`RpcClient`]. A plugin collects its implementations
//! in a [`PluginHandle`] with [`register_plugin`]; the host dispenses client
//! shims through [`CapabilityClient`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::command::CommandProvider;
use crate::context::PluginContext;
use crate::descriptor::Capability;
use crate::exec::ExecProvider;
use crate::handshake::HandshakeConfig;
use crate::lifetime::CancellationToken;
use crate::networker::NetworkerProvider;
use crate::resource::ResourceProvider;
use crate::rpc::{CallContext, RPC_TARGET, RpcClient, RpcStatus, Service};
use crate::settings::SettingsProvider;

mod command;
mod exec;
mod networker;
mod resource;
mod settings;

pub use command::{CommandClient, CommandServer};
pub use exec::{ExecClient, ExecServer};
pub use networker::{NetworkerClient, NetworkerServer};
pub use resource::{KeyedRequest, ResourceClient, ResourceServer};
pub use settings::{SettingsClient, SettingsServer};

/// How often stream loops re-check their stop signal.
const STREAM_POLL: Duration = Duration::from_millis(50);

/// Registration and dispensing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// A capability was registered without a plugin handle.
    #[error("cannot register the {capability} capability: plugin handle is missing")]
    MissingHandle {
        /// Capability being registered.
        capability: Capability,
    },
    /// The capability is already registered on the handle.
    #[error("the {capability} capability is already registered")]
    Duplicate {
        /// Capability being registered.
        capability: Capability,
    },
}

/// An in-process capability implementation.
#[derive(Clone)]
pub enum CapabilityImpl {
    /// Resource CRUD and connections.
    Resource(Arc<dyn ResourceProvider>),
    /// Named commands.
    Command(Arc<dyn CommandProvider>),
    /// Plugin settings.
    Settings(Arc<dyn SettingsProvider>),
    /// Terminal sessions.
    Exec(Arc<dyn ExecProvider>),
    /// Port forwarding.
    Networker(Arc<dyn NetworkerProvider>),
}

impl CapabilityImpl {
    /// Capability this implementation serves.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        match self {
            Self::Resource(_) => Capability::Resource,
            Self::Command(_) => Capability::Command,
            Self::Settings(_) => Capability::Settings,
            Self::Exec(_) => Capability::Exec,
            Self::Networker(_) => Capability::Networker,
        }
    }

    /// Wraps the implementation in its server shim.
    #[must_use]
    pub fn into_service(self) -> Arc<dyn Service> {
        match self {
            Self::Resource(provider) => Arc::new(ResourceServer::new(provider)),
            Self::Command(provider) => Arc::new(CommandServer::new(provider)),
            Self::Settings(provider) => Arc::new(SettingsServer::new(provider)),
            Self::Exec(provider) => Arc::new(ExecServer::new(provider)),
            Self::Networker(provider) => Arc::new(NetworkerServer::new(provider)),
        }
    }
}

/// A plugin's identity and the capabilities it serves.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use omniview_plugins::{Capability, CapabilityImpl, CommandRouter, PluginHandle, register_plugin};
///
/// let mut handle = PluginHandle::new("demo", "0.1.0");
/// register_plugin(Some(&mut handle), CapabilityImpl::Command(Arc::new(CommandRouter::new())))
///     .expect("first registration succeeds");
/// assert_eq!(handle.capabilities(), vec![Capability::Command]);
/// ```
pub struct PluginHandle {
    id: String,
    version: String,
    capabilities: BTreeMap<Capability, CapabilityImpl>,
}

impl PluginHandle {
    /// Creates a handle with no capabilities.
    #[must_use]
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Plugin ID.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Plugin version.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Registered capabilities, sorted.
    #[must_use]
    pub fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.keys().copied().collect()
    }

    /// The implementation registered for `capability`.
    #[must_use]
    pub fn get(&self, capability: Capability) -> Option<&CapabilityImpl> {
        self.capabilities.get(&capability)
    }

    /// Handshake this plugin answers with.
    #[must_use]
    pub fn handshake(&self) -> HandshakeConfig {
        HandshakeConfig::for_plugin(&self.id, &self.version)
    }

    /// Server shims keyed by their well-known service name.
    #[must_use]
    pub fn services(&self) -> Vec<(&'static str, Arc<dyn Service>)> {
        self.capabilities
            .iter()
            .map(|(capability, implementation)| (capability.as_str(), implementation.clone().into_service()))
            .collect()
    }
}

/// Stores `implementation` on the plugin handle under its capability key.
///
/// # Errors
///
/// [`CapabilityError::MissingHandle`] without a handle and
/// [`CapabilityError::Duplicate`] when the capability is already present.
pub fn register_plugin(
    handle: Option<&mut PluginHandle>,
    implementation: CapabilityImpl,
) -> Result<(), CapabilityError> {
    let capability = implementation.capability();
    let Some(plugin) = handle else {
        return Err(CapabilityError::MissingHandle { capability });
    };
    if plugin.capabilities.contains_key(&capability) {
        return Err(CapabilityError::Duplicate { capability });
    }
    plugin.capabilities.insert(capability, implementation);
    Ok(())
}

/// A client shim the host can dispense for a running plugin.
pub trait CapabilityClient: Sized {
    /// Capability the shim speaks.
    const CAPABILITY: Capability;

    /// Wraps a connection to the plugin.
    fn from_rpc(rpc: RpcClient) -> Self;
}

/// Verbs of methods that only read, and so may be re-issued after a timeout.
const READ_VERBS: [&str; 4] = ["Get", "List", "Find", "Has"];

/// Whether `method` starts with a read verb followed by a word boundary.
fn is_idempotent(method: &str) -> bool {
    READ_VERBS.iter().any(|verb| {
        method
            .strip_prefix(verb)
            .is_some_and(|rest| rest.chars().next().is_none_or(char::is_uppercase))
    })
}

/// Issues a unary call. Read-only methods are retried per the context's
/// request options; anything else is sent exactly once, since an attempt
/// that timed out may still have taken effect.
pub(crate) fn invoke<Req, Resp>(
    rpc: &RpcClient,
    capability: Capability,
    method: &str,
    ctx: Option<&PluginContext>,
    request: &Req,
) -> Result<Resp, RpcStatus>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    if !is_idempotent(method) {
        return rpc
            .invoke(capability.as_str(), method, ctx, request)
            .map_err(RpcStatus::from);
    }
    let options = ctx.map(|context| *context.request_options()).unwrap_or_default();
    options.retry(
        |attempt| {
            if attempt > 0 {
                debug!(
                    target: RPC_TARGET,
                    service = capability.as_str(),
                    method,
                    attempt,
                    "retrying call"
                );
            }
            rpc.invoke(capability.as_str(), method, ctx, request)
                .map_err(RpcStatus::from)
        },
        RpcStatus::is_retryable,
    )
}

/// The caller's context, or an anonymous one for calls that do not need
/// connection scope.
fn context_or_anonymous(call: &CallContext) -> PluginContext {
    call.plugin_context().cloned().unwrap_or_else(|| {
        PluginContext::new("anonymous").with_lifetime(call.lifetime().clone())
    })
}

/// Feeds inbound stream messages to `on_message` on a helper thread and
/// returns a token cancelled once the client half-closes.
fn watch_inbound<F>(inbound: Receiver<Value>, mut on_message: F) -> Result<CancellationToken, RpcStatus>
where
    F: FnMut(Value) + Send + 'static,
{
    let closed = CancellationToken::new();
    let signal = closed.clone();
    thread::Builder::new()
        .name(String::from("omniview-stream-inbound"))
        .spawn(move || {
            while let Ok(message) = inbound.recv() {
                on_message(message);
            }
            signal.cancel();
        })
        .map_err(|err| RpcStatus::unavailable(format!("cannot watch stream input: {err}")))?;
    Ok(closed)
}
