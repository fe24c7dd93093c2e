//! Out-of-process plugin host and plugin SDK for Omniview.
//!
//! Plugins are independently built binaries. The host discovers them in its
//! plugins directory, launches each as a child process, verifies a cookie
//! handshake and then talks to it over one multiplexed RPC connection on the
//! child's standard I/O. Plugins use the same crate to serve their
//! capabilities.
//!
//! # Architecture
//!
//! - [`launcher`] and [`registry`] start, track and stop plugin processes.
//! - [`rpc`] frames unary calls and bidirectional streams; every call passes
//!   through the [`interceptor`] chain (panic recovery, logging, context).
//! - [`context`] carries the per-request [`PluginContext`] across the wire
//!   under the `plugin_context` metadata key.
//! - [`capability`] pairs a server and a client shim for each capability:
//!   [`resource`], [`command`], [`settings`], [`exec`] and [`networker`].
//! - [`controller`] dispatches typed resource operations and [`informer`]
//!   turns backend watches into resource events.
//! - [`serve()`] is the plugin-side entry point.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use omniview_plugins::{CommandClient, Launcher, PluginRegistry};
//!
//! let mut registry = PluginRegistry::new(Launcher::default());
//! registry.discover(Path::new("/opt/omniview/plugins")).expect("scan plugins");
//! let failures = registry.start_enabled();
//! assert!(failures.iter().all(|failure| failure.is_fatal()));
//! let _commands = registry.dispense::<CommandClient>("kubernetes");
//! ```

pub mod capability;
pub mod command;
pub mod context;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod exec;
pub mod handshake;
pub mod informer;
pub mod interceptor;
pub mod launcher;
pub mod lifetime;
pub mod networker;
pub mod registry;
pub mod resource;
pub mod rpc;
pub mod serve;
pub mod settings;
pub mod value;

pub use self::capability::{
    CapabilityClient, CapabilityError, CapabilityImpl, CommandClient, ExecClient, NetworkerClient,
    PluginHandle, ResourceClient, SettingsClient, register_plugin,
};
pub use self::command::{CommandProvider, CommandRouter};
pub use self::context::{Connection, PLUGIN_CONTEXT_KEY, PluginContext, RequestOptions, ResourceContext};
pub use self::controller::{DispatchError, ResourceController, Resourcer};
pub use self::descriptor::{Capability, LifecycleFlags, PluginDescriptor};
pub use self::error::PluginError;
pub use self::exec::{ExecProvider, SessionManager};
pub use self::handshake::{HandshakeConfig, HandshakeError};
pub use self::informer::{EventBridge, InformerState, WatchSource};
pub use self::launcher::{Launcher, PluginProcess};
pub use self::lifetime::CancellationToken;
pub use self::networker::{NetworkerProvider, PortForwardManager};
pub use self::registry::PluginRegistry;
pub use self::resource::{ResourceEvent, ResourceProvider};
pub use self::rpc::{RpcClient, RpcServer, RpcStatus, StatusCode};
pub use self::serve::{PluginServeConfig, ServeError, serve};
pub use self::settings::{SettingsProvider, SettingsStore};
pub use self::value::OpaqueValue;
