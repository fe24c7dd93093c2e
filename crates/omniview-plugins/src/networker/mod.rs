//! Port forwarding from a local TCP port to a resource.
//!
//! A plugin registers one [`PortForwarder`] per resource type. Starting a
//! session binds a loopback listener; every accepted connection is dialled
//! through the forwarder and piped in both directions on its own threads
//! until either side closes or the session is closed.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::PluginContext;
use crate::lifetime::CancellationToken;
use crate::rpc::RpcStatus;

/// Log target for port forwarding.
pub(crate) const NETWORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::networker");

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A resource type that can be forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardTarget {
    /// Resource type key.
    pub resource_key: String,
    /// Action label.
    pub label: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
}

/// Request to start forwarding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortForwardOptions {
    /// Resource type key.
    pub resource_key: String,
    /// Resource instance ID.
    pub resource_id: String,
    /// The resource instance as returned by the resource capability.
    #[serde(default)]
    pub resource_data: Value,
    /// Port on the resource.
    pub remote_port: u16,
    /// Loopback port to listen on; `None` picks a free port.
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A running forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardSession {
    /// Generated session ID.
    pub id: String,
    /// Resource type key.
    pub resource_key: String,
    /// Resource instance ID.
    pub resource_id: String,
    /// Connection the session was started under, if any.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Bound loopback port.
    pub local_port: u16,
    /// Port on the resource.
    pub remote_port: u16,
    /// Labels supplied at start.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Start time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Filter for [`PortForwardManager::find`]; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindPortForwardSessions {
    /// Match this resource instance.
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Match this connection.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Every label must be present with the same value.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl FindPortForwardSessions {
    fn matches(&self, session: &PortForwardSession) -> bool {
        self.resource_id
            .as_ref()
            .is_none_or(|id| *id == session.resource_id)
            && self
                .connection_id
                .as_ref()
                .is_none_or(|id| session.connection_id.as_ref() == Some(id))
            && self
                .labels
                .iter()
                .all(|(key, value)| session.labels.get(key) == Some(value))
    }
}

/// Both halves of a dialled upstream connection.
pub type Upstream = (Box<dyn Read + Send>, Box<dyn Write + Send>);

/// Connects to one resource type.
pub trait PortForwarder: Send + Sync {
    /// Describes the target.
    fn target(&self) -> PortForwardTarget;

    /// Opens one upstream connection to `options.remote_port` on the
    /// resource. Called once per accepted local connection.
    ///
    /// # Errors
    ///
    /// The status explaining why the resource cannot be reached.
    fn dial(&self, ctx: &PluginContext, options: &PortForwardOptions) -> Result<Upstream, RpcStatus>;
}

/// Port forwarding failures.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    /// No session has this ID.
    #[error("port-forward session '{id}' not found")]
    SessionNotFound {
        /// Requested ID.
        id: String,
    },
    /// No forwarder serves the resource type.
    #[error("no port forwarder for resource type '{resource_key}'")]
    NoForwarder {
        /// Requested resource type.
        resource_key: String,
    },
    /// The local listener could not be bound.
    #[error("cannot listen on local port {port}: {source}")]
    Bind {
        /// Requested port, 0 for any.
        port: u16,
        /// Socket error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The accept thread could not be started.
    #[error("cannot start port-forward thread: {0}")]
    Thread(#[source] Arc<io::Error>),
}

impl From<ForwardError> for RpcStatus {
    fn from(error: ForwardError) -> Self {
        match error {
            ForwardError::SessionNotFound { .. } | ForwardError::NoForwarder { .. } => {
                Self::not_found(error.to_string())
            }
            ForwardError::Bind { .. } => Self::failed_precondition(error.to_string()),
            ForwardError::Thread(_) => Self::unavailable(error.to_string()),
        }
    }
}

/// The networker capability.
pub trait NetworkerProvider: Send + Sync {
    /// Resource types that can be forwarded to.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn supported_targets(&self, ctx: &PluginContext) -> Result<Vec<PortForwardTarget>, RpcStatus>;

    /// Starts forwarding.
    ///
    /// # Errors
    ///
    /// `not_found` without a forwarder, `failed_precondition` when the local
    /// port is taken.
    fn start_session(&self, ctx: &PluginContext, options: PortForwardOptions) -> Result<PortForwardSession, RpcStatus>;

    /// Every running forward.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn list_sessions(&self, ctx: &PluginContext) -> Result<Vec<PortForwardSession>, RpcStatus>;

    /// Running forwards matching `filter`.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn find_sessions(
        &self,
        ctx: &PluginContext,
        filter: &FindPortForwardSessions,
    ) -> Result<Vec<PortForwardSession>, RpcStatus>;

    /// Stops a forward and returns its final state.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions.
    fn close_session(&self, ctx: &PluginContext, id: &str) -> Result<PortForwardSession, RpcStatus>;
}

struct ForwardEntry {
    session: PortForwardSession,
    lifetime: CancellationToken,
    acceptor: JoinHandle<()>,
}

/// Owns every running port forward of a plugin.
#[derive(Default)]
pub struct PortForwardManager {
    forwarders: BTreeMap<String, Arc<dyn PortForwarder>>,
    sessions: Mutex<HashMap<String, ForwardEntry>>,
}

impl PortForwardManager {
    /// Creates a manager with no forwarders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a forwarder under its resource key.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: Arc<dyn PortForwarder>) -> Self {
        self.forwarders
            .insert(forwarder.target().resource_key, forwarder);
        self
    }

    /// Forwardable resource types, sorted by key.
    #[must_use]
    pub fn targets(&self) -> Vec<PortForwardTarget> {
        self.forwarders.values().map(|forwarder| forwarder.target()).collect()
    }

    /// Binds the local port and starts accepting.
    ///
    /// # Errors
    ///
    /// See [`ForwardError`].
    pub fn start(&self, ctx: &PluginContext, options: PortForwardOptions) -> Result<PortForwardSession, ForwardError> {
        let forwarder = self
            .forwarders
            .get(&options.resource_key)
            .cloned()
            .ok_or_else(|| ForwardError::NoForwarder {
                resource_key: options.resource_key.clone(),
            })?;
        let requested = options.local_port.unwrap_or(0);
        let bind_error = |source: io::Error| ForwardError::Bind {
            port: requested,
            source: Arc::new(source),
        };
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, requested)))
            .map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_port = listener.local_addr().map_err(bind_error)?.port();

        let id = Uuid::new_v4().to_string();
        let session = PortForwardSession {
            id: id.clone(),
            resource_key: options.resource_key.clone(),
            resource_id: options.resource_id.clone(),
            connection_id: ctx.connection().map(|connection| connection.id.clone()),
            local_port,
            remote_port: options.remote_port,
            labels: options.labels.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        let lifetime = CancellationToken::new();
        let acceptor = Acceptor {
            session_id: id.clone(),
            listener,
            forwarder,
            ctx: ctx.detached(),
            options,
            lifetime: lifetime.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("omniview-forward-{local_port}"))
            .spawn(move || acceptor.run())
            .map_err(|err| ForwardError::Thread(Arc::new(err)))?;

        info!(
            target: NETWORKER_TARGET,
            session = %id,
            local_port,
            remote_port = session.remote_port,
            resource = %session.resource_id,
            "port forward started"
        );
        self.sessions().insert(
            id,
            ForwardEntry {
                session: session.clone(),
                lifetime,
                acceptor: handle,
            },
        );
        Ok(session)
    }

    /// Running sessions, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<PortForwardSession> {
        self.find(&FindPortForwardSessions::default())
    }

    /// Running sessions matching `filter`, oldest first.
    #[must_use]
    pub fn find(&self, filter: &FindPortForwardSessions) -> Vec<PortForwardSession> {
        let mut sessions: Vec<_> = self
            .sessions()
            .values()
            .map(|entry| &entry.session)
            .filter(|session| filter.matches(session))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Stops accepting, disconnects open connections and forgets the
    /// session.
    ///
    /// # Errors
    ///
    /// [`ForwardError::SessionNotFound`].
    pub fn close(&self, id: &str) -> Result<PortForwardSession, ForwardError> {
        let entry = self
            .sessions()
            .remove(id)
            .ok_or_else(|| ForwardError::SessionNotFound { id: id.to_owned() })?;
        entry.lifetime.cancel();
        if entry.acceptor.join().is_err() {
            warn!(target: NETWORKER_TARGET, session = id, "port-forward thread panicked");
        }
        info!(target: NETWORKER_TARGET, session = id, "port forward closed");
        Ok(entry.session)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, ForwardEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for PortForwardManager {
    fn drop(&mut self) {
        let ids: Vec<_> = self.sessions().keys().cloned().collect();
        for id in ids {
            drop(self.close(&id));
        }
    }
}

impl NetworkerProvider for PortForwardManager {
    fn supported_targets(&self, _ctx: &PluginContext) -> Result<Vec<PortForwardTarget>, RpcStatus> {
        Ok(self.targets())
    }

    fn start_session(&self, ctx: &PluginContext, options: PortForwardOptions) -> Result<PortForwardSession, RpcStatus> {
        Ok(self.start(ctx, options)?)
    }

    fn list_sessions(&self, _ctx: &PluginContext) -> Result<Vec<PortForwardSession>, RpcStatus> {
        Ok(self.list())
    }

    fn find_sessions(
        &self,
        _ctx: &PluginContext,
        filter: &FindPortForwardSessions,
    ) -> Result<Vec<PortForwardSession>, RpcStatus> {
        Ok(self.find(filter))
    }

    fn close_session(&self, _ctx: &PluginContext, id: &str) -> Result<PortForwardSession, RpcStatus> {
        Ok(self.close(id)?)
    }
}

struct Acceptor {
    session_id: String,
    listener: TcpListener,
    forwarder: Arc<dyn PortForwarder>,
    ctx: PluginContext,
    options: PortForwardOptions,
    lifetime: CancellationToken,
}

impl Acceptor {
    fn run(self) {
        let mut open: Vec<TcpStream> = Vec::new();
        while !self.lifetime.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(target: NETWORKER_TARGET, session = %self.session_id, %peer, "connection accepted");
                    match self.connect(stream) {
                        Ok(handle) => open.push(handle),
                        Err(error) => warn!(
                            target: NETWORKER_TARGET,
                            session = %self.session_id,
                            %error,
                            "failed to forward connection"
                        ),
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    drop(self.lifetime.wait_timeout(ACCEPT_POLL));
                }
                Err(error) => {
                    warn!(target: NETWORKER_TARGET, session = %self.session_id, %error, "accept failed");
                    drop(self.lifetime.wait_timeout(ACCEPT_POLL));
                }
            }
        }
        for stream in open {
            drop(stream.shutdown(Shutdown::Both));
        }
    }

    /// Dials upstream and starts both pipes; returns a handle for shutdown.
    fn connect(&self, stream: TcpStream) -> Result<TcpStream, RpcStatus> {
        let io_status = |err: io::Error| RpcStatus::internal(err.to_string());
        stream.set_nonblocking(false).map_err(io_status)?;
        let (mut upstream_read, mut upstream_write) = self.forwarder.dial(&self.ctx, &self.options)?;
        let mut local_read = stream.try_clone().map_err(io_status)?;
        let mut local_write = stream.try_clone().map_err(io_status)?;

        let session = self.session_id.clone();
        thread::Builder::new()
            .name(String::from("omniview-forward-up"))
            .spawn(move || {
                if let Err(error) = io::copy(&mut local_read, &mut upstream_write) {
                    debug!(target: NETWORKER_TARGET, %session, %error, "local to upstream pipe ended");
                }
                drop(upstream_write);
                drop(local_read.shutdown(Shutdown::Read));
            })
            .map_err(io_status)?;
        let session_down = self.session_id.clone();
        thread::Builder::new()
            .name(String::from("omniview-forward-down"))
            .spawn(move || {
                if let Err(error) = io::copy(&mut upstream_read, &mut local_write) {
                    debug!(target: NETWORKER_TARGET, session = %session_down, %error, "upstream to local pipe ended");
                }
                drop(local_write.shutdown(Shutdown::Write));
            })
            .map_err(io_status)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests;
