//! Connection bookkeeping and per-connection client caching.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::client::{ClientResolver, ConnectedClient};
use super::{CONTROLLER_TARGET, DispatchError};
use crate::context::{Connection, PluginContext};
use crate::rpc::RpcStatus;

/// Discovers the connections a plugin can operate against, e.g. by reading
/// kubeconfig contexts.
pub trait ConnectionLoader: Send + Sync {
    /// Loads every available connection.
    ///
    /// # Errors
    ///
    /// Returns the status reported to the caller of `LoadConnections`.
    fn load(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus>;
}

impl<F> ConnectionLoader for F
where
    F: Fn(&PluginContext) -> Result<Vec<Connection>, RpcStatus> + Send + Sync,
{
    fn load(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus> {
        self(ctx)
    }
}

/// Builds a backend client for one connection.
pub trait ClientFactory: Send + Sync {
    /// Creates the client. `connection` carries sensitive data when the
    /// manager knows it.
    ///
    /// # Errors
    ///
    /// Returns the status explaining why no client could be built.
    fn create(&self, ctx: &PluginContext, connection: &Connection) -> Result<ConnectedClient, RpcStatus>;
}

impl<F> ClientFactory for F
where
    F: Fn(&PluginContext, &Connection) -> Result<ConnectedClient, RpcStatus> + Send + Sync,
{
    fn create(&self, ctx: &PluginContext, connection: &Connection) -> Result<ConnectedClient, RpcStatus> {
        self(ctx, connection)
    }
}

#[derive(Default)]
struct ConnectionState {
    connections: BTreeMap<String, Connection>,
    clients: HashMap<String, ConnectedClient>,
    loaded: bool,
}

/// Tracks known connections and caches one client per connection ID.
///
/// Connections handed back to callers always have their sensitive data
/// stripped; the full record only reaches the [`ClientFactory`]. Only
/// known connections get a cached client. Before the first load a request
/// for an unknown connection is served by a one-off client built from the
/// caller's record; after it, such a request fails with
/// [`DispatchError::ConnectionNotFound`].
pub struct ConnectionManager {
    loader: Box<dyn ConnectionLoader>,
    factory: Box<dyn ClientFactory>,
    state: RwLock<ConnectionState>,
}

impl ConnectionManager {
    /// Creates a manager with no known connections.
    #[must_use]
    pub fn new(loader: impl ConnectionLoader + 'static, factory: impl ClientFactory + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            factory: Box::new(factory),
            state: RwLock::default(),
        }
    }

    /// Reloads connections from the loader, replacing the known set.
    /// Cached clients survive only for connections whose record did not
    /// change.
    ///
    /// # Errors
    ///
    /// Returns the loader's failure; the known set is unchanged then.
    pub fn load(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus> {
        let loaded = self.loader.load(ctx)?;
        let mut state = self.write();
        let previous = std::mem::take(&mut state.connections);
        for connection in loaded {
            if previous.get(&connection.id) != Some(&connection) {
                state.clients.remove(&connection.id);
            }
            state.connections.insert(connection.id.clone(), connection);
        }
        let ConnectionState {
            connections,
            clients,
            ..
        } = &mut *state;
        clients.retain(|id, _| connections.contains_key(id));
        state.loaded = true;
        debug!(
            target: CONTROLLER_TARGET,
            count = state.connections.len(),
            "connections loaded"
        );
        Ok(state.connections.values().map(Connection::redacted).collect())
    }

    /// Known connections, redacted.
    #[must_use]
    pub fn list(&self) -> Vec<Connection> {
        self.read()
            .connections
            .values()
            .map(Connection::redacted)
            .collect()
    }

    /// One known connection, redacted.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ConnectionNotFound`] for unknown IDs.
    pub fn get(&self, id: &str) -> Result<Connection, DispatchError> {
        self.read()
            .connections
            .get(id)
            .map(Connection::redacted)
            .ok_or_else(|| DispatchError::connection_not_found(id))
    }

    /// Replaces the public fields of a known connection, keeping its
    /// sensitive data, and drops its cached client.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ConnectionNotFound`] for unknown IDs.
    pub fn update(&self, mut connection: Connection) -> Result<Connection, DispatchError> {
        let mut state = self.write();
        let existing = state
            .connections
            .get(&connection.id)
            .ok_or_else(|| DispatchError::connection_not_found(&connection.id))?;
        connection.sensitive_data = existing.sensitive_data.clone();
        state.clients.remove(&connection.id);
        let redacted = connection.redacted();
        state.connections.insert(connection.id.clone(), connection);
        Ok(redacted)
    }

    /// Forgets a connection and its client.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ConnectionNotFound`] for unknown IDs.
    pub fn remove(&self, id: &str) -> Result<(), DispatchError> {
        let mut state = self.write();
        state.clients.remove(id);
        state
            .connections
            .remove(id)
            .map(drop)
            .ok_or_else(|| DispatchError::connection_not_found(id))
    }

    fn read(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.state
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.state
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl ClientResolver for ConnectionManager {
    fn resolve(&self, ctx: &PluginContext) -> Result<ConnectedClient, DispatchError> {
        let requested = ctx.connection().ok_or(DispatchError::NoConnection)?;
        let known = {
            let state = self.read();
            if let Some(client) = state.clients.get(&requested.id) {
                return Ok(client.clone());
            }
            match state.connections.get(&requested.id) {
                Some(connection) => Some(connection.clone()),
                None if state.loaded => {
                    return Err(DispatchError::connection_not_found(&requested.id));
                }
                None => None,
            }
        };
        let Some(connection) = known else {
            debug!(
                target: CONTROLLER_TARGET,
                connection = %requested.id,
                "building an uncached client for an unlisted connection"
            );
            return self
                .factory
                .create(ctx, requested)
                .map_err(|status| DispatchError::ClientUnavailable {
                    connection: requested.id.clone(),
                    status,
                });
        };
        let client = self
            .factory
            .create(ctx, &connection)
            .map_err(|status| DispatchError::ClientUnavailable {
                connection: connection.id.clone(),
                status,
            })?;
        self.write()
            .clients
            .entry(connection.id.clone())
            .or_insert_with(|| client.clone());
        debug!(
            target: CONTROLLER_TARGET,
            connection = %connection.id,
            client = client.tag().name(),
            "client created"
        );
        Ok(client)
    }
}
