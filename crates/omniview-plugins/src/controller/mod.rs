//! Resource controller: routes typed resource operations to per-type
//! resourcers.
//!
//! Each call goes through four steps, stopping at the first failure:
//!
//! 1. the resource type must be registered;
//! 2. a resourcer must be registered for it;
//! 3. the client for the context's connection is resolved and its type tag
//!    must match the resourcer's;
//! 4. the operation runs.
//!
//! Dispatch holds the registry read lock from lookup until the operation
//! returns, so registration waits for in-flight operations and never swaps
//! a resourcer out from under one. Resourcers must not register from inside
//! an operation. The controller never retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::debug;

use crate::context::{Connection, PluginContext};
use crate::informer::InformerManager;
use crate::lifetime::CancellationToken;
use crate::resource::{
    CreateInput, CreateResult, DeleteInput, DeleteResult, EventSink, FindInput, FindResult,
    GetInput, GetResult, ListInput, ListResult, ResourceDefinition, ResourceGroup, ResourceMeta,
    ResourceProvider, UpdateInput, UpdateResult,
};
use crate::rpc::{RpcStatus, StatusCode};

mod client;
mod connections;
mod resourcer;

pub use client::{ClientResolver, ClientTag, ConnectedClient};
pub use connections::{ClientFactory, ConnectionLoader, ConnectionManager};
pub use resourcer::Resourcer;

use resourcer::{ErasedResourcer, Operation, Outcome, TypedResourcer};

/// Log target for resource dispatch.
pub(crate) const CONTROLLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::controller");

/// Connection data key holding the default namespace.
pub const NAMESPACE_KEY: &str = "namespace";

/// Dispatch failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The resource type is not registered.
    #[error("resource type not found: {key}")]
    ResourceTypeNotFound {
        /// Requested key.
        key: String,
    },
    /// The type is registered but nothing implements it.
    #[error("resourcer not found: {key}")]
    ResourcerNotFound {
        /// Requested key.
        key: String,
    },
    /// The plugin context carries no connection.
    #[error("no connection in plugin context")]
    NoConnection,
    /// The connection ID is unknown.
    #[error("connection not found: {id}")]
    ConnectionNotFound {
        /// Requested ID.
        id: String,
    },
    /// The resolved client is not the type the resourcer expects.
    #[error("client type mismatch for {key}: resourcer expects {expected}, connection provides {actual}")]
    ClientTypeMismatch {
        /// Resource key.
        key: String,
        /// Resourcer's client type.
        expected: &'static str,
        /// Resolved client type.
        actual: &'static str,
    },
    /// No client could be built for the connection.
    #[error("client unavailable for connection {connection}: {status}")]
    ClientUnavailable {
        /// Connection ID.
        connection: String,
        /// Factory failure.
        status: RpcStatus,
    },
    /// The resourcer failed.
    #[error(transparent)]
    Operation(#[from] RpcStatus),
}

impl DispatchError {
    /// Builds [`DispatchError::ResourceTypeNotFound`].
    #[must_use]
    pub fn resource_type_not_found(key: impl Into<String>) -> Self {
        Self::ResourceTypeNotFound { key: key.into() }
    }

    /// Builds [`DispatchError::ResourcerNotFound`].
    #[must_use]
    pub fn resourcer_not_found(key: impl Into<String>) -> Self {
        Self::ResourcerNotFound { key: key.into() }
    }

    /// Builds [`DispatchError::ConnectionNotFound`].
    #[must_use]
    pub fn connection_not_found(id: impl Into<String>) -> Self {
        Self::ConnectionNotFound { id: id.into() }
    }
}

impl From<DispatchError> for RpcStatus {
    fn from(error: DispatchError) -> Self {
        let code = match &error {
            DispatchError::Operation(status) => return status.clone(),
            DispatchError::ResourceTypeNotFound { .. }
            | DispatchError::ResourcerNotFound { .. }
            | DispatchError::ConnectionNotFound { .. } => StatusCode::NotFound,
            DispatchError::NoConnection | DispatchError::ClientTypeMismatch { .. } => {
                StatusCode::FailedPrecondition
            }
            DispatchError::ClientUnavailable { status, .. } => status.code,
        };
        Self::new(code, error.to_string())
    }
}

#[derive(Default)]
struct Registry {
    types: BTreeMap<String, (ResourceMeta, ResourceDefinition)>,
    groups: BTreeMap<String, ResourceGroup>,
    resourcers: HashMap<String, Arc<dyn ErasedResourcer>>,
}

/// The in-process resource capability.
pub struct ResourceController {
    registry: RwLock<Registry>,
    resolver: Arc<dyn ClientResolver>,
    connections: Option<Arc<ConnectionManager>>,
    informers: Option<Arc<InformerManager>>,
}

impl ResourceController {
    /// A controller resolving clients through `connections`, which also
    /// backs the connection operations.
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        let resolver: Arc<dyn ClientResolver> = Arc::clone(&connections) as Arc<dyn ClientResolver>;
        Self {
            registry: RwLock::default(),
            resolver,
            connections: Some(connections),
            informers: None,
        }
    }

    /// A controller with a custom resolver and no connection operations.
    #[must_use]
    pub fn with_resolver(resolver: Arc<dyn ClientResolver>) -> Self {
        Self {
            registry: RwLock::default(),
            resolver,
            connections: None,
            informers: None,
        }
    }

    /// Enables informers.
    #[must_use]
    pub fn with_informers(mut self, informers: Arc<InformerManager>) -> Self {
        self.informers = Some(informers);
        self
    }

    /// Registers a resource type without an implementation.
    pub fn register_type(&self, meta: ResourceMeta, definition: ResourceDefinition) {
        let key = meta.key();
        debug!(target: CONTROLLER_TARGET, %key, "resource type registered");
        self.write().types.insert(key, (meta, definition));
    }

    /// Registers the resourcer for `key`, replacing any earlier one.
    pub fn register_resourcer<C, R>(&self, key: impl Into<String>, resourcer: R)
    where
        C: Send + Sync + 'static,
        R: Resourcer<C> + 'static,
    {
        let erased: Arc<dyn ErasedResourcer> = Arc::new(TypedResourcer::<C, R>::new(resourcer));
        self.write().resourcers.insert(key.into(), erased);
    }

    /// Registers a type together with its resourcer.
    pub fn register<C, R>(&self, meta: ResourceMeta, definition: ResourceDefinition, resourcer: R)
    where
        C: Send + Sync + 'static,
        R: Resourcer<C> + 'static,
    {
        let key = meta.key();
        self.register_type(meta, definition);
        self.register_resourcer::<C, R>(key, resourcer);
    }

    /// Registers a resource group.
    pub fn register_group(&self, group: ResourceGroup) {
        self.write().groups.insert(group.id.clone(), group);
    }

    fn dispatch(
        &self,
        ctx: &PluginContext,
        key: &str,
        operation: Operation,
    ) -> Result<Outcome, DispatchError> {
        let registry = self.read();
        if !registry.types.contains_key(key) {
            return Err(DispatchError::resource_type_not_found(key));
        }
        let resourcer = registry
            .resourcers
            .get(key)
            .ok_or_else(|| DispatchError::resourcer_not_found(key))?;
        let client = self.resolver.resolve(ctx)?;
        let expected = resourcer.client_tag();
        if client.tag() != expected {
            return Err(DispatchError::ClientTypeMismatch {
                key: key.to_owned(),
                expected: expected.name(),
                actual: client.tag().name(),
            });
        }
        debug!(
            target: CONTROLLER_TARGET,
            key,
            operation = operation.name(),
            request_id = ctx.request_id(),
            "dispatching resource operation"
        );
        let outcome = resourcer.invoke(ctx, &client, operation)?;
        drop(registry);
        Ok(outcome)
    }

    fn dispatch_one(
        &self,
        ctx: &PluginContext,
        key: &str,
        operation: Operation,
    ) -> Result<GetResult, RpcStatus> {
        match self.dispatch(ctx, key, operation)? {
            Outcome::One(result) => Ok(result),
            Outcome::Many(_) => Err(RpcStatus::internal("resourcer returned a list for a single object")),
        }
    }

    fn dispatch_many(
        &self,
        ctx: &PluginContext,
        key: &str,
        operation: Operation,
    ) -> Result<ListResult, RpcStatus> {
        match self.dispatch(ctx, key, operation)? {
            Outcome::Many(result) => Ok(result),
            Outcome::One(_) => Err(RpcStatus::internal("resourcer returned a single object for a list")),
        }
    }

    fn connections(&self) -> Result<&ConnectionManager, RpcStatus> {
        self.connections
            .as_deref()
            .ok_or_else(|| RpcStatus::unimplemented("plugin does not manage connections"))
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// The explicit namespace, else the connection's default, else empty.
fn resolve_namespace(ctx: &PluginContext, namespace: String) -> String {
    if !namespace.is_empty() {
        return namespace;
    }
    ctx.connection()
        .and_then(|connection| connection.data_str(NAMESPACE_KEY))
        .map(str::to_owned)
        .unwrap_or_default()
}

fn resolve_namespaces(ctx: &PluginContext, namespaces: Vec<String>) -> Vec<String> {
    if !namespaces.is_empty() {
        return namespaces;
    }
    let fallback = resolve_namespace(ctx, String::new());
    if fallback.is_empty() { Vec::new() } else { vec![fallback] }
}

impl ResourceProvider for ResourceController {
    fn get(&self, ctx: &PluginContext, key: &str, mut input: GetInput) -> Result<GetResult, RpcStatus> {
        input.namespace = resolve_namespace(ctx, input.namespace);
        self.dispatch_one(ctx, key, Operation::Get(input))
    }

    fn list(&self, ctx: &PluginContext, key: &str, mut input: ListInput) -> Result<ListResult, RpcStatus> {
        input.namespaces = resolve_namespaces(ctx, input.namespaces);
        self.dispatch_many(ctx, key, Operation::List(input))
    }

    fn find(&self, ctx: &PluginContext, key: &str, mut input: FindInput) -> Result<FindResult, RpcStatus> {
        input.namespaces = resolve_namespaces(ctx, input.namespaces);
        self.dispatch_many(ctx, key, Operation::Find(input))
    }

    fn create(
        &self,
        ctx: &PluginContext,
        key: &str,
        mut input: CreateInput,
    ) -> Result<CreateResult, RpcStatus> {
        input.namespace = resolve_namespace(ctx, input.namespace);
        self.dispatch_one(ctx, key, Operation::Create(input))
    }

    fn update(
        &self,
        ctx: &PluginContext,
        key: &str,
        mut input: UpdateInput,
    ) -> Result<UpdateResult, RpcStatus> {
        input.namespace = resolve_namespace(ctx, input.namespace);
        self.dispatch_one(ctx, key, Operation::Update(input))
    }

    fn delete(
        &self,
        ctx: &PluginContext,
        key: &str,
        mut input: DeleteInput,
    ) -> Result<DeleteResult, RpcStatus> {
        input.namespace = resolve_namespace(ctx, input.namespace);
        self.dispatch_one(ctx, key, Operation::Delete(input))
    }

    fn resource_types(&self, _ctx: &PluginContext) -> Result<BTreeMap<String, ResourceMeta>, RpcStatus> {
        Ok(self
            .read()
            .types
            .iter()
            .map(|(key, (meta, _))| (key.clone(), meta.clone()))
            .collect())
    }

    fn resource_type(&self, _ctx: &PluginContext, key: &str) -> Result<ResourceMeta, RpcStatus> {
        self.read()
            .types
            .get(key)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| DispatchError::resource_type_not_found(key).into())
    }

    fn has_resource_type(&self, _ctx: &PluginContext, key: &str) -> Result<bool, RpcStatus> {
        Ok(self.read().types.contains_key(key))
    }

    fn resource_definition(
        &self,
        _ctx: &PluginContext,
        key: &str,
    ) -> Result<ResourceDefinition, RpcStatus> {
        self.read()
            .types
            .get(key)
            .map(|(_, definition)| definition.clone())
            .ok_or_else(|| DispatchError::resource_type_not_found(key).into())
    }

    fn resource_groups(&self, _ctx: &PluginContext) -> Result<BTreeMap<String, ResourceGroup>, RpcStatus> {
        Ok(self.read().groups.clone())
    }

    fn load_connections(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus> {
        self.connections()?.load(ctx)
    }

    fn list_connections(&self, _ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus> {
        Ok(self.connections()?.list())
    }

    fn get_connection(&self, _ctx: &PluginContext, id: &str) -> Result<Connection, RpcStatus> {
        Ok(self.connections()?.get(id)?)
    }

    fn update_connection(
        &self,
        _ctx: &PluginContext,
        connection: Connection,
    ) -> Result<Connection, RpcStatus> {
        Ok(self.connections()?.update(connection)?)
    }

    fn remove_connection(&self, _ctx: &PluginContext, id: &str) -> Result<(), RpcStatus> {
        if let Some(informers) = &self.informers {
            informers.stop_connection(id)?;
        }
        Ok(self.connections()?.remove(id)?)
    }

    fn start_context_informer(&self, ctx: &PluginContext) -> Result<(), RpcStatus> {
        let Some(informers) = &self.informers else {
            return Ok(());
        };
        let connection = ctx.connection().ok_or(DispatchError::NoConnection)?;
        let client = self.resolver.resolve(ctx)?;
        Ok(informers.start_connection(ctx, connection, &client)?)
    }

    fn stop_context_informer(&self, ctx: &PluginContext) -> Result<(), RpcStatus> {
        let Some(informers) = &self.informers else {
            return Ok(());
        };
        let connection = ctx.connection().ok_or(DispatchError::NoConnection)?;
        Ok(informers.stop_connection(&connection.id)?)
    }

    fn listen_for_events(
        &self,
        _ctx: &PluginContext,
        sink: EventSink<'_>,
        stop: &CancellationToken,
    ) -> Result<(), RpcStatus> {
        match &self.informers {
            Some(informers) => informers.listen(sink, stop),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests;
