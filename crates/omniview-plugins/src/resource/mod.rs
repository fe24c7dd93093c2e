//! Resource types, operation inputs and results, and the resource
//! capability trait.
//!
//! Resource types are keyed `group::version::kind`, e.g. `core::v1::Pod`.
//! Payloads are plain JSON; rendering metadata such as columns is carried
//! opaquely.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Connection, PluginContext};
use crate::lifetime::CancellationToken;
use crate::rpc::RpcStatus;

/// Identity and presentation of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// API group, e.g. `core` or `apps`.
    pub group: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Kind, e.g. `Pod`.
    pub kind: String,
    /// Display label; defaults to the kind.
    #[serde(default)]
    pub label: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Grouping shown in navigation.
    #[serde(default)]
    pub category: String,
}

impl ResourceMeta {
    /// Creates metadata labelled with the kind.
    #[must_use]
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        let kind_name = kind.into();
        Self {
            group: group.into(),
            version: version.into(),
            label: kind_name.clone(),
            kind: kind_name,
            description: String::new(),
            category: String::new(),
        }
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The `group::version::kind` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}::{}::{}", self.group, self.version, self.kind)
    }
}

/// Static per-type rendering metadata.
///
/// Columns are passed through to the UI untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Path to the object's ID, e.g. `metadata.name`.
    #[serde(default)]
    pub id_accessor: String,
    /// Path to the object's namespace.
    #[serde(default)]
    pub namespace_accessor: String,
    /// Column definitions.
    #[serde(default)]
    pub columns: Vec<Value>,
}

/// A named set of resource types, e.g. the `apps` group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Group ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Member types by version.
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<ResourceMeta>>,
}

/// Input to `Get`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetInput {
    /// Object ID.
    pub id: String,
    /// Target namespace; empty means "use the connection default".
    #[serde(default)]
    pub namespace: String,
}

/// Input to `List`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInput {
    /// Namespaces to list; empty means "use the connection default".
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Input to `Find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindInput {
    /// Backend-specific filter.
    #[serde(default)]
    pub conditions: Value,
    /// Namespaces to search.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Input to `Create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateInput {
    /// Object to create.
    pub input: Value,
    /// Target namespace.
    #[serde(default)]
    pub namespace: String,
}

/// Input to `Update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateInput {
    /// Object ID.
    pub id: String,
    /// Replacement object.
    pub input: Value,
    /// Target namespace.
    #[serde(default)]
    pub namespace: String,
}

/// Input to `Delete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInput {
    /// Object ID.
    pub id: String,
    /// Target namespace.
    #[serde(default)]
    pub namespace: String,
    /// Grace period before forced removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<u64>,
}

/// Outcome of a resource operation.
///
/// Recoverable problems, such as one namespace failing during a multi
/// namespace list, are recorded in `errors` while the rest of the result is
/// still returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult<T> {
    /// Payload.
    pub result: T,
    /// Whether the operation fully succeeded.
    pub success: bool,
    /// Recoverable errors encountered along the way.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl<T> OperationResult<T> {
    /// A fully successful result.
    #[must_use]
    pub const fn ok(result: T) -> Self {
        Self {
            result,
            success: true,
            errors: Vec::new(),
        }
    }

    /// Records a recoverable error and marks the result unsuccessful.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.success = false;
    }
}

/// Result of `Get`.
pub type GetResult = OperationResult<Value>;
/// Result of `List`.
pub type ListResult = OperationResult<Vec<Value>>;
/// Result of `Find`.
pub type FindResult = OperationResult<Vec<Value>>;
/// Result of `Create`.
pub type CreateResult = OperationResult<Value>;
/// Result of `Update`.
pub type UpdateResult = OperationResult<Value>;
/// Result of `Delete`.
pub type DeleteResult = OperationResult<Value>;

/// What happened to a watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Object appeared.
    Add,
    /// Object changed.
    Update,
    /// Object disappeared.
    Delete,
}

/// A change to one watched object, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Change type.
    pub kind: EventKind,
    /// Connection the watch runs against.
    pub connection: String,
    /// Resource type key.
    pub resource_key: String,
    /// Current object state; the last known state for deletes.
    pub data: Value,
    /// Previous state, for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

/// Receives events in [`ResourceProvider::listen_for_events`].
pub type EventSink<'a> = &'a mut dyn FnMut(ResourceEvent) -> Result<(), RpcStatus>;

/// The resource capability.
///
/// Implemented in-process by
/// [`ResourceController`](crate::controller::ResourceController) and over
/// RPC by the resource client shim. Every method takes the request's
/// [`PluginContext`]; resource and connection scoped methods need its
/// connection.
pub trait ResourceProvider: Send + Sync {
    /// Fetches one object.
    ///
    /// # Errors
    ///
    /// Dispatch failures and unrecoverable backend failures.
    fn get(&self, ctx: &PluginContext, key: &str, input: GetInput) -> Result<GetResult, RpcStatus>;

    /// Lists objects.
    ///
    /// # Errors
    ///
    /// As [`ResourceProvider::get`].
    fn list(&self, ctx: &PluginContext, key: &str, input: ListInput) -> Result<ListResult, RpcStatus>;

    /// Searches objects.
    ///
    /// # Errors
    ///
    /// As [`ResourceProvider::get`].
    fn find(&self, ctx: &PluginContext, key: &str, input: FindInput) -> Result<FindResult, RpcStatus>;

    /// Creates an object.
    ///
    /// # Errors
    ///
    /// As [`ResourceProvider::get`].
    fn create(
        &self,
        ctx: &PluginContext,
        key: &str,
        input: CreateInput,
    ) -> Result<CreateResult, RpcStatus>;

    /// Replaces an object.
    ///
    /// # Errors
    ///
    /// As [`ResourceProvider::get`].
    fn update(
        &self,
        ctx: &PluginContext,
        key: &str,
        input: UpdateInput,
    ) -> Result<UpdateResult, RpcStatus>;

    /// Deletes an object.
    ///
    /// # Errors
    ///
    /// As [`ResourceProvider::get`].
    fn delete(
        &self,
        ctx: &PluginContext,
        key: &str,
        input: DeleteInput,
    ) -> Result<DeleteResult, RpcStatus>;

    /// Every registered type by key.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn resource_types(&self, ctx: &PluginContext) -> Result<BTreeMap<String, ResourceMeta>, RpcStatus>;

    /// One registered type.
    ///
    /// # Errors
    ///
    /// `not_found` for unregistered keys.
    fn resource_type(&self, ctx: &PluginContext, key: &str) -> Result<ResourceMeta, RpcStatus>;

    /// Whether `key` is registered.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn has_resource_type(&self, ctx: &PluginContext, key: &str) -> Result<bool, RpcStatus>;

    /// Rendering metadata for one type.
    ///
    /// # Errors
    ///
    /// `not_found` for unregistered keys.
    fn resource_definition(
        &self,
        ctx: &PluginContext,
        key: &str,
    ) -> Result<ResourceDefinition, RpcStatus>;

    /// Resource groups by ID.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn resource_groups(&self, ctx: &PluginContext) -> Result<BTreeMap<String, ResourceGroup>, RpcStatus>;

    /// Discovers connections afresh, replacing the known set.
    ///
    /// # Errors
    ///
    /// `unimplemented` when the plugin has no connection loader.
    fn load_connections(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus>;

    /// Known connections, sensitive data removed.
    ///
    /// # Errors
    ///
    /// `unimplemented` when the plugin has no connection manager.
    fn list_connections(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus>;

    /// One known connection, sensitive data removed.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown IDs.
    fn get_connection(&self, ctx: &PluginContext, id: &str) -> Result<Connection, RpcStatus>;

    /// Replaces a connection's public fields and drops its cached client.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown IDs.
    fn update_connection(
        &self,
        ctx: &PluginContext,
        connection: Connection,
    ) -> Result<Connection, RpcStatus>;

    /// Forgets a connection, stopping its informers.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown IDs.
    fn remove_connection(&self, ctx: &PluginContext, id: &str) -> Result<(), RpcStatus>;

    /// Starts watching every informer-enabled type on the context's
    /// connection. A no-op without informers.
    ///
    /// # Errors
    ///
    /// Client resolution or informer start failures.
    fn start_context_informer(&self, ctx: &PluginContext) -> Result<(), RpcStatus>;

    /// Stops the context connection's informers. A no-op without informers.
    ///
    /// # Errors
    ///
    /// `failed_precondition` when the context has no connection.
    fn stop_context_informer(&self, ctx: &PluginContext) -> Result<(), RpcStatus>;

    /// Feeds informer events to `sink` until `stop` fires, the sink fails,
    /// or the source ends. Returns at once without informers.
    ///
    /// # Errors
    ///
    /// Sink or transport failures.
    fn listen_for_events(
        &self,
        ctx: &PluginContext,
        sink: EventSink<'_>,
        stop: &CancellationToken,
    ) -> Result<(), RpcStatus>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn meta_key_joins_group_version_kind() {
        let meta = ResourceMeta::new("core", "v1", "Pod");
        assert_eq!(meta.key(), "core::v1::Pod");
        assert_eq!(meta.label, "Pod");
    }

    #[rstest]
    fn recorded_errors_mark_failure() {
        let mut result = ListResult::ok(vec![json!({ "name": "a" })]);
        assert!(result.success);
        result.record_error("namespace kube-system: forbidden");
        assert!(!result.success);
        assert_eq!(result.result.len(), 1);
        assert_eq!(result.errors, ["namespace kube-system: forbidden"]);
    }

    #[rstest]
    fn events_omit_absent_previous_state() {
        let event = ResourceEvent {
            kind: EventKind::Add,
            connection: String::from("prod"),
            resource_key: String::from("core::v1::Pod"),
            data: json!({ "name": "web" }),
            previous: None,
        };
        let wire = serde_json::to_value(&event).expect("serialise event");
        assert_eq!(wire["kind"], json!("add"));
        assert!(wire.get("previous").is_none());
    }
}
