//! Resource capability shims.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CapabilityClient, STREAM_POLL, context_or_anonymous, invoke, watch_inbound};
use crate::context::{Connection, PluginContext};
use crate::descriptor::Capability;
use crate::lifetime::CancellationToken;
use crate::resource::{
    CreateInput, CreateResult, DeleteInput, DeleteResult, EventSink, FindInput, FindResult,
    GetInput, GetResult, ListInput, ListResult, ResourceDefinition, ResourceGroup, ResourceMeta,
    ResourceProvider, UpdateInput, UpdateResult,
};
use crate::rpc::{
    CallContext, RpcClient, RpcError, RpcStatus, ServerStream, Service, decode_payload,
    encode_payload,
};

/// A resource-type key plus the operation input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyedRequest<T> {
    /// Resource type key.
    pub key: String,
    /// Operation input.
    #[serde(default)]
    pub input: T,
}

#[derive(Serialize, Deserialize)]
struct IdRequest {
    id: String,
}

/// Exposes a [`ResourceProvider`] as the `resource` service.
pub struct ResourceServer {
    provider: Arc<dyn ResourceProvider>,
}

impl ResourceServer {
    /// Wraps `provider`.
    #[must_use]
    pub const fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self { provider }
    }

    fn crud(&self, ctx: &PluginContext, method: &str, payload: Value) -> Result<Value, RpcStatus> {
        match method {
            "Get" => {
                let request: KeyedRequest<GetInput> = decode_payload(payload)?;
                encode_payload(&self.provider.get(ctx, &request.key, request.input)?)
            }
            "List" => {
                let request: KeyedRequest<ListInput> = decode_payload(payload)?;
                encode_payload(&self.provider.list(ctx, &request.key, request.input)?)
            }
            "Find" => {
                let request: KeyedRequest<FindInput> = decode_payload(payload)?;
                encode_payload(&self.provider.find(ctx, &request.key, request.input)?)
            }
            "Create" => {
                let request: KeyedRequest<CreateInput> = decode_payload(payload)?;
                encode_payload(&self.provider.create(ctx, &request.key, request.input)?)
            }
            "Update" => {
                let request: KeyedRequest<UpdateInput> = decode_payload(payload)?;
                encode_payload(&self.provider.update(ctx, &request.key, request.input)?)
            }
            "Delete" => {
                let request: KeyedRequest<DeleteInput> = decode_payload(payload)?;
                encode_payload(&self.provider.delete(ctx, &request.key, request.input)?)
            }
            other => Err(RpcStatus::unimplemented(format!("resource/{other}"))),
        }
    }

    fn connections(&self, ctx: &PluginContext, method: &str, payload: Value) -> Result<Value, RpcStatus> {
        match method {
            "LoadConnections" => encode_payload(&self.provider.load_connections(ctx)?),
            "ListConnections" => encode_payload(&self.provider.list_connections(ctx)?),
            "GetConnection" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.get_connection(ctx, &request.id)?)
            }
            "UpdateConnection" => {
                let connection: Connection = decode_payload(payload)?;
                encode_payload(&self.provider.update_connection(ctx, connection)?)
            }
            "RemoveConnection" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.remove_connection(ctx, &request.id)?)
            }
            "StartContextInformer" => encode_payload(&self.provider.start_context_informer(ctx)?),
            "StopContextInformer" => encode_payload(&self.provider.stop_context_informer(ctx)?),
            other => self.crud(ctx, other, payload),
        }
    }
}

impl Service for ResourceServer {
    fn call(&self, call: &CallContext, payload: Value) -> Result<Value, RpcStatus> {
        match call.method() {
            "GetResourceTypes" => {
                encode_payload(&self.provider.resource_types(&context_or_anonymous(call))?)
            }
            "GetResourceType" => {
                let request: KeyedRequest<Value> = decode_payload(payload)?;
                encode_payload(&self.provider.resource_type(&context_or_anonymous(call), &request.key)?)
            }
            "HasResourceType" => {
                let request: KeyedRequest<Value> = decode_payload(payload)?;
                encode_payload(&self.provider.has_resource_type(&context_or_anonymous(call), &request.key)?)
            }
            "GetResourceDefinition" => {
                let request: KeyedRequest<Value> = decode_payload(payload)?;
                encode_payload(
                    &self
                        .provider
                        .resource_definition(&context_or_anonymous(call), &request.key)?,
                )
            }
            "GetResourceGroups" => {
                encode_payload(&self.provider.resource_groups(&context_or_anonymous(call))?)
            }
            method => self.connections(call.require_plugin_context()?, method, payload),
        }
    }

    fn stream(&self, call: &CallContext, stream: ServerStream) -> Result<(), RpcStatus> {
        if call.method() != "ListenForEvents" {
            return Err(RpcStatus::unimplemented(format!("resource/{}", call.method())));
        }
        let ctx = call.require_plugin_context()?;
        let (sender, inbound) = stream.split();
        let closed = watch_inbound(inbound, drop)?;
        self.provider
            .listen_for_events(ctx, &mut |event| sender.send(&event), &closed)
    }
}

/// [`ResourceProvider`] over a plugin connection.
#[derive(Clone)]
pub struct ResourceClient {
    rpc: RpcClient,
}

impl CapabilityClient for ResourceClient {
    const CAPABILITY: Capability = Capability::Resource;

    fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl ResourceClient {
    fn call<Req, Resp>(&self, ctx: &PluginContext, method: &str, request: &Req) -> Result<Resp, RpcStatus>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        invoke(&self.rpc, Capability::Resource, method, Some(ctx), request)
    }

    fn keyed<T>(key: &str, input: T) -> KeyedRequest<T> {
        KeyedRequest {
            key: key.to_owned(),
            input,
        }
    }
}

impl ResourceProvider for ResourceClient {
    fn get(&self, ctx: &PluginContext, key: &str, input: GetInput) -> Result<GetResult, RpcStatus> {
        self.call(ctx, "Get", &Self::keyed(key, input))
    }

    fn list(&self, ctx: &PluginContext, key: &str, input: ListInput) -> Result<ListResult, RpcStatus> {
        self.call(ctx, "List", &Self::keyed(key, input))
    }

    fn find(&self, ctx: &PluginContext, key: &str, input: FindInput) -> Result<FindResult, RpcStatus> {
        self.call(ctx, "Find", &Self::keyed(key, input))
    }

    fn create(&self, ctx: &PluginContext, key: &str, input: CreateInput) -> Result<CreateResult, RpcStatus> {
        self.call(ctx, "Create", &Self::keyed(key, input))
    }

    fn update(&self, ctx: &PluginContext, key: &str, input: UpdateInput) -> Result<UpdateResult, RpcStatus> {
        self.call(ctx, "Update", &Self::keyed(key, input))
    }

    fn delete(&self, ctx: &PluginContext, key: &str, input: DeleteInput) -> Result<DeleteResult, RpcStatus> {
        self.call(ctx, "Delete", &Self::keyed(key, input))
    }

    fn resource_types(&self, ctx: &PluginContext) -> Result<BTreeMap<String, ResourceMeta>, RpcStatus> {
        self.call(ctx, "GetResourceTypes", &Value::Null)
    }

    fn resource_type(&self, ctx: &PluginContext, key: &str) -> Result<ResourceMeta, RpcStatus> {
        self.call(ctx, "GetResourceType", &Self::keyed(key, Value::Null))
    }

    fn has_resource_type(&self, ctx: &PluginContext, key: &str) -> Result<bool, RpcStatus> {
        self.call(ctx, "HasResourceType", &Self::keyed(key, Value::Null))
    }

    fn resource_definition(&self, ctx: &PluginContext, key: &str) -> Result<ResourceDefinition, RpcStatus> {
        self.call(ctx, "GetResourceDefinition", &Self::keyed(key, Value::Null))
    }

    fn resource_groups(&self, ctx: &PluginContext) -> Result<BTreeMap<String, ResourceGroup>, RpcStatus> {
        self.call(ctx, "GetResourceGroups", &Value::Null)
    }

    fn load_connections(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus> {
        self.call(ctx, "LoadConnections", &Value::Null)
    }

    fn list_connections(&self, ctx: &PluginContext) -> Result<Vec<Connection>, RpcStatus> {
        self.call(ctx, "ListConnections", &Value::Null)
    }

    fn get_connection(&self, ctx: &PluginContext, id: &str) -> Result<Connection, RpcStatus> {
        self.call(ctx, "GetConnection", &IdRequest { id: id.to_owned() })
    }

    fn update_connection(&self, ctx: &PluginContext, connection: Connection) -> Result<Connection, RpcStatus> {
        self.call(ctx, "UpdateConnection", &connection)
    }

    fn remove_connection(&self, ctx: &PluginContext, id: &str) -> Result<(), RpcStatus> {
        self.call(ctx, "RemoveConnection", &IdRequest { id: id.to_owned() })
    }

    fn start_context_informer(&self, ctx: &PluginContext) -> Result<(), RpcStatus> {
        self.call(ctx, "StartContextInformer", &Value::Null)
    }

    fn stop_context_informer(&self, ctx: &PluginContext) -> Result<(), RpcStatus> {
        self.call(ctx, "StopContextInformer", &Value::Null)
    }

    fn listen_for_events(
        &self,
        ctx: &PluginContext,
        sink: EventSink<'_>,
        stop: &CancellationToken,
    ) -> Result<(), RpcStatus> {
        let mut stream = self
            .rpc
            .open_stream(Capability::Resource.as_str(), "ListenForEvents", Some(ctx))
            .map_err(RpcStatus::from)?;
        while !stop.is_cancelled() {
            match stream.recv_timeout(STREAM_POLL) {
                Ok(Some(value)) => sink(decode_payload(value)?)?,
                Ok(None) => return Ok(()),
                Err(RpcError::Timeout { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}
