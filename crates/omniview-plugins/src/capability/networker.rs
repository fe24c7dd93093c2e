//! Networker capability shims.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CapabilityClient, context_or_anonymous, invoke};
use crate::context::PluginContext;
use crate::descriptor::Capability;
use crate::networker::{
    FindPortForwardSessions, NetworkerProvider, PortForwardOptions, PortForwardSession,
    PortForwardTarget,
};
use crate::rpc::{CallContext, RpcClient, RpcStatus, Service, decode_payload, encode_payload};

#[derive(Serialize, Deserialize)]
struct IdRequest {
    id: String,
}

/// Exposes a [`NetworkerProvider`] as the `networker` service.
pub struct NetworkerServer {
    provider: Arc<dyn NetworkerProvider>,
}

impl NetworkerServer {
    /// Wraps `provider`.
    #[must_use]
    pub const fn new(provider: Arc<dyn NetworkerProvider>) -> Self {
        Self { provider }
    }
}

impl Service for NetworkerServer {
    fn call(&self, call: &CallContext, payload: Value) -> Result<Value, RpcStatus> {
        let ctx = context_or_anonymous(call);
        match call.method() {
            "GetSupportedPortForwardTargets" => {
                encode_payload(&self.provider.supported_targets(&ctx)?)
            }
            "StartResourcePortForwardingSession" => {
                let options: PortForwardOptions = decode_payload(payload)?;
                encode_payload(&self.provider.start_session(&ctx, options)?)
            }
            "ListPortForwardSessions" => encode_payload(&self.provider.list_sessions(&ctx)?),
            "FindPortForwardSessions" => {
                let filter: FindPortForwardSessions = decode_payload(payload)?;
                encode_payload(&self.provider.find_sessions(&ctx, &filter)?)
            }
            "ClosePortForwardSession" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.close_session(&ctx, &request.id)?)
            }
            other => Err(RpcStatus::unimplemented(format!("networker/{other}"))),
        }
    }
}

/// [`NetworkerProvider`] over a plugin connection.
#[derive(Clone)]
pub struct NetworkerClient {
    rpc: RpcClient,
}

impl CapabilityClient for NetworkerClient {
    const CAPABILITY: Capability = Capability::Networker;

    fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl NetworkerProvider for NetworkerClient {
    fn supported_targets(&self, ctx: &PluginContext) -> Result<Vec<PortForwardTarget>, RpcStatus> {
        invoke(
            &self.rpc,
            Capability::Networker,
            "GetSupportedPortForwardTargets",
            Some(ctx),
            &Value::Null,
        )
    }

    fn start_session(&self, ctx: &PluginContext, options: PortForwardOptions) -> Result<PortForwardSession, RpcStatus> {
        invoke(
            &self.rpc,
            Capability::Networker,
            "StartResourcePortForwardingSession",
            Some(ctx),
            &options,
        )
    }

    fn list_sessions(&self, ctx: &PluginContext) -> Result<Vec<PortForwardSession>, RpcStatus> {
        invoke(&self.rpc, Capability::Networker, "ListPortForwardSessions", Some(ctx), &Value::Null)
    }

    fn find_sessions(
        &self,
        ctx: &PluginContext,
        filter: &FindPortForwardSessions,
    ) -> Result<Vec<PortForwardSession>, RpcStatus> {
        invoke(&self.rpc, Capability::Networker, "FindPortForwardSessions", Some(ctx), filter)
    }

    fn close_session(&self, ctx: &PluginContext, id: &str) -> Result<PortForwardSession, RpcStatus> {
        invoke(
            &self.rpc,
            Capability::Networker,
            "ClosePortForwardSession",
            Some(ctx),
            &IdRequest { id: id.to_owned() },
        )
    }
}
