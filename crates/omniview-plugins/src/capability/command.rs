//! Command capability shims. Payloads cross the wire as opaque envelopes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::settings::{seal, unseal};
use super::{CapabilityClient, context_or_anonymous, invoke};
use crate::command::CommandProvider;
use crate::context::PluginContext;
use crate::descriptor::Capability;
use crate::rpc::{CallContext, RpcClient, RpcStatus, Service, decode_payload, encode_payload};
use crate::value::OpaqueValue;

#[derive(Serialize, Deserialize)]
struct RunRequest {
    command: String,
    payload: OpaqueValue,
}

/// Exposes a [`CommandProvider`] as the `command` service.
pub struct CommandServer {
    provider: Arc<dyn CommandProvider>,
}

impl CommandServer {
    /// Wraps `provider`.
    #[must_use]
    pub const fn new(provider: Arc<dyn CommandProvider>) -> Self {
        Self { provider }
    }
}

impl Service for CommandServer {
    fn call(&self, call: &CallContext, payload: Value) -> Result<Value, RpcStatus> {
        let ctx = context_or_anonymous(call);
        match call.method() {
            "ListCommands" => encode_payload(&self.provider.commands(&ctx)?),
            "Run" => {
                let request: RunRequest = decode_payload(payload)?;
                let output = self
                    .provider
                    .run(&ctx, &request.command, unseal(&request.payload)?)?;
                encode_payload(&seal(&output)?)
            }
            other => Err(RpcStatus::unimplemented(format!("command/{other}"))),
        }
    }
}

/// [`CommandProvider`] over a plugin connection.
#[derive(Clone)]
pub struct CommandClient {
    rpc: RpcClient,
}

impl CapabilityClient for CommandClient {
    const CAPABILITY: Capability = Capability::Command;

    fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl CommandProvider for CommandClient {
    fn commands(&self, ctx: &PluginContext) -> Result<Vec<String>, RpcStatus> {
        invoke(&self.rpc, Capability::Command, "ListCommands", Some(ctx), &Value::Null)
    }

    fn run(&self, ctx: &PluginContext, command: &str, payload: Value) -> Result<Value, RpcStatus> {
        let request = RunRequest {
            command: command.to_owned(),
            payload: seal(&payload)?,
        };
        let output: OpaqueValue = invoke(&self.rpc, Capability::Command, "Run", Some(ctx), &request)?;
        unseal(&output)
    }
}
