//! Exec capability shims.
//!
//! Unary calls manage sessions; one bidirectional `Stream` carries output
//! chunks to the host and keyboard input to the plugin for every session.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{CapabilityClient, STREAM_POLL, context_or_anonymous, invoke, watch_inbound};
use crate::context::PluginContext;
use crate::descriptor::Capability;
use crate::exec::{
    AttachedSession, EXEC_TARGET, ExecHandlerInfo, ExecProvider, SessionChunk, SessionInfo,
    SessionOptions, TerminalSize,
};
use crate::rpc::{
    CallContext, RpcClient, RpcStatus, ServerStream, Service, StreamSender, decode_payload,
    encode_payload,
};

const OUTPUT_BUFFER: usize = 256;

#[derive(Serialize, Deserialize)]
struct IdRequest {
    id: String,
}

#[derive(Serialize, Deserialize)]
struct ResizeRequest {
    id: String,
    size: TerminalSize,
}

/// Exposes an [`ExecProvider`] as the `exec` service.
pub struct ExecServer {
    provider: Arc<dyn ExecProvider>,
}

impl ExecServer {
    /// Wraps `provider`.
    #[must_use]
    pub const fn new(provider: Arc<dyn ExecProvider>) -> Self {
        Self { provider }
    }
}

impl Service for ExecServer {
    fn call(&self, call: &CallContext, payload: Value) -> Result<Value, RpcStatus> {
        let ctx = context_or_anonymous(call);
        match call.method() {
            "GetSupportedResources" => encode_payload(&self.provider.supported_resources(&ctx)?),
            "CreateSession" => {
                let options: SessionOptions = decode_payload(payload)?;
                encode_payload(&self.provider.create_session(&ctx, options)?)
            }
            "AttachSession" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.attach_session(&ctx, &request.id)?)
            }
            "DetachSession" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.detach_session(&ctx, &request.id)?)
            }
            "CloseSession" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.close_session(&ctx, &request.id)?)
            }
            "ResizeSession" => {
                let request: ResizeRequest = decode_payload(payload)?;
                encode_payload(&self.provider.resize_session(&ctx, &request.id, request.size)?)
            }
            "WriteSession" => {
                let chunk: SessionChunk = decode_payload(payload)?;
                encode_payload(&self.provider.write_session(&ctx, &chunk.session_id, &chunk.data)?)
            }
            "ListSessions" => encode_payload(&self.provider.list_sessions(&ctx)?),
            "GetSession" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.get_session(&ctx, &request.id)?)
            }
            other => Err(RpcStatus::unimplemented(format!("exec/{other}"))),
        }
    }

    fn stream(&self, call: &CallContext, stream: ServerStream) -> Result<(), RpcStatus> {
        if call.method() != "Stream" {
            return Err(RpcStatus::unimplemented(format!("exec/{}", call.method())));
        }
        let ctx = context_or_anonymous(call);
        let output = self.provider.subscribe(&ctx)?;
        let (sender, inbound) = stream.split();

        let provider = Arc::clone(&self.provider);
        let closed = watch_inbound(inbound, move |message| {
            match serde_json::from_value::<SessionChunk>(message) {
                Ok(chunk) => {
                    if let Err(status) = provider.write_session(&ctx, &chunk.session_id, &chunk.data) {
                        warn!(
                            target: EXEC_TARGET,
                            session = %chunk.session_id,
                            %status,
                            "dropping input for session"
                        );
                    }
                }
                Err(error) => warn!(target: EXEC_TARGET, %error, "discarding malformed session input"),
            }
        })?;

        while !closed.is_cancelled() {
            match output.recv_timeout(STREAM_POLL) {
                Ok(chunk) => sender.send(&chunk)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}

type InputSlot = Arc<Mutex<Option<StreamSender>>>;

/// [`ExecProvider`] over a plugin connection.
///
/// While a [`subscribe`](ExecProvider::subscribe) stream is open, input is
/// written on it; otherwise `WriteSession` calls are used.
#[derive(Clone)]
pub struct ExecClient {
    rpc: RpcClient,
    input: InputSlot,
}

impl CapabilityClient for ExecClient {
    const CAPABILITY: Capability = Capability::Exec;

    fn from_rpc(rpc: RpcClient) -> Self {
        Self {
            rpc,
            input: Arc::new(Mutex::new(None)),
        }
    }
}

fn slot(input: &InputSlot) -> MutexGuard<'_, Option<StreamSender>> {
    input.lock().unwrap_or_else(|poison| poison.into_inner())
}

impl ExecProvider for ExecClient {
    fn supported_resources(&self, ctx: &PluginContext) -> Result<Vec<ExecHandlerInfo>, RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "GetSupportedResources", Some(ctx), &Value::Null)
    }

    fn create_session(&self, ctx: &PluginContext, options: SessionOptions) -> Result<SessionInfo, RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "CreateSession", Some(ctx), &options)
    }

    fn attach_session(&self, ctx: &PluginContext, id: &str) -> Result<AttachedSession, RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "AttachSession", Some(ctx), &IdRequest { id: id.to_owned() })
    }

    fn detach_session(&self, ctx: &PluginContext, id: &str) -> Result<SessionInfo, RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "DetachSession", Some(ctx), &IdRequest { id: id.to_owned() })
    }

    fn close_session(&self, ctx: &PluginContext, id: &str) -> Result<(), RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "CloseSession", Some(ctx), &IdRequest { id: id.to_owned() })
    }

    fn resize_session(&self, ctx: &PluginContext, id: &str, size: TerminalSize) -> Result<(), RpcStatus> {
        let request = ResizeRequest {
            id: id.to_owned(),
            size,
        };
        invoke(&self.rpc, Capability::Exec, "ResizeSession", Some(ctx), &request)
    }

    fn write_session(&self, ctx: &PluginContext, id: &str, data: &[u8]) -> Result<(), RpcStatus> {
        let chunk = SessionChunk::data(id, data.to_vec());
        if let Some(sender) = slot(&self.input).as_ref() {
            return sender.send(&chunk).map_err(RpcStatus::from);
        }
        invoke(&self.rpc, Capability::Exec, "WriteSession", Some(ctx), &chunk)
    }

    fn list_sessions(&self, ctx: &PluginContext) -> Result<Vec<SessionInfo>, RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "ListSessions", Some(ctx), &Value::Null)
    }

    fn get_session(&self, ctx: &PluginContext, id: &str) -> Result<SessionInfo, RpcStatus> {
        invoke(&self.rpc, Capability::Exec, "GetSession", Some(ctx), &IdRequest { id: id.to_owned() })
    }

    fn subscribe(&self, ctx: &PluginContext) -> Result<Receiver<SessionChunk>, RpcStatus> {
        let mut stream = self
            .rpc
            .open_stream(Capability::Exec.as_str(), "Stream", Some(ctx))
            .map_err(RpcStatus::from)?;
        *slot(&self.input) = Some(stream.sender());

        let (chunks, receiver) = mpsc::sync_channel(OUTPUT_BUFFER);
        let input = Arc::clone(&self.input);
        thread::Builder::new()
            .name(String::from("omniview-exec-output"))
            .spawn(move || {
                loop {
                    match stream.recv() {
                        Ok(Some(value)) => match serde_json::from_value::<SessionChunk>(value) {
                            Ok(chunk) => {
                                if chunks.send(chunk).is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                warn!(target: EXEC_TARGET, %error, "discarding malformed session output");
                            }
                        },
                        Ok(None) => break,
                        Err(error) => {
                            warn!(target: EXEC_TARGET, %error, "exec stream failed");
                            break;
                        }
                    }
                }
                *slot(&input) = None;
            })
            .map_err(|err| RpcStatus::unavailable(format!("cannot read exec stream: {err}")))?;
        Ok(receiver)
    }
}
