//! Plugin side of a connection: routes inbound calls to services.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::frame::{Frame, FrameReader};
use super::status::RpcStatus;
use super::{
    CallContext, CallKind, RPC_TARGET, RpcError, Service, SharedWriter, shared_writer,
    write_shared,
};
use crate::interceptor::InterceptorChain;
use crate::lifetime::CancellationToken;

/// Inbound messages buffered per server stream. A handler that lets the
/// buffer fill has its stream closed with `resource_exhausted`.
const STREAM_BUFFER: usize = 64;

/// Name of the built-in health service.
pub const HEALTH_SERVICE: &str = "health";

struct HealthService;

impl Service for HealthService {
    fn call(&self, call: &CallContext, _payload: Value) -> Result<Value, RpcStatus> {
        match call.method() {
            "Check" => Ok(json!({ "status": "serving" })),
            other => Err(RpcStatus::unimplemented(format!("health/{other}"))),
        }
    }
}

/// Serves registered services over one connection.
///
/// Every unary call and every stream runs on its own thread, wrapped in the
/// interceptor chain. A `health` service answering `Check` is always
/// registered.
pub struct RpcServer {
    services: HashMap<String, Arc<dyn Service>>,
    chain: Arc<InterceptorChain>,
}

type InFlight = Arc<Mutex<HashMap<u64, CancellationToken>>>;

impl RpcServer {
    /// Creates a server with only the health service registered.
    #[must_use]
    pub fn new(chain: InterceptorChain) -> Self {
        let mut services: HashMap<String, Arc<dyn Service>> = HashMap::new();
        services.insert(String::from(HEALTH_SERVICE), Arc::new(HealthService));
        Self {
            services,
            chain: Arc::new(chain),
        }
    }

    /// Registers `service` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, service: Arc<dyn Service>) {
        self.services.insert(name.into(), service);
    }

    /// Names of registered services.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Serves until the peer closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the connection, if it did not
    /// end cleanly.
    pub fn serve<R, W>(self, reader: R, writer: W) -> Result<(), RpcError>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        self.serve_framed(FrameReader::new(reader), shared_writer(writer))
    }

    pub(crate) fn serve_framed<R: Read>(
        self,
        mut reader: FrameReader<R>,
        writer: SharedWriter,
    ) -> Result<(), RpcError> {
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let mut streams: HashMap<u64, SyncSender<Value>> = HashMap::new();

        let outcome = loop {
            let frame = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(error) => break Err(error),
            };
            match frame {
                Frame::Request {
                    id,
                    service,
                    method,
                    metadata,
                    timeout_ms,
                    payload,
                } => {
                    let lifetime = timeout_ms.map_or_else(CancellationToken::new, |ms| {
                        CancellationToken::with_timeout(Duration::from_millis(ms))
                    });
                    lock(&in_flight).insert(id, lifetime.clone());
                    let call = CallContext::new(service, method, CallKind::Unary, metadata, lifetime);
                    self.spawn_unary(id, call, payload, &writer, &in_flight);
                }
                Frame::Cancel { id } => {
                    streams.remove(&id);
                    if let Some(token) = lock(&in_flight).remove(&id) {
                        debug!(target: RPC_TARGET, id, "call cancelled by client");
                        token.cancel();
                    }
                }
                Frame::StreamOpen {
                    id,
                    service,
                    method,
                    metadata,
                } => {
                    let (sender, receiver) = mpsc::sync_channel(STREAM_BUFFER);
                    streams.insert(id, sender);
                    let lifetime = CancellationToken::new();
                    lock(&in_flight).insert(id, lifetime.clone());
                    let call = CallContext::new(service, method, CallKind::Stream, metadata, lifetime);
                    self.spawn_stream(id, call, receiver, &writer, &in_flight);
                }
                Frame::StreamData { id, payload } => {
                    let Some(sender) = streams.get(&id) else {
                        continue;
                    };
                    match sender.try_send(payload) {
                        Ok(()) => {}
                        Err(TrySendError::Disconnected(_)) => {
                            streams.remove(&id);
                        }
                        Err(TrySendError::Full(_)) => {
                            warn!(target: RPC_TARGET, id, "stream handler fell behind; closing stream");
                            // The close goes out before the handler can see
                            // end of input and report a clean finish.
                            let status = RpcStatus::resource_exhausted(format!(
                                "stream {id} handler fell behind by {STREAM_BUFFER} messages"
                            ));
                            if let Err(error) = write_shared(
                                &writer,
                                &Frame::StreamClose {
                                    id,
                                    status: Some(status),
                                },
                            ) {
                                warn!(target: RPC_TARGET, id, %error, "failed to close stream");
                            }
                            streams.remove(&id);
                            if let Some(token) = lock(&in_flight).remove(&id) {
                                token.cancel();
                            }
                        }
                    }
                }
                Frame::StreamClose { id, .. } => {
                    streams.remove(&id);
                }
                other => warn!(
                    target: RPC_TARGET,
                    kind = other.kind(),
                    "unexpected frame from host"
                ),
            }
        };

        for (_, token) in lock(&in_flight).drain() {
            token.cancel();
        }
        outcome
    }

    fn spawn_unary(
        &self,
        id: u64,
        mut call: CallContext,
        payload: Value,
        writer: &SharedWriter,
        in_flight: &InFlight,
    ) {
        let service = self.services.get(call.service()).cloned();
        let chain = Arc::clone(&self.chain);
        let thread_writer = Arc::clone(writer);
        let thread_in_flight = Arc::clone(in_flight);
        let spawned = thread::Builder::new()
            .name(format!("omniview-rpc-call-{id}"))
            .spawn(move || {
                let mut body = Some(payload);
                let outcome = chain.run(&mut call, &mut |call| {
                    let Some(service) = service.as_ref() else {
                        return Err(RpcStatus::unimplemented(format!(
                            "unknown service '{}'",
                            call.service()
                        )));
                    };
                    service.call(call, body.take().unwrap_or(Value::Null))
                });
                lock(&thread_in_flight).remove(&id);
                let response = match outcome {
                    Ok(payload) => Frame::Response {
                        id,
                        payload,
                        status: None,
                    },
                    Err(status) => Frame::Response {
                        id,
                        payload: Value::Null,
                        status: Some(status),
                    },
                };
                if let Err(error) = write_shared(&thread_writer, &response) {
                    warn!(target: RPC_TARGET, id, %error, "failed to write response");
                }
            });
        if let Err(error) = spawned {
            lock(in_flight).remove(&id);
            let status = RpcStatus::unavailable(format!("cannot spawn call thread: {error}"));
            drop(write_shared(
                writer,
                &Frame::Response {
                    id,
                    payload: Value::Null,
                    status: Some(status),
                },
            ));
        }
    }

    fn spawn_stream(
        &self,
        id: u64,
        mut call: CallContext,
        inbound: Receiver<Value>,
        writer: &SharedWriter,
        in_flight: &InFlight,
    ) {
        let service = self.services.get(call.service()).cloned();
        let chain = Arc::clone(&self.chain);
        let thread_writer = Arc::clone(writer);
        let thread_in_flight = Arc::clone(in_flight);
        let spawned = thread::Builder::new()
            .name(format!("omniview-rpc-stream-{id}"))
            .spawn(move || {
                let mut stream = Some(ServerStream {
                    sender: ServerStreamSender {
                        id,
                        writer: Arc::clone(&thread_writer),
                    },
                    inbound,
                });
                let outcome = chain.run(&mut call, &mut |call| {
                    let Some(service) = service.as_ref() else {
                        return Err(RpcStatus::unimplemented(format!(
                            "unknown service '{}'",
                            call.service()
                        )));
                    };
                    let Some(stream) = stream.take() else {
                        return Err(RpcStatus::internal("stream handler ran twice"));
                    };
                    service.stream(call, stream).map(|()| Value::Null)
                });
                lock(&thread_in_flight).remove(&id);
                let close = Frame::StreamClose {
                    id,
                    status: outcome.err(),
                };
                if let Err(error) = write_shared(&thread_writer, &close) {
                    warn!(target: RPC_TARGET, id, %error, "failed to close stream");
                }
            });
        if let Err(error) = spawned {
            lock(in_flight).remove(&id);
            let status = RpcStatus::unavailable(format!("cannot spawn stream thread: {error}"));
            drop(write_shared(
                writer,
                &Frame::StreamClose {
                    id,
                    status: Some(status),
                },
            ));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Cloneable sending half of a [`ServerStream`].
#[derive(Clone)]
pub struct ServerStreamSender {
    id: u64,
    writer: SharedWriter,
}

impl ServerStreamSender {
    /// Sends one message to the client.
    ///
    /// # Errors
    ///
    /// Returns `internal` if the message cannot be encoded and `unavailable`
    /// if the connection is gone.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), RpcStatus> {
        let payload = serde_json::to_value(message)
            .map_err(|err| RpcStatus::internal(format!("unencodable stream message: {err}")))?;
        write_shared(
            &self.writer,
            &Frame::StreamData {
                id: self.id,
                payload,
            },
        )
        .map_err(RpcStatus::from)
    }
}

/// Server end of a bidirectional stream handed to [`Service::stream`].
pub struct ServerStream {
    sender: ServerStreamSender,
    inbound: Receiver<Value>,
}

impl ServerStream {
    /// Sends one message to the client.
    ///
    /// # Errors
    ///
    /// See [`ServerStreamSender::send`].
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), RpcStatus> {
        self.sender.send(message)
    }

    /// Receives the next client message; `None` once the client half-closes
    /// or disconnects.
    #[must_use]
    pub fn recv(&self) -> Option<Value> {
        self.inbound.recv().ok()
    }

    /// Splits into a cloneable sender and the inbound receiver.
    #[must_use]
    pub fn split(self) -> (ServerStreamSender, Receiver<Value>) {
        (self.sender, self.inbound)
    }
}
