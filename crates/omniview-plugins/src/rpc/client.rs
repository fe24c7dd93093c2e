//! Host side of a plugin connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::frame::{Frame, FrameReader, Metadata};
use super::status::RpcStatus;
use super::{RPC_TARGET, RpcError, SharedWriter, shared_writer, write_shared};
use crate::context::{DEFAULT_TIMEOUT, PLUGIN_CONTEXT_KEY, PluginContext};

/// Inbound messages buffered per client stream. A stream whose consumer
/// lets the buffer fill is aborted rather than stalling the connection.
const STREAM_BUFFER: usize = 64;

enum StreamEvent {
    Data(Value),
    Closed(Option<RpcStatus>),
}

/// How a stream ended when its close could not be queued behind the data.
type StreamEnding = Arc<OnceLock<Option<RpcStatus>>>;

#[derive(Clone)]
struct StreamSlot {
    sender: SyncSender<StreamEvent>,
    ending: StreamEnding,
}

impl StreamSlot {
    /// Queues `event` without blocking the reader. `false` once the stream
    /// is gone from the consumer's side or has been aborted.
    fn deliver(&self, id: u64, event: StreamEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(StreamEvent::Closed(status))) => {
                drop(self.ending.set(status));
                false
            }
            Err(TrySendError::Full(StreamEvent::Data(_))) => {
                warn!(target: RPC_TARGET, id, "stream consumer fell behind; aborting stream");
                drop(self.ending.set(Some(RpcStatus::resource_exhausted(format!(
                    "stream {id} consumer fell behind by {STREAM_BUFFER} messages"
                )))));
                false
            }
        }
    }
}

type Outcome = Result<Value, RpcStatus>;

struct ClientInner {
    writer: SharedWriter,
    pending: Mutex<HashMap<u64, SyncSender<Outcome>>>,
    streams: Mutex<HashMap<u64, StreamSlot>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ClientInner {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn take_pending(&self, id: u64) -> Option<SyncSender<Outcome>> {
        self.pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(&id)
    }

    fn stream_slot(&self, id: u64) -> Option<StreamSlot> {
        self.streams
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&id)
            .cloned()
    }

    fn remove_stream(&self, id: u64) -> Option<StreamSlot> {
        self.streams
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(&id)
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Response {
                id,
                payload,
                status,
            } => {
                let outcome = status.map_or(Ok(payload), Err);
                match self.take_pending(id) {
                    Some(sender) => drop(sender.try_send(outcome)),
                    None => debug!(target: RPC_TARGET, id, "dropping response for abandoned call"),
                }
            }
            Frame::StreamData { id, payload } => {
                if let Some(slot) = self.stream_slot(id)
                    && !slot.deliver(id, StreamEvent::Data(payload))
                    && self.remove_stream(id).is_some()
                    && slot.ending.get().is_some()
                {
                    drop(write_shared(&self.writer, &Frame::Cancel { id }));
                }
            }
            Frame::StreamClose { id, status } => {
                if let Some(slot) = self.remove_stream(id) {
                    slot.deliver(id, StreamEvent::Closed(status));
                }
            }
            other => warn!(
                target: RPC_TARGET,
                kind = other.kind(),
                "unexpected frame from plugin"
            ),
        }
    }

    fn shutdown(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .drain()
            .collect();
        for (_, sender) in pending {
            drop(sender.try_send(Err(RpcStatus::unavailable(reason))));
        }
        let streams: Vec<_> = self
            .streams
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .drain()
            .collect();
        for (id, slot) in streams {
            slot.deliver(id, StreamEvent::Closed(Some(RpcStatus::unavailable(reason))));
        }
    }
}

/// Issues calls to a plugin over one connection.
///
/// Cloning is cheap; clones share the connection. A background reader
/// thread routes responses to waiting callers and stream messages to their
/// streams.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Starts a client over an already-handshaken connection.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the reader thread cannot be spawned.
    pub fn start<R, W>(mut reader: FrameReader<R>, writer: W) -> Result<Self, RpcError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let inner = Arc::new(ClientInner {
            writer: shared_writer(writer),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let reader_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name(String::from("omniview-rpc-reader"))
            .spawn(move || {
                let reason = loop {
                    match reader.read_frame() {
                        Ok(Some(frame)) => reader_inner.dispatch(frame),
                        Ok(None) => break String::from("plugin connection closed"),
                        Err(error) => {
                            warn!(target: RPC_TARGET, %error, "plugin connection failed");
                            break error.to_string();
                        }
                    }
                };
                reader_inner.shutdown(&reason);
            })?;
        Ok(Self { inner })
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Issues a unary call and waits up to `timeout` for the response.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] when the connection is gone,
    /// [`RpcError::Timeout`] when no response arrives in time, and
    /// [`RpcError::Status`] when the plugin reports a failure.
    pub fn call(
        &self,
        service: &str,
        method: &str,
        context: Option<&PluginContext>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let metadata = metadata_for(context)?;
        let id = self.inner.allocate_id();
        let (sender, receiver) = mpsc::sync_channel(1);
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(id, sender);

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let request = Frame::Request {
            id,
            service: service.to_owned(),
            method: method.to_owned(),
            metadata,
            timeout_ms: Some(timeout_ms),
            payload,
        };
        if let Err(error) = write_shared(&self.inner.writer, &request) {
            self.inner.take_pending(id);
            return Err(error);
        }
        debug!(target: RPC_TARGET, id, service, method, "call issued");

        match receiver.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(RpcError::Status(status)),
            Err(RecvTimeoutError::Timeout) => {
                self.inner.take_pending(id);
                drop(write_shared(&self.inner.writer, &Frame::Cancel { id }));
                Err(RpcError::Timeout {
                    service: service.to_owned(),
                    method: method.to_owned(),
                    timeout_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Closed),
        }
    }

    /// Typed wrapper over [`RpcClient::call`] using the context's timeout.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::call`], plus [`RpcError::Encode`] and
    /// [`RpcError::Decode`] for payload conversion failures.
    pub fn invoke<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        context: Option<&PluginContext>,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(RpcError::Encode)?;
        let timeout = context.map_or(DEFAULT_TIMEOUT, |ctx| ctx.request_options().timeout);
        let response = self.call(service, method, context, payload, timeout)?;
        serde_json::from_value(response).map_err(RpcError::Decode)
    }

    /// Opens a bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] when the connection is gone, or the
    /// write error if the open frame cannot be sent.
    pub fn open_stream(
        &self,
        service: &str,
        method: &str,
        context: Option<&PluginContext>,
    ) -> Result<ClientStream, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let metadata = metadata_for(context)?;
        let id = self.inner.allocate_id();
        let (sender, receiver) = mpsc::sync_channel(STREAM_BUFFER);
        let ending = StreamEnding::default();
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(
                id,
                StreamSlot {
                    sender,
                    ending: Arc::clone(&ending),
                },
            );
        let open = Frame::StreamOpen {
            id,
            service: service.to_owned(),
            method: method.to_owned(),
            metadata,
        };
        if let Err(error) = write_shared(&self.inner.writer, &open) {
            self.inner.remove_stream(id);
            return Err(error);
        }
        Ok(ClientStream {
            sender: StreamSender {
                id,
                writer: Arc::clone(&self.inner.writer),
            },
            inner: Arc::clone(&self.inner),
            events: receiver,
            ending,
            finished: false,
        })
    }
}

fn metadata_for(context: Option<&PluginContext>) -> Result<Metadata, RpcError> {
    let mut metadata = Metadata::new();
    if let Some(ctx) = context {
        metadata.insert(PLUGIN_CONTEXT_KEY.to_owned(), ctx.to_metadata()?);
    }
    Ok(metadata)
}

/// Cloneable sending half of a [`ClientStream`].
#[derive(Clone)]
pub struct StreamSender {
    id: u64,
    writer: SharedWriter,
}

impl StreamSender {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the frame cannot be written.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), RpcError> {
        let payload = serde_json::to_value(message).map_err(RpcError::Encode)?;
        write_shared(
            &self.writer,
            &Frame::StreamData {
                id: self.id,
                payload,
            },
        )
    }

    /// Half-closes the stream: the server sees end of input.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the frame cannot be written.
    pub fn close(&self) -> Result<(), RpcError> {
        write_shared(
            &self.writer,
            &Frame::StreamClose {
                id: self.id,
                status: None,
            },
        )
    }
}

/// Client end of a bidirectional stream.
pub struct ClientStream {
    sender: StreamSender,
    inner: Arc<ClientInner>,
    events: Receiver<StreamEvent>,
    ending: StreamEnding,
    finished: bool,
}

impl ClientStream {
    /// Sending half, cloneable for use from another thread.
    #[must_use]
    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// See [`StreamSender::send`].
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), RpcError> {
        self.sender.send(message)
    }

    /// Receives the next message. `Ok(None)` means the server closed the
    /// stream cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Status`] when the server closed with a failure
    /// or the stream was aborted because this consumer fell behind
    /// (`resource_exhausted`), and [`RpcError::Closed`] if the connection
    /// dropped.
    pub fn recv(&mut self) -> Result<Option<Value>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        match self.events.recv() {
            Ok(event) => self.handle(event),
            Err(_) => self.disconnected(),
        }
    }

    /// As [`ClientStream::recv`], giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// As [`ClientStream::recv`], plus [`RpcError::Timeout`].
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Value>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => self.handle(event),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::Timeout {
                service: String::from("stream"),
                method: self.sender.id.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(RecvTimeoutError::Disconnected) => self.disconnected(),
        }
    }

    /// Every queued event has been consumed and the reader let go of the
    /// stream.
    fn disconnected(&mut self) -> Result<Option<Value>, RpcError> {
        self.finished = true;
        match self.ending.get() {
            Some(None) => Ok(None),
            Some(Some(status)) => Err(RpcError::Status(status.clone())),
            None => Err(RpcError::Closed),
        }
    }

    fn handle(&mut self, event: StreamEvent) -> Result<Option<Value>, RpcError> {
        match event {
            StreamEvent::Data(value) => Ok(Some(value)),
            StreamEvent::Closed(None) => {
                self.finished = true;
                Ok(None)
            }
            StreamEvent::Closed(Some(status)) => {
                self.finished = true;
                Err(RpcError::Status(status))
            }
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.inner.remove_stream(self.sender.id).is_some() && !self.inner.closed.load(Ordering::SeqCst) {
            drop(self.sender.close());
        }
    }
}
