//! Multiplexed RPC over a plugin's standard I/O.
//!
//! One persistent connection carries every capability service. Unary calls
//! are `request`/`response` frame pairs correlated by ID; bidirectional
//! streams are `stream_open`, any number of `stream_data` frames in both
//! directions, and `stream_close`. The [`RpcClient`] lives in the host, the
//! [`RpcServer`] in the plugin.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::context::{ContextError, PluginContext};
use crate::lifetime::CancellationToken;

mod client;
mod frame;
mod server;
mod status;

pub use client::{ClientStream, RpcClient, StreamSender};
pub use frame::{Frame, FrameReader, FrameWriter, MAX_FRAME_LEN, Metadata};
pub use server::{HEALTH_SERVICE, RpcServer, ServerStream, ServerStreamSender};
pub use status::{RpcStatus, StatusCode};

/// Log target for RPC plumbing.
pub(crate) const RPC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::rpc");

/// Writer shared by every thread answering on a connection.
pub(crate) type SharedWriter = Arc<Mutex<FrameWriter<Box<dyn io::Write + Send>>>>;

/// Wraps a byte sink in a [`SharedWriter`].
pub(crate) fn shared_writer<W: io::Write + Send + 'static>(writer: W) -> SharedWriter {
    let boxed: Box<dyn io::Write + Send> = Box::new(writer);
    Arc::new(Mutex::new(FrameWriter::new(boxed)))
}

/// Writes one frame through a [`SharedWriter`], recovering a poisoned lock.
pub(crate) fn write_shared(writer: &SharedWriter, frame: &Frame) -> Result<(), RpcError> {
    writer
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .write_frame(frame)
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Reading or writing the connection failed.
    #[error("transport I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
    /// A frame arrived without a `Content-Length` header.
    #[error("frame is missing its Content-Length header")]
    MissingContentLength,
    /// A header line could not be parsed.
    #[error("invalid frame header '{line}'")]
    InvalidHeader {
        /// Offending line.
        line: String,
    },
    /// A frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
    },
    /// A frame could not be serialised.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    /// A frame body is not valid JSON.
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    /// The plugin context could not be attached.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// The connection is closed.
    #[error("plugin connection closed")]
    Closed,
    /// No response arrived within the call budget.
    #[error("{service}/{method} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target service.
        service: String,
        /// Target method.
        method: String,
        /// Budget that elapsed.
        timeout_ms: u64,
    },
    /// The peer answered with a failure status.
    #[error(transparent)]
    Status(#[from] RpcStatus),
}

impl From<io::Error> for RpcError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<RpcError> for RpcStatus {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Status(status) => status,
            RpcError::Timeout { .. } => Self::new(StatusCode::DeadlineExceeded, error.to_string()),
            RpcError::Closed | RpcError::Io(_) => Self::unavailable(error.to_string()),
            RpcError::Context(_) => Self::invalid_argument(error.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Whether a call is unary or a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// One request, one response.
    Unary,
    /// Bidirectional stream.
    Stream,
}

impl CallKind {
    /// Name used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::Stream => "stream",
        }
    }
}

/// Server-side state for one inbound call.
///
/// Built by the server for each request; the context interceptor fills in
/// the plugin context before the handler runs.
#[derive(Debug)]
pub struct CallContext {
    service: String,
    method: String,
    kind: CallKind,
    metadata: Metadata,
    lifetime: CancellationToken,
    plugin_context: Option<PluginContext>,
    started: Instant,
}

impl CallContext {
    /// Creates the context for an inbound call.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        kind: CallKind,
        metadata: Metadata,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
            metadata,
            lifetime,
            plugin_context: None,
            started: Instant::now(),
        }
    }

    /// Target service.
    #[must_use]
    pub const fn service(&self) -> &str {
        self.service.as_str()
    }

    /// Target method.
    #[must_use]
    pub const fn method(&self) -> &str {
        self.method.as_str()
    }

    /// Call kind.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        self.kind
    }

    /// Raw metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The call's local lifetime.
    #[must_use]
    pub const fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// When the server accepted the call.
    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }

    /// The plugin context, when the caller supplied a decodable one.
    #[must_use]
    pub const fn plugin_context(&self) -> Option<&PluginContext> {
        self.plugin_context.as_ref()
    }

    /// The plugin context, or the `no plugin context` status.
    ///
    /// # Errors
    ///
    /// Returns [`RpcStatus::no_plugin_context`] when no context is attached.
    pub fn require_plugin_context(&self) -> Result<&PluginContext, RpcStatus> {
        self.plugin_context
            .as_ref()
            .ok_or_else(RpcStatus::no_plugin_context)
    }

    /// Replaces the attached plugin context.
    pub fn set_plugin_context(&mut self, context: Option<PluginContext>) {
        self.plugin_context = context;
    }
}

/// A named service exposed by an [`RpcServer`].
pub trait Service: Send + Sync {
    /// Handles a unary call.
    ///
    /// # Errors
    ///
    /// Returns the status reported to the caller.
    fn call(&self, call: &CallContext, payload: Value) -> Result<Value, RpcStatus>;

    /// Handles a bidirectional stream. Returning ends the stream.
    ///
    /// # Errors
    ///
    /// Returns the status reported to the caller in the closing frame.
    fn stream(&self, call: &CallContext, stream: ServerStream) -> Result<(), RpcStatus> {
        drop(stream);
        Err(RpcStatus::unimplemented(format!(
            "{} does not stream {}",
            call.service(),
            call.method()
        )))
    }
}

/// Decodes a request payload, mapping failures to `invalid_argument`.
///
/// # Errors
///
/// Returns `invalid_argument` when `payload` does not match `T`.
pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T, RpcStatus> {
    serde_json::from_value(payload)
        .map_err(|err| RpcStatus::invalid_argument(format!("malformed payload: {err}")))
}

/// Encodes a response payload, mapping failures to `internal`.
///
/// # Errors
///
/// Returns `internal` when `value` cannot be serialised.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Value, RpcStatus> {
    serde_json::to_value(value)
        .map_err(|err| RpcStatus::internal(format!("unencodable response: {err}")))
}
