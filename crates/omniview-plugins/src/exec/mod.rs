//! Interactive terminal sessions backed by pseudo-terminals.
//!
//! A plugin registers one [`ExecHandler`] per resource type it can open a
//! shell into. The [`SessionManager`] turns a handler's [`CommandSpec`] into
//! a running process on a fresh pty, buffers its output for replay and, while
//! a session is attached, republishes every chunk to subscribers. All
//! sessions share a single bidirectional stream on the wire; each
//! [`SessionChunk`] carries its session ID.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::context::PluginContext;
use crate::rpc::RpcStatus;

mod pty;
mod session;

pub use pty::NativePtyBackend;
pub use session::{DEFAULT_REPLAY_LIMIT, SessionManager};

/// Log target for exec sessions.
pub(crate) const EXEC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::exec");

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

impl TerminalSize {
    /// Creates a size.
    #[must_use]
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    const fn is_empty(self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// Request to open a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Command line requested by the user; handlers may ignore or extend it.
    #[serde(default)]
    pub command: Vec<String>,
    /// Resource type the session targets; empty runs `command` directly.
    #[serde(default)]
    pub resource_key: String,
    /// The resource instance, as returned by the resource capability.
    #[serde(default)]
    pub resource_data: Value,
    /// Free-form labels shown in the session list.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Extra environment for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Initial size; defaults to 24x80.
    #[serde(default)]
    pub size: Option<TerminalSize>,
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Generated session ID.
    pub id: String,
    /// Command line that was started.
    pub command: Vec<String>,
    /// Resource type the session targets.
    #[serde(default)]
    pub resource_key: String,
    /// Labels supplied at creation.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Whether output is broadcast live.
    pub attached: bool,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A slice of session traffic.
///
/// Plugin to host the bytes are process output; host to plugin they are
/// keyboard input. `eof` marks the final chunk of a session that ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChunk {
    /// Session the bytes belong to.
    pub session_id: String,
    /// Raw terminal bytes, base64 on the wire.
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    /// The session has ended.
    #[serde(default)]
    pub eof: bool,
}

impl SessionChunk {
    /// A data chunk.
    #[must_use]
    pub fn data(session_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            data,
            eof: false,
        }
    }

    /// The end-of-session marker.
    #[must_use]
    pub fn eof(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            data: Vec::new(),
            eof: true,
        }
    }
}

/// Result of attaching: the session and everything it has buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedSession {
    /// Session state after attaching.
    pub session: SessionInfo,
    /// Replay buffer contents at the moment of attaching.
    #[serde(with = "base64_bytes", default)]
    pub buffer: Vec<u8>,
}

/// What an [`ExecHandler`] serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecHandlerInfo {
    /// Resource type key, e.g. `core::v1::Pod`.
    pub resource_key: String,
    /// Action label, e.g. "Open shell".
    pub label: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
}

/// Process to start on a pty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl CommandSpec {
    /// Builds a spec from a command line; `None` when it is empty.
    #[must_use]
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
            cwd: None,
        })
    }

    /// The full command line.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Turns a session request for one resource type into a command.
pub trait ExecHandler: Send + Sync {
    /// Describes the handler.
    fn info(&self) -> ExecHandlerInfo;

    /// Builds the command for `options`.
    ///
    /// # Errors
    ///
    /// Returns the status explaining why no command can be built, e.g. the
    /// resource data lacks a container name.
    fn command(&self, ctx: &PluginContext, options: &SessionOptions) -> Result<CommandSpec, RpcStatus>;
}

/// Control over a running pty process.
pub trait PtyControl: Send {
    /// Changes the terminal size.
    ///
    /// # Errors
    ///
    /// Returns the pty error.
    fn resize(&mut self, size: TerminalSize) -> io::Result<()>;

    /// Hard-stops the process.
    ///
    /// # Errors
    ///
    /// Returns the signal error.
    fn kill(&mut self) -> io::Result<()>;
}

/// A started process: output, input and control.
pub struct PtyProcess {
    /// Process output.
    pub reader: Box<dyn Read + Send>,
    /// Process input.
    pub writer: Box<dyn Write + Send>,
    /// Resize and kill.
    pub control: Box<dyn PtyControl>,
}

/// Starts processes on pseudo-terminals.
pub trait PtyBackend: Send + Sync {
    /// Starts `spec` on a new pty of `size`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] when the pty or process cannot be
    /// created.
    fn spawn(&self, spec: &CommandSpec, size: TerminalSize) -> Result<PtyProcess, ExecError>;
}

/// Session manager failures.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// No session has this ID.
    #[error("session '{id}' not found")]
    SessionNotFound {
        /// Requested ID.
        id: String,
    },
    /// No handler serves the resource type.
    #[error("no exec handler for resource type '{resource_key}'")]
    NoHandler {
        /// Requested resource type.
        resource_key: String,
    },
    /// Neither a handler nor the request supplied a command.
    #[error("session request has no command")]
    EmptyCommand,
    /// A terminal dimension is zero.
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
    /// The pty or process could not be started.
    #[error("failed to start session: {message}")]
    Spawn {
        /// Backend message.
        message: String,
    },
    /// Reading, writing or signalling the pty failed.
    #[error("session I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl ExecError {
    /// Builds [`ExecError::Spawn`].
    #[must_use]
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }
}

impl From<io::Error> for ExecError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<ExecError> for RpcStatus {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::SessionNotFound { .. } | ExecError::NoHandler { .. } => {
                Self::not_found(error.to_string())
            }
            ExecError::EmptyCommand | ExecError::InvalidSize { .. } => {
                Self::invalid_argument(error.to_string())
            }
            ExecError::Spawn { .. } | ExecError::Io(_) => Self::internal(error.to_string()),
        }
    }
}

/// The exec capability.
pub trait ExecProvider: Send + Sync {
    /// Resource types with an exec handler.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn supported_resources(&self, ctx: &PluginContext) -> Result<Vec<ExecHandlerInfo>, RpcStatus>;

    /// Starts a session, detached.
    ///
    /// # Errors
    ///
    /// `not_found` without a handler, `invalid_argument` for an empty
    /// command or size, `internal` when the process cannot start.
    fn create_session(&self, ctx: &PluginContext, options: SessionOptions) -> Result<SessionInfo, RpcStatus>;

    /// Returns the replay buffer and turns live output on.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions.
    fn attach_session(&self, ctx: &PluginContext, id: &str) -> Result<AttachedSession, RpcStatus>;

    /// Turns live output off; the process keeps running and buffering.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions.
    fn detach_session(&self, ctx: &PluginContext, id: &str) -> Result<SessionInfo, RpcStatus>;

    /// Ends a session.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions.
    fn close_session(&self, ctx: &PluginContext, id: &str) -> Result<(), RpcStatus>;

    /// Resizes a session's terminal.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions, `invalid_argument` for zero sizes.
    fn resize_session(&self, ctx: &PluginContext, id: &str, size: TerminalSize) -> Result<(), RpcStatus>;

    /// Writes keyboard input.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions, `internal` on I/O failure.
    fn write_session(&self, ctx: &PluginContext, id: &str, data: &[u8]) -> Result<(), RpcStatus>;

    /// Every live session.
    ///
    /// # Errors
    ///
    /// Transport failures when remote.
    fn list_sessions(&self, ctx: &PluginContext) -> Result<Vec<SessionInfo>, RpcStatus>;

    /// One session.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown sessions.
    fn get_session(&self, ctx: &PluginContext, id: &str) -> Result<SessionInfo, RpcStatus>;

    /// Live output of every attached session.
    ///
    /// # Errors
    ///
    /// `unavailable` when the stream cannot be opened.
    fn subscribe(&self, ctx: &PluginContext) -> Result<Receiver<SessionChunk>, RpcStatus>;
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
