//! Session registry, replay buffers and output pumps.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AttachedSession, CommandSpec, EXEC_TARGET, ExecError, ExecHandler, ExecHandlerInfo,
    ExecProvider, PtyBackend, PtyControl, SessionChunk, SessionInfo, SessionOptions,
    TerminalSize,
};
use crate::context::PluginContext;
use crate::lifetime::CancellationToken;
use crate::rpc::RpcStatus;

/// Bytes of output kept per session for replay on attach.
pub const DEFAULT_REPLAY_LIMIT: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;
const SUBSCRIBER_BUFFER: usize = 256;

/// Bounded scrollback; the oldest bytes are dropped first.
#[derive(Debug)]
pub(crate) struct ReplayBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
}

impl ReplayBuffer {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.bytes.extend(data);
        let excess = self.bytes.len().saturating_sub(self.limit);
        self.bytes.drain(..excess);
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

struct SessionEntry {
    info: SessionInfo,
    buffer: ReplayBuffer,
    writer: SharedWriter,
    control: Box<dyn PtyControl>,
    lifetime: CancellationToken,
}

type Subscriber = (u64, SyncSender<SessionChunk>);

#[derive(Default)]
struct State {
    sessions: HashMap<String, SessionEntry>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

struct Shared {
    state: Mutex<State>,
    replay_limit: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Buffers output and returns who should see it live, or `None` once
    /// the session is gone.
    fn record(&self, id: &str, data: &[u8]) -> Option<Vec<Subscriber>> {
        let mut state = self.lock();
        let entry = state.sessions.get_mut(id)?;
        entry.buffer.push(data);
        if entry.info.attached {
            Some(state.subscribers.clone())
        } else {
            Some(Vec::new())
        }
    }

    /// Removes the session if it is still registered; returns the
    /// subscribers to notify of the end.
    fn finish(&self, id: &str) -> Vec<Subscriber> {
        let mut state = self.lock();
        if let Some(mut entry) = state.sessions.remove(id) {
            entry.lifetime.cancel();
            if let Err(error) = entry.control.kill() {
                debug!(target: EXEC_TARGET, session = id, %error, "process already gone");
            }
        }
        state.subscribers.clone()
    }

    fn broadcast(&self, targets: Vec<Subscriber>, chunk: &SessionChunk) {
        let mut dead = Vec::new();
        for (subscriber, sender) in targets {
            if sender.send(chunk.clone()).is_err() {
                dead.push(subscriber);
            }
        }
        if !dead.is_empty() {
            self.lock()
                .subscribers
                .retain(|(subscriber, _)| !dead.contains(subscriber));
        }
    }
}

/// Owns every exec session of a plugin.
///
/// Session state, subscribers and pty handles sit behind one mutex shared
/// with the output pumps. Input goes through a per-session writer lock
/// taken after the registry lock is released, so a process that stops
/// reading its input stalls only writers to that session. Attaching snapshots the replay buffer and flips
/// the broadcast flag under that mutex, so every chunk lands either in the
/// snapshot or on the live stream, never both.
pub struct SessionManager {
    handlers: BTreeMap<String, Arc<dyn ExecHandler>>,
    backend: Arc<dyn PtyBackend>,
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Creates a manager starting processes through `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn PtyBackend>) -> Self {
        Self::with_replay_limit(backend, DEFAULT_REPLAY_LIMIT)
    }

    /// Creates a manager keeping `replay_limit` bytes per session.
    #[must_use]
    pub fn with_replay_limit(backend: Arc<dyn PtyBackend>, replay_limit: usize) -> Self {
        Self {
            handlers: BTreeMap::new(),
            backend,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                replay_limit,
            }),
        }
    }

    /// Registers a handler under its resource key.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ExecHandler>) -> Self {
        self.handlers.insert(handler.info().resource_key, handler);
        self
    }

    /// Handlers, sorted by resource key.
    #[must_use]
    pub fn handlers(&self) -> Vec<ExecHandlerInfo> {
        self.handlers.values().map(|handler| handler.info()).collect()
    }

    /// Starts a detached session.
    ///
    /// # Errors
    ///
    /// See [`ExecError`].
    pub fn create(&self, ctx: &PluginContext, options: SessionOptions) -> Result<SessionInfo, RpcStatus> {
        let size = options.size.unwrap_or_default();
        if size.is_empty() {
            return Err(ExecError::InvalidSize {
                rows: size.rows,
                cols: size.cols,
            }
            .into());
        }
        let mut spec = self.command_for(ctx, &options)?;
        spec.env.extend(options.env.clone());

        let process = self.backend.spawn(&spec, size)?;
        let id = Uuid::new_v4().to_string();
        let lifetime = CancellationToken::new();
        let info = SessionInfo {
            id: id.clone(),
            command: spec.command_line(),
            resource_key: options.resource_key,
            labels: options.labels,
            attached: false,
            created_at: OffsetDateTime::now_utc(),
        };

        self.shared.lock().sessions.insert(
            id.clone(),
            SessionEntry {
                info: info.clone(),
                buffer: ReplayBuffer::new(self.shared.replay_limit),
                writer: Arc::new(Mutex::new(process.writer)),
                control: process.control,
                lifetime: lifetime.clone(),
            },
        );

        let shared = Arc::clone(&self.shared);
        let pump_id = id.clone();
        let mut reader = process.reader;
        let spawned = thread::Builder::new()
            .name(format!("omniview-exec-{id}"))
            .spawn(move || pump(&shared, &pump_id, reader.as_mut(), &lifetime));
        if let Err(error) = spawned {
            drop(self.shared.finish(&id));
            return Err(ExecError::from(error).into());
        }
        info!(
            target: EXEC_TARGET,
            session = %id,
            command = ?info.command,
            "session started"
        );
        Ok(info)
    }

    fn command_for(&self, ctx: &PluginContext, options: &SessionOptions) -> Result<CommandSpec, RpcStatus> {
        if options.resource_key.is_empty() {
            return CommandSpec::from_command_line(&options.command)
                .ok_or_else(|| ExecError::EmptyCommand.into());
        }
        let handler = self
            .handlers
            .get(&options.resource_key)
            .ok_or_else(|| ExecError::NoHandler {
                resource_key: options.resource_key.clone(),
            })?;
        let spec = handler.command(ctx, options)?;
        if spec.program.is_empty() {
            return Err(ExecError::EmptyCommand.into());
        }
        Ok(spec)
    }

    /// Snapshots the replay buffer and turns live broadcast on.
    ///
    /// # Errors
    ///
    /// [`ExecError::SessionNotFound`].
    pub fn attach(&self, id: &str) -> Result<AttachedSession, ExecError> {
        let mut state = self.shared.lock();
        let entry = state.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.info.attached = true;
        Ok(AttachedSession {
            session: entry.info.clone(),
            buffer: entry.buffer.snapshot(),
        })
    }

    /// Turns live broadcast off.
    ///
    /// # Errors
    ///
    /// [`ExecError::SessionNotFound`].
    pub fn detach(&self, id: &str) -> Result<SessionInfo, ExecError> {
        let mut state = self.shared.lock();
        let entry = state.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.info.attached = false;
        Ok(entry.info.clone())
    }

    /// Writes input to the process.
    ///
    /// # Errors
    ///
    /// [`ExecError::SessionNotFound`] or [`ExecError::Io`].
    pub fn write(&self, id: &str, data: &[u8]) -> Result<(), ExecError> {
        let writer = self
            .shared
            .lock()
            .sessions
            .get(id)
            .map(|entry| Arc::clone(&entry.writer))
            .ok_or_else(|| not_found(id))?;
        let mut input = writer.lock().unwrap_or_else(|poison| poison.into_inner());
        input.write_all(data)?;
        input.flush()?;
        Ok(())
    }

    /// Resizes the terminal.
    ///
    /// # Errors
    ///
    /// [`ExecError::InvalidSize`], [`ExecError::SessionNotFound`] or
    /// [`ExecError::Io`].
    pub fn resize(&self, id: &str, size: TerminalSize) -> Result<(), ExecError> {
        if size.is_empty() {
            return Err(ExecError::InvalidSize {
                rows: size.rows,
                cols: size.cols,
            });
        }
        let mut state = self.shared.lock();
        let entry = state.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.control.resize(size)?;
        Ok(())
    }

    /// Cancels the session's lifetime, kills the process and forgets the
    /// session. The pump delivers the end-of-session chunk.
    ///
    /// # Errors
    ///
    /// [`ExecError::SessionNotFound`].
    pub fn close(&self, id: &str) -> Result<(), ExecError> {
        let mut entry = self
            .shared
            .lock()
            .sessions
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        entry.lifetime.cancel();
        if let Err(error) = entry.control.kill() {
            debug!(target: EXEC_TARGET, session = id, %error, "process already gone");
        }
        info!(target: EXEC_TARGET, session = id, "session closed");
        Ok(())
    }

    /// Live sessions, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .shared
            .lock()
            .sessions
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// One session.
    ///
    /// # Errors
    ///
    /// [`ExecError::SessionNotFound`].
    pub fn get(&self, id: &str) -> Result<SessionInfo, ExecError> {
        self.shared
            .lock()
            .sessions
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Receives live output of attached sessions and end-of-session chunks.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<SessionChunk> {
        let (sender, receiver) = mpsc::sync_channel(SUBSCRIBER_BUFFER);
        let mut state = self.shared.lock();
        let subscriber = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.push((subscriber, sender));
        receiver
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let ids: Vec<_> = self.shared.lock().sessions.keys().cloned().collect();
        for id in ids {
            drop(self.close(&id));
        }
    }
}

fn not_found(id: &str) -> ExecError {
    ExecError::SessionNotFound { id: id.to_owned() }
}

fn pump(shared: &Shared, id: &str, reader: &mut dyn Read, lifetime: &CancellationToken) {
    let mut buf = [0_u8; READ_CHUNK];
    while !lifetime.is_cancelled() {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => {
                debug!(target: EXEC_TARGET, session = id, %error, "pty read ended");
                break;
            }
        };
        let Some(data) = buf.get(..read) else {
            warn!(target: EXEC_TARGET, session = id, read, "pty reported an oversized read");
            break;
        };
        let Some(targets) = shared.record(id, data) else {
            break;
        };
        if !targets.is_empty() {
            shared.broadcast(targets, &SessionChunk::data(id, data.to_vec()));
        }
    }
    let targets = shared.finish(id);
    shared.broadcast(targets, &SessionChunk::eof(id));
    info!(target: EXEC_TARGET, session = id, "session ended");
}

impl ExecProvider for SessionManager {
    fn supported_resources(&self, _ctx: &PluginContext) -> Result<Vec<ExecHandlerInfo>, RpcStatus> {
        Ok(self.handlers())
    }

    fn create_session(&self, ctx: &PluginContext, options: SessionOptions) -> Result<SessionInfo, RpcStatus> {
        self.create(ctx, options)
    }

    fn attach_session(&self, _ctx: &PluginContext, id: &str) -> Result<AttachedSession, RpcStatus> {
        Ok(self.attach(id)?)
    }

    fn detach_session(&self, _ctx: &PluginContext, id: &str) -> Result<SessionInfo, RpcStatus> {
        Ok(self.detach(id)?)
    }

    fn close_session(&self, _ctx: &PluginContext, id: &str) -> Result<(), RpcStatus> {
        Ok(self.close(id)?)
    }

    fn resize_session(&self, _ctx: &PluginContext, id: &str, size: TerminalSize) -> Result<(), RpcStatus> {
        Ok(self.resize(id, size)?)
    }

    fn write_session(&self, _ctx: &PluginContext, id: &str, data: &[u8]) -> Result<(), RpcStatus> {
        Ok(self.write(id, data)?)
    }

    fn list_sessions(&self, _ctx: &PluginContext) -> Result<Vec<SessionInfo>, RpcStatus> {
        Ok(self.list())
    }

    fn get_session(&self, _ctx: &PluginContext, id: &str) -> Result<SessionInfo, RpcStatus> {
        Ok(self.get(id)?)
    }

    fn subscribe(&self, _ctx: &PluginContext) -> Result<Receiver<SessionChunk>, RpcStatus> {
        Ok(Self::subscribe(self))
    }
}
