//! Informer bridge: turns a backend watch into add, update and delete
//! events on bounded channels.
//!
//! ```text
//!            initialize              start                stop
//! NotReady ─────────────▶ Ready ─────────────▶ Running ─────────▶ Stopped
//!                           ▲                                       │
//!                           └──────────── initialize / start ───────┘
//! ```
//!
//! Any state moves to the absorbing `Error` state when the initial cache
//! sync fails or times out, or when a synced watch fails. A watch that ends
//! cleanly without being stopped leaves the bridge `Stopped`.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lifetime::CancellationToken;
use crate::resource::{EventKind, ResourceEvent};
use crate::rpc::{RpcStatus, StatusCode};

mod manager;
mod router;

pub use manager::{InformerFactory, InformerManager};
pub use router::EventRouter;

/// Log target for informers.
pub(crate) const INFORMER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::informer");

/// Default bound on the initial cache sync.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable through which the host sets the sync bound, in
/// milliseconds.
pub const SYNC_TIMEOUT_ENV: &str = "OMNIVIEW_INFORMER_SYNC_TIMEOUT_MS";

/// Sync bound from [`SYNC_TIMEOUT_ENV`], or [`DEFAULT_SYNC_TIMEOUT`] when it
/// is unset or not a positive integer.
#[must_use]
pub fn sync_timeout_from_env() -> Duration {
    parse_sync_timeout(std::env::var(SYNC_TIMEOUT_ENV).ok().as_deref())
}

fn parse_sync_timeout(raw: Option<&str>) -> Duration {
    raw.and_then(|millis| millis.trim().parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map_or(DEFAULT_SYNC_TIMEOUT, Duration::from_millis)
}

/// Default capacity of each event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

const SEND_RETRY: Duration = Duration::from_millis(10);
const RUN_POLL: Duration = Duration::from_millis(100);

/// Lifecycle state of an informer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InformerState {
    /// Created, not yet wired.
    NotReady,
    /// Wired to channels, not watching.
    Ready,
    /// Watching and synced.
    Running,
    /// Watch stopped; wiring kept.
    Stopped,
    /// Sync failed. Absorbing.
    Error,
}

impl InformerState {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for InformerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informer lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InformerError {
    /// An output channel was not supplied.
    #[error("informer {kind:?} channel is missing")]
    MissingChannel {
        /// Which channel.
        kind: EventKind,
    },
    /// Re-initialising with a different resource type.
    #[error("informer resource type cannot change from {current} to {requested}")]
    ResourceTypeChanged {
        /// Type already wired.
        current: String,
        /// Type requested.
        requested: String,
    },
    /// The operation is not valid in the current state.
    #[error("cannot {operation} an informer in state {state}")]
    InvalidTransition {
        /// Attempted operation.
        operation: &'static str,
        /// State at the time.
        state: InformerState,
    },
    /// The initial cache sync did not finish in time.
    #[error("informer for {resource_key} did not sync within {timeout_ms}ms")]
    SyncTimeout {
        /// Watched type.
        resource_key: String,
        /// Budget that elapsed.
        timeout_ms: u64,
    },
    /// The watch ended before syncing, or its thread could not start.
    #[error("informer for {resource_key} failed: {message}")]
    WatchFailed {
        /// Watched type.
        resource_key: String,
        /// What went wrong.
        message: String,
    },
    /// The informer factory failed.
    #[error("cannot build informers: {0}")]
    Factory(RpcStatus),
}

impl From<InformerError> for RpcStatus {
    fn from(error: InformerError) -> Self {
        let code = match &error {
            InformerError::Factory(status) => status.code,
            InformerError::SyncTimeout { .. } => StatusCode::DeadlineExceeded,
            InformerError::WatchFailed { .. } => StatusCode::Unavailable,
            InformerError::MissingChannel { .. } => StatusCode::InvalidArgument,
            InformerError::ResourceTypeChanged { .. } | InformerError::InvalidTransition { .. } => {
                StatusCode::FailedPrecondition
            }
        };
        Self::new(code, error.to_string())
    }
}

/// Callbacks a [`WatchSource`] drives. Objects arrive type-erased and are
/// downcast to the informer's element type.
pub trait WatchHandler: Send + Sync {
    /// An object appeared.
    fn on_add(&self, object: Box<dyn Any + Send>);
    /// An object changed.
    fn on_update(&self, previous: Box<dyn Any + Send>, current: Box<dyn Any + Send>);
    /// An object disappeared.
    fn on_delete(&self, object: Box<dyn Any + Send>);
    /// The initial listing has been delivered.
    fn on_synced(&self);
}

/// A backend change stream, e.g. a Kubernetes watch.
pub trait WatchSource: Send + Sync {
    /// Streams changes into `handler` until `stop` fires. Must call
    /// [`WatchHandler::on_synced`] once the initial state is delivered and
    /// return promptly after `stop` fires.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the watch early.
    fn watch(&self, handler: &dyn WatchHandler, stop: &CancellationToken) -> Result<(), RpcStatus>;
}

/// Sending halves of the three event channels.
#[derive(Debug, Clone, Default)]
pub struct EventChannels {
    add: Option<SyncSender<ResourceEvent>>,
    update: Option<SyncSender<ResourceEvent>>,
    delete: Option<SyncSender<ResourceEvent>>,
}

/// Receiving halves of the three event channels.
#[derive(Debug)]
pub struct EventReceivers {
    /// Add events.
    pub add: Receiver<ResourceEvent>,
    /// Update events.
    pub update: Receiver<ResourceEvent>,
    /// Delete events.
    pub delete: Receiver<ResourceEvent>,
}

impl EventChannels {
    /// Creates three channels of `capacity` each.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, EventReceivers) {
        let (add, add_rx) = mpsc::sync_channel(capacity);
        let (update, update_rx) = mpsc::sync_channel(capacity);
        let (delete, delete_rx) = mpsc::sync_channel(capacity);
        (
            Self {
                add: Some(add),
                update: Some(update),
                delete: Some(delete),
            },
            EventReceivers {
                add: add_rx,
                update: update_rx,
                delete: delete_rx,
            },
        )
    }

    /// Replaces the channel for `kind`.
    #[must_use]
    pub fn with(mut self, kind: EventKind, sender: SyncSender<ResourceEvent>) -> Self {
        *self.slot(kind) = Some(sender);
        self
    }

    const fn slot(&mut self, kind: EventKind) -> &mut Option<SyncSender<ResourceEvent>> {
        match kind {
            EventKind::Add => &mut self.add,
            EventKind::Update => &mut self.update,
            EventKind::Delete => &mut self.delete,
        }
    }

    fn complete(self) -> Result<Outputs, InformerError> {
        let missing = |kind| InformerError::MissingChannel { kind };
        Ok(Outputs {
            add: self.add.ok_or_else(|| missing(EventKind::Add))?,
            update: self.update.ok_or_else(|| missing(EventKind::Update))?,
            delete: self.delete.ok_or_else(|| missing(EventKind::Delete))?,
        })
    }
}

#[derive(Debug)]
struct Outputs {
    add: SyncSender<ResourceEvent>,
    update: SyncSender<ResourceEvent>,
    delete: SyncSender<ResourceEvent>,
}

#[derive(Debug)]
struct Wiring {
    connection: String,
    resource_key: String,
    outputs: Outputs,
}

/// Set by the watch thread when the watch returns without being stopped:
/// `None` for a clean return, the failure otherwise.
type WatchExit = Arc<OnceLock<Option<RpcStatus>>>;

struct RunningWatch {
    stop: CancellationToken,
    exit: WatchExit,
    thread: JoinHandle<()>,
}

impl RunningWatch {
    fn shut_down(self) {
        self.stop.cancel();
        if self.thread.join().is_err() {
            warn!(target: INFORMER_TARGET, "watch thread panicked");
        }
    }
}

struct BridgeState {
    state: InformerState,
    wiring: Option<Arc<Wiring>>,
    watch: Option<RunningWatch>,
    failure: Option<InformerError>,
}

impl BridgeState {
    /// Folds an exited watch thread into the lifecycle state.
    fn settle(&mut self) {
        if self.state != InformerState::Running {
            return;
        }
        let Some(exit) = self.watch.as_ref().and_then(|watch| watch.exit.get().cloned()) else {
            return;
        };
        if let Some(watch) = self.watch.take() {
            watch.shut_down();
        }
        let resource_key = self
            .wiring
            .as_ref()
            .map(|wiring| wiring.resource_key.clone())
            .unwrap_or_default();
        match exit {
            Some(status) => {
                warn!(
                    target: INFORMER_TARGET,
                    resource_key = %resource_key,
                    "informer failed after sync"
                );
                self.state = InformerState::Error;
                self.failure = Some(InformerError::WatchFailed {
                    resource_key,
                    message: status.to_string(),
                });
            }
            None => {
                debug!(
                    target: INFORMER_TARGET,
                    resource_key = %resource_key,
                    "watch ended on its own; informer stopped"
                );
                self.state = InformerState::Stopped;
            }
        }
    }
}

/// Object-safe view of an [`EventBridge`], used by the
/// [`InformerManager`].
pub trait Informer: Send + Sync {
    /// Wires the informer to `connection` and the output channels.
    ///
    /// # Errors
    ///
    /// See [`EventBridge::initialize`].
    fn initialize(
        &self,
        connection: &str,
        resource_key: &str,
        channels: EventChannels,
    ) -> Result<(), InformerError>;

    /// Starts watching.
    ///
    /// # Errors
    ///
    /// See [`EventBridge::start`].
    fn start(&self) -> Result<(), InformerError>;

    /// Stops watching.
    ///
    /// # Errors
    ///
    /// See [`EventBridge::stop`].
    fn stop(&self) -> Result<(), InformerError>;

    /// Current state.
    fn state(&self) -> InformerState;
}

/// Bridges a [`WatchSource`] emitting `T` objects to event channels.
pub struct EventBridge<T> {
    source: Arc<dyn WatchSource>,
    sync_timeout: Duration,
    inner: RwLock<BridgeState>,
    element: PhantomData<fn() -> T>,
}

impl<T> EventBridge<T>
where
    T: Serialize + Send + 'static,
{
    /// Creates an unwired bridge over `source`, bounded by
    /// [`sync_timeout_from_env`].
    #[must_use]
    pub fn new(source: Arc<dyn WatchSource>) -> Self {
        Self::with_sync_timeout(source, sync_timeout_from_env())
    }

    /// As [`EventBridge::new`] with a custom sync bound.
    #[must_use]
    pub fn with_sync_timeout(source: Arc<dyn WatchSource>, sync_timeout: Duration) -> Self {
        Self {
            source,
            sync_timeout,
            inner: RwLock::new(BridgeState {
                state: InformerState::NotReady,
                wiring: None,
                watch: None,
                failure: None,
            }),
            element: PhantomData,
        }
    }

    /// Current state. A watch that has ended since the last look is
    /// accounted for first.
    #[must_use]
    pub fn state(&self) -> InformerState {
        let mut inner = self.write();
        inner.settle();
        inner.state
    }

    /// Moves `NotReady` or `Stopped` to `Ready`, wiring the callbacks.
    ///
    /// # Errors
    ///
    /// [`InformerError::MissingChannel`] when a channel is absent,
    /// [`InformerError::ResourceTypeChanged`] when re-initialising with a
    /// different type, [`InformerError::InvalidTransition`] from any other
    /// state.
    pub fn initialize(
        &self,
        connection: &str,
        resource_key: &str,
        channels: EventChannels,
    ) -> Result<(), InformerError> {
        let mut inner = self.write();
        inner.settle();
        if !matches!(inner.state, InformerState::NotReady | InformerState::Stopped) {
            return Err(InformerError::InvalidTransition {
                operation: "initialize",
                state: inner.state,
            });
        }
        if let Some(wiring) = &inner.wiring {
            if wiring.resource_key != resource_key {
                return Err(InformerError::ResourceTypeChanged {
                    current: wiring.resource_key.clone(),
                    requested: resource_key.to_owned(),
                });
            }
        }
        let outputs = channels.complete()?;
        inner.wiring = Some(Arc::new(Wiring {
            connection: connection.to_owned(),
            resource_key: resource_key.to_owned(),
            outputs,
        }));
        inner.state = InformerState::Ready;
        Ok(())
    }

    /// Moves `Ready` or `Stopped` to `Running`: launches the watch and
    /// waits for its initial sync. Starting a running bridge is a no-op.
    ///
    /// # Errors
    ///
    /// [`InformerError::SyncTimeout`] or [`InformerError::WatchFailed`],
    /// after which the bridge is in `Error` and the watch has been torn
    /// down; [`InformerError::InvalidTransition`] from other states.
    pub fn start(&self) -> Result<(), InformerError> {
        let mut inner = self.write();
        inner.settle();
        match inner.state {
            InformerState::Running => return Ok(()),
            InformerState::Ready | InformerState::Stopped => {}
            state => {
                return Err(InformerError::InvalidTransition {
                    operation: "start",
                    state,
                });
            }
        }
        let Some(wiring) = inner.wiring.clone() else {
            return Err(InformerError::InvalidTransition {
                operation: "start",
                state: inner.state,
            });
        };

        let stop = CancellationToken::new();
        let (synced_tx, synced_rx) = mpsc::sync_channel(1);
        let handler = BridgeHandler::<T> {
            wiring: Arc::clone(&wiring),
            stop: stop.clone(),
            synced: Mutex::new(Some(synced_tx)),
            element: PhantomData,
        };
        let source = Arc::clone(&self.source);
        let thread_stop = stop.clone();
        let exit = WatchExit::default();
        let thread_exit = Arc::clone(&exit);
        let key = wiring.resource_key.clone();
        let spawned = thread::Builder::new()
            .name(format!("omniview-informer-{key}"))
            .spawn(move || {
                let outcome = source.watch(&handler, &thread_stop);
                if let Err(status) = &outcome {
                    warn!(
                        target: INFORMER_TARGET,
                        resource_key = %handler.wiring.resource_key,
                        %status,
                        "watch ended with an error"
                    );
                }
                if !thread_stop.is_cancelled() {
                    drop(thread_exit.set(outcome.err()));
                }
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(error) => {
                inner.state = InformerState::Error;
                return Err(InformerError::WatchFailed {
                    resource_key: key,
                    message: error.to_string(),
                });
            }
        };
        let watch = RunningWatch { stop, exit, thread };

        match synced_rx.recv_timeout(self.sync_timeout) {
            Ok(()) => {
                info!(
                    target: INFORMER_TARGET,
                    resource_key = %key,
                    connection = %wiring.connection,
                    "informer synced"
                );
                inner.watch = Some(watch);
                inner.state = InformerState::Running;
                inner.failure = None;
                Ok(())
            }
            Err(reason) => {
                watch.shut_down();
                inner.state = InformerState::Error;
                Err(match reason {
                    RecvTimeoutError::Timeout => InformerError::SyncTimeout {
                        resource_key: key,
                        timeout_ms: u64::try_from(self.sync_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    },
                    RecvTimeoutError::Disconnected => InformerError::WatchFailed {
                        resource_key: key,
                        message: String::from("watch ended before the initial sync"),
                    },
                })
            }
        }
    }

    /// Moves `Running` to `Stopped`, keeping the wiring. Stopping a stopped
    /// bridge is a no-op.
    ///
    /// # Errors
    ///
    /// [`InformerError::InvalidTransition`] from other states.
    pub fn stop(&self) -> Result<(), InformerError> {
        let mut inner = self.write();
        inner.settle();
        match inner.state {
            InformerState::Stopped => Ok(()),
            InformerState::Running => {
                if let Some(watch) = inner.watch.take() {
                    watch.shut_down();
                }
                inner.state = InformerState::Stopped;
                debug!(target: INFORMER_TARGET, "informer stopped");
                Ok(())
            }
            state => Err(InformerError::InvalidTransition {
                operation: "stop",
                state,
            }),
        }
    }

    /// Starts, then blocks until `stop` fires or the bridge leaves
    /// `Running`.
    ///
    /// # Errors
    ///
    /// As [`EventBridge::start`] and [`EventBridge::stop`], and
    /// [`InformerError::WatchFailed`] when the watch fails after syncing.
    pub fn run(&self, stop: &CancellationToken) -> Result<(), InformerError> {
        self.start()?;
        loop {
            if stop.wait_timeout(RUN_POLL) {
                return self.stop();
            }
            let mut inner = self.write();
            inner.settle();
            match inner.state {
                InformerState::Running => {}
                InformerState::Error => {
                    return Err(inner.failure.clone().unwrap_or(
                        InformerError::InvalidTransition {
                            operation: "run",
                            state: InformerState::Error,
                        },
                    ));
                }
                _ => return Ok(()),
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BridgeState> {
        self.inner
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl<T> Drop for EventBridge<T> {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(watch) = inner.watch.take() {
            watch.shut_down();
        }
    }
}

impl<T> Informer for EventBridge<T>
where
    T: Serialize + Send + 'static,
{
    fn initialize(
        &self,
        connection: &str,
        resource_key: &str,
        channels: EventChannels,
    ) -> Result<(), InformerError> {
        Self::initialize(self, connection, resource_key, channels)
    }

    fn start(&self) -> Result<(), InformerError> {
        Self::start(self)
    }

    fn stop(&self) -> Result<(), InformerError> {
        Self::stop(self)
    }

    fn state(&self) -> InformerState {
        Self::state(self)
    }
}

struct BridgeHandler<T> {
    wiring: Arc<Wiring>,
    stop: CancellationToken,
    synced: Mutex<Option<SyncSender<()>>>,
    element: PhantomData<fn() -> T>,
}

impl<T> BridgeHandler<T>
where
    T: Serialize + 'static,
{
    fn encode(&self, object: Box<dyn Any + Send>) -> Option<serde_json::Value> {
        let Ok(typed) = object.downcast::<T>() else {
            warn!(
                target: INFORMER_TARGET,
                resource_key = %self.wiring.resource_key,
                expected = std::any::type_name::<T>(),
                "skipping watch object of unexpected type"
            );
            return None;
        };
        match serde_json::to_value(&*typed) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(
                    target: INFORMER_TARGET,
                    resource_key = %self.wiring.resource_key,
                    %error,
                    "skipping unserialisable watch object"
                );
                None
            }
        }
    }

    fn emit(&self, kind: EventKind, data: serde_json::Value, previous: Option<serde_json::Value>) {
        let sender = match kind {
            EventKind::Add => &self.wiring.outputs.add,
            EventKind::Update => &self.wiring.outputs.update,
            EventKind::Delete => &self.wiring.outputs.delete,
        };
        let mut event = ResourceEvent {
            kind,
            connection: self.wiring.connection.clone(),
            resource_key: self.wiring.resource_key.clone(),
            data,
            previous,
        };
        loop {
            match sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(pending)) => {
                    if self.stop.wait_timeout(SEND_RETRY) {
                        return;
                    }
                    event = pending;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(
                        target: INFORMER_TARGET,
                        resource_key = %self.wiring.resource_key,
                        "event receiver gone; dropping event"
                    );
                    return;
                }
            }
        }
    }
}

impl<T> WatchHandler for BridgeHandler<T>
where
    T: Serialize + Send + 'static,
{
    fn on_add(&self, object: Box<dyn Any + Send>) {
        if let Some(data) = self.encode(object) {
            self.emit(EventKind::Add, data, None);
        }
    }

    fn on_update(&self, previous: Box<dyn Any + Send>, current: Box<dyn Any + Send>) {
        let Some(data) = self.encode(current) else {
            return;
        };
        let previous_data = self.encode(previous);
        self.emit(EventKind::Update, data, previous_data);
    }

    fn on_delete(&self, object: Box<dyn Any + Send>) {
        if let Some(data) = self.encode(object) {
            self.emit(EventKind::Delete, data, None);
        }
    }

    fn on_synced(&self) {
        let sender = self
            .synced
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(sender) = sender {
            drop(sender.try_send(()));
        }
    }
}
