//! Per-connection informer lifecycles and the shared event stream.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{info, warn};

use super::{
    DEFAULT_EVENT_BUFFER, EventChannels, EventReceivers, INFORMER_TARGET, Informer, InformerError,
};
use crate::context::{Connection, PluginContext};
use crate::controller::ConnectedClient;
use crate::lifetime::CancellationToken;
use crate::resource::{EventSink, ResourceEvent};
use crate::rpc::RpcStatus;

const LISTEN_POLL: Duration = Duration::from_millis(50);

/// Builds the informers for one connection, one per watched resource type.
pub trait InformerFactory: Send + Sync {
    /// Returns `(resource key, informer)` pairs for `connection`.
    ///
    /// # Errors
    ///
    /// Returns the status explaining why no informers could be built.
    fn informers(
        &self,
        ctx: &PluginContext,
        connection: &Connection,
        client: &ConnectedClient,
    ) -> Result<Vec<(String, Box<dyn Informer>)>, RpcStatus>;
}

/// Runs informers per connection, all feeding one set of event channels.
pub struct InformerManager {
    factory: Box<dyn InformerFactory>,
    channels: EventChannels,
    receivers: Mutex<Option<EventReceivers>>,
    running: Mutex<HashMap<String, Vec<Box<dyn Informer>>>>,
}

impl InformerManager {
    /// Creates a manager with [`DEFAULT_EVENT_BUFFER`]-sized channels.
    #[must_use]
    pub fn new(factory: impl InformerFactory + 'static) -> Self {
        Self::with_capacity(factory, DEFAULT_EVENT_BUFFER)
    }

    /// Creates a manager with channels of `capacity`.
    #[must_use]
    pub fn with_capacity(factory: impl InformerFactory + 'static, capacity: usize) -> Self {
        let (channels, receivers) = EventChannels::bounded(capacity);
        Self {
            factory: Box::new(factory),
            channels,
            receivers: Mutex::new(Some(receivers)),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// IDs of connections with running informers.
    #[must_use]
    pub fn running_connections(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.running().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Builds, wires and starts the informers for `connection`. Already
    /// running connections are left alone.
    ///
    /// # Errors
    ///
    /// Factory, initialisation or start failures; informers started before
    /// the failure are stopped again.
    pub fn start_connection(
        &self,
        ctx: &PluginContext,
        connection: &Connection,
        client: &ConnectedClient,
    ) -> Result<(), InformerError> {
        let mut running = self.running();
        if running.contains_key(&connection.id) {
            return Ok(());
        }
        let informers = self
            .factory
            .informers(ctx, connection, client)
            .map_err(InformerError::Factory)?;
        let mut started: Vec<Box<dyn Informer>> = Vec::with_capacity(informers.len());
        for (resource_key, informer) in informers {
            let outcome = informer
                .initialize(&connection.id, &resource_key, self.channels.clone())
                .and_then(|()| informer.start());
            if let Err(error) = outcome {
                drop(stop_all(&started));
                return Err(error);
            }
            started.push(informer);
        }
        info!(
            target: INFORMER_TARGET,
            connection = %connection.id,
            informers = started.len(),
            "connection informers running"
        );
        running.insert(connection.id.clone(), started);
        Ok(())
    }

    /// Stops and forgets the informers for `connection_id`. Unknown IDs are
    /// a no-op.
    ///
    /// # Errors
    ///
    /// The first stop failure; every informer is still asked to stop.
    pub fn stop_connection(&self, connection_id: &str) -> Result<(), InformerError> {
        let Some(informers) = self.running().remove(connection_id) else {
            return Ok(());
        };
        stop_all(&informers).map_or(Ok(()), Err)
    }

    /// Drains events into `sink` until `stop` fires or the sink fails.
    ///
    /// # Errors
    ///
    /// The sink's failure, or `failed_precondition` when another listener
    /// is active.
    pub fn listen(&self, sink: EventSink<'_>, stop: &CancellationToken) -> Result<(), RpcStatus> {
        let Some(receivers) = self.take_receivers() else {
            return Err(RpcStatus::failed_precondition("events already have a listener"));
        };
        let outcome = drain(&receivers, sink, stop);
        *self
            .receivers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(receivers);
        outcome
    }

    fn take_receivers(&self) -> Option<EventReceivers> {
        self.receivers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, Vec<Box<dyn Informer>>>> {
        self.running
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for InformerManager {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(|poison| poison.into_inner());
        for (_, informers) in running.drain() {
            drop(stop_all(&informers));
        }
    }
}

fn stop_all(informers: &[Box<dyn Informer>]) -> Option<InformerError> {
    let mut first = None;
    for informer in informers {
        if let Err(error) = informer.stop() {
            warn!(target: INFORMER_TARGET, %error, "failed to stop informer");
            first.get_or_insert(error);
        }
    }
    first
}

fn drain(
    receivers: &EventReceivers,
    sink: EventSink<'_>,
    stop: &CancellationToken,
) -> Result<(), RpcStatus> {
    let sources: [&Receiver<ResourceEvent>; 3] = [&receivers.add, &receivers.update, &receivers.delete];
    loop {
        if stop.is_cancelled() {
            return Ok(());
        }
        let mut delivered = false;
        for receiver in sources {
            match receiver.try_recv() {
                Ok(event) => {
                    delivered = true;
                    sink(event)?;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
        }
        if !delivered && stop.wait_timeout(LISTEN_POLL) {
            return Ok(());
        }
    }
}
