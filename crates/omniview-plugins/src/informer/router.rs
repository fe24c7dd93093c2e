//! Host-side fan-out of a plugin's event stream to per-type subscribers.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::{DEFAULT_EVENT_BUFFER, INFORMER_TARGET};
use crate::context::PluginContext;
use crate::lifetime::CancellationToken;
use crate::resource::{ResourceEvent, ResourceProvider};

type Routes = HashMap<String, Vec<(u64, SyncSender<ResourceEvent>)>>;

/// Routes events to subscribers of their resource type.
///
/// Delivery blocks while a subscriber's channel is full; subscribers whose
/// receiver is gone are dropped.
#[derive(Clone)]
pub struct EventRouter {
    routes: Arc<Mutex<Routes>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventRouter {
    /// Creates a router whose subscriber channels hold `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Arc::default(),
            next_id: Arc::default(),
            capacity,
        }
    }

    /// Subscribes to events for `resource_key`.
    #[must_use]
    pub fn subscribe(&self, resource_key: impl Into<String>) -> Receiver<ResourceEvent> {
        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(resource_key.into())
            .or_default()
            .push((id, sender));
        receiver
    }

    /// Delivers `event` to every subscriber of its type. Returns how many
    /// received it.
    pub fn publish(&self, event: &ResourceEvent) -> usize {
        let subscribers = self
            .lock()
            .get(&event.resource_key)
            .cloned()
            .unwrap_or_default();
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, subscriber) in subscribers {
            if subscriber.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(id);
            }
        }
        if !gone.is_empty() {
            self.prune(&event.resource_key, &gone);
        }
        delivered
    }

    /// Pumps `provider`'s event stream into this router on a new thread
    /// until `stop` fires or the stream ends.
    ///
    /// # Errors
    ///
    /// Returns the spawn failure.
    pub fn spawn(
        &self,
        provider: Arc<dyn ResourceProvider>,
        ctx: PluginContext,
        stop: CancellationToken,
    ) -> io::Result<JoinHandle<()>> {
        let router = self.clone();
        thread::Builder::new()
            .name(String::from("omniview-event-router"))
            .spawn(move || {
                let outcome = provider.listen_for_events(
                    &ctx,
                    &mut |event| {
                        router.publish(&event);
                        Ok(())
                    },
                    &stop,
                );
                match outcome {
                    Ok(()) => debug!(target: INFORMER_TARGET, "event stream ended"),
                    Err(status) => warn!(target: INFORMER_TARGET, %status, "event stream failed"),
                }
            })
    }

    fn prune(&self, resource_key: &str, gone: &[u64]) {
        let mut routes = self.lock();
        if let Some(subscribers) = routes.get_mut(resource_key) {
            subscribers.retain(|(id, _)| !gone.contains(id));
            if subscribers.is_empty() {
                routes.remove(resource_key);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
