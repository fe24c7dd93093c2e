//! Cancellable lifetimes shared between a call and the work it spawns.
//!
//! A [`CancellationToken`] is the stop signal observed by every background
//! loop in the crate: output pumps, informer watches and port forwards. It
//! never crosses the process boundary; each side of an RPC call owns its own.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Shared {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Cloneable stop signal with an optional deadline.
///
/// Clones observe the same cancellation state. Once the deadline passes the
/// token reports itself as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    shared: Arc<Shared>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Creates a token with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Signals cancellation and wakes every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        *cancelled = true;
        self.shared.signal.notify_all();
    }

    /// Returns `true` once cancelled or past the deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.deadline_passed() {
            return true;
        }
        *self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Blocks for at most `timeout`, returning `true` if the token was
    /// cancelled in the meantime.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let limit = match self.remaining() {
            Some(remaining) => remaining.min(timeout),
            None => timeout,
        };
        let guard = self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let (guard, _) = self
            .shared
            .signal
            .wait_timeout_while(guard, limit, |cancelled| !*cancelled)
            .unwrap_or_else(|poison| poison.into_inner());
        *guard || self.deadline_passed()
    }

    /// Blocks until the token is cancelled or its deadline passes.
    pub fn wait(&self) {
        loop {
            if self.wait_timeout(Duration::from_secs(1)) {
                return;
            }
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}
