//! Middleware wrapped around every inbound call.
//!
//! The standard chain is, outermost first: panic recovery, structured
//! logging, context propagation. Recovery wraps everything so a panic in
//! any layer becomes an `internal` status; logging sees the final outcome;
//! the handler receives a fully prepared [`CallContext`]. The same chain
//! wraps unary calls and whole stream lifetimes.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::context::{PLUGIN_CONTEXT_KEY, PluginContext};
use crate::rpc::{CallContext, CallKind, RpcStatus};
use crate::settings::SettingsProvider;

/// Log target for interceptors.
pub(crate) const INTERCEPTOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::interceptor");

/// Outcome of a call as seen by interceptors. Streams report `Value::Null`
/// on success.
pub type CallOutcome = Result<Value, RpcStatus>;

/// The rest of the chain, ending in the handler.
pub type Next<'a> = &'a mut dyn FnMut(&mut CallContext) -> CallOutcome;

/// One layer of call middleware.
pub trait Interceptor: Send + Sync {
    /// Runs around `next`, which must be called at most once.
    fn intercept(&self, call: &mut CallContext, next: Next<'_>) -> CallOutcome;
}

/// An ordered list of interceptors, outermost first.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    /// An empty chain: handlers run bare.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recovery, then logging, then context propagation. `settings` is
    /// re-attached to every decoded plugin context.
    #[must_use]
    pub fn standard(settings: Option<Arc<dyn SettingsProvider>>) -> Self {
        Self::new()
            .with(RecoveryInterceptor)
            .with(LoggingInterceptor)
            .with(ContextInterceptor::new(settings))
    }

    /// Appends an innermost layer.
    #[must_use]
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain has no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `handler` inside every layer.
    pub fn run(&self, call: &mut CallContext, handler: Next<'_>) -> CallOutcome {
        self.run_from(0, call, handler)
    }

    fn run_from(&self, index: usize, call: &mut CallContext, handler: Next<'_>) -> CallOutcome {
        match self.interceptors.get(index) {
            Some(interceptor) => interceptor.intercept(call, &mut |inner: &mut CallContext| {
                self.run_from(index + 1, inner, handler)
            }),
            None => handler(call),
        }
    }
}

/// Converts handler panics into `internal` statuses.
///
/// The panic value and a backtrace are logged; the caller only sees a
/// generic message.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryInterceptor;

impl Interceptor for RecoveryInterceptor {
    fn intercept(&self, call: &mut CallContext, next: Next<'_>) -> CallOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| next(call))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let backtrace = Backtrace::force_capture();
                error!(
                    target: INTERCEPTOR_TARGET,
                    service = call.service(),
                    method = call.method(),
                    kind = call.kind().as_str(),
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %backtrace,
                    "recovered panic in handler"
                );
                Err(RpcStatus::internal("internal error"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_owned();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    String::from("non-string panic payload")
}

/// Records method, outcome code and duration of each call, and the
/// open-to-close duration of each stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, call: &mut CallContext, next: Next<'_>) -> CallOutcome {
        let started = Instant::now();
        if call.kind() == CallKind::Stream {
            info!(
                target: INTERCEPTOR_TARGET,
                service = call.service(),
                method = call.method(),
                "stream opened"
            );
        }
        let outcome = next(call);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let code = outcome
            .as_ref()
            .map_or_else(|status| status.code.as_str(), |_| "ok");
        match (call.kind(), &outcome) {
            (CallKind::Stream, _) => info!(
                target: INTERCEPTOR_TARGET,
                service = call.service(),
                method = call.method(),
                code,
                stream_duration_ms = duration_ms,
                "stream closed"
            ),
            (CallKind::Unary, Ok(_)) => debug!(
                target: INTERCEPTOR_TARGET,
                service = call.service(),
                method = call.method(),
                code,
                duration_ms,
                "call completed"
            ),
            (CallKind::Unary, Err(status)) => warn!(
                target: INTERCEPTOR_TARGET,
                service = call.service(),
                method = call.method(),
                code,
                message = %status.message,
                duration_ms,
                "call failed"
            ),
        }
        outcome
    }
}

/// Decodes the `plugin_context` metadata entry and attaches the call's own
/// lifetime and the local settings provider.
///
/// A missing entry leaves the call without a plugin context. A malformed
/// entry is logged and the call also continues without one; methods that
/// need a context reject the call through
/// [`CallContext::require_plugin_context`].
#[derive(Default)]
pub struct ContextInterceptor {
    settings: Option<Arc<dyn SettingsProvider>>,
}

impl ContextInterceptor {
    /// Creates the interceptor with an optional settings provider to
    /// rehydrate.
    #[must_use]
    pub fn new(settings: Option<Arc<dyn SettingsProvider>>) -> Self {
        Self { settings }
    }

    fn decode(&self, call: &CallContext) -> Option<PluginContext> {
        let raw = call.metadata().get(PLUGIN_CONTEXT_KEY)?;
        match PluginContext::from_metadata(raw) {
            Ok(context) => {
                let attached = context.with_lifetime(call.lifetime().clone());
                Some(match &self.settings {
                    Some(settings) => attached.with_settings(Arc::clone(settings)),
                    None => attached,
                })
            }
            Err(error) => {
                warn!(
                    target: INTERCEPTOR_TARGET,
                    service = call.service(),
                    method = call.method(),
                    %error,
                    "discarding undecodable plugin context"
                );
                None
            }
        }
    }
}

impl Interceptor for ContextInterceptor {
    fn intercept(&self, call: &mut CallContext, next: Next<'_>) -> CallOutcome {
        let context = self.decode(call);
        call.set_plugin_context(context);
        next(call)
    }
}
