//! Request-scoped plugin context and its metadata encoding.
//!
//! Inside the crate a [`PluginContext`] is an explicit parameter. Only at the
//! RPC boundary does it become the `plugin_context` metadata entry: the
//! client encodes it with [`PluginContext::to_metadata`] and the server-side
//! context interceptor decodes it and attaches the call's own lifetime.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::lifetime::CancellationToken;
use crate::settings::SettingsProvider;

mod connection;

pub use connection::Connection;

/// Metadata key carrying the encoded context.
pub const PLUGIN_CONTEXT_KEY: &str = "plugin_context";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries for retryable failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors raised while encoding or decoding context metadata.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The context could not be serialised.
    #[error("failed to encode plugin context: {0}")]
    Encode(#[source] serde_json::Error),
    /// The metadata entry is not a valid context.
    #[error("failed to decode plugin context: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Caller-side request policy.
///
/// The dispatcher never retries; [`RequestOptions::retry`] is for the layer
/// issuing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Budget for a single attempt.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause between attempts.
    #[serde(rename = "backoff_interval_ms", with = "millis")]
    pub backoff_interval: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_interval: DEFAULT_BACKOFF,
        }
    }
}

impl RequestOptions {
    /// Runs `operation` until it succeeds, fails with an error
    /// `is_retryable` rejects, or the retry budget is spent. The attempt
    /// number, starting at zero, is passed to `operation`.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub fn retry<T, E, F, R>(&self, mut operation: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_retries && is_retryable(&error) => {
                    attempt += 1;
                    thread::sleep(self.backoff_interval);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Names the resource type a call operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContext {
    /// Resource type key, e.g. `core::v1::Pod`.
    pub key: String,
}

impl ResourceContext {
    /// Creates a resource context for `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Request-scoped state threaded through every call.
///
/// The settings provider and lifetime are local to a process: they are never
/// serialised and are re-attached on the receiving side.
///
/// # Example
///
/// ```
/// use omniview_plugins::{Connection, PluginContext, ResourceContext};
///
/// let ctx = PluginContext::new("ui")
///     .with_connection(Connection::new("prod", "Production"))
///     .with_resource_context(ResourceContext::new("core::v1::Pod"));
/// let metadata = ctx.to_metadata().expect("encode");
/// let decoded = PluginContext::from_metadata(&metadata).expect("decode");
/// assert_eq!(decoded, ctx);
/// assert!(decoded.lifetime().is_none());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct PluginContext {
    request_id: String,
    requester_id: String,
    #[serde(default)]
    request_options: RequestOptions,
    #[serde(default)]
    connection: Option<Connection>,
    #[serde(default)]
    resource_context: Option<ResourceContext>,
    #[serde(skip)]
    settings: Option<Arc<dyn SettingsProvider>>,
    #[serde(skip)]
    lifetime: Option<CancellationToken>,
}

impl PluginContext {
    /// Creates a context with a fresh request ID and default options.
    #[must_use]
    pub fn new(requester_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            requester_id: requester_id.into(),
            request_options: RequestOptions::default(),
            connection: None,
            resource_context: None,
            settings: None,
            lifetime: None,
        }
    }

    /// Sets the connection.
    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Sets the resource context.
    #[must_use]
    pub fn with_resource_context(mut self, resource: ResourceContext) -> Self {
        self.resource_context = Some(resource);
        self
    }

    /// Overrides the request options.
    #[must_use]
    pub const fn with_options(mut self, options: RequestOptions) -> Self {
        self.request_options = options;
        self
    }

    /// Attaches a local settings provider.
    #[must_use]
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Attaches a local lifetime.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: CancellationToken) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Generated request ID.
    #[must_use]
    pub const fn request_id(&self) -> &str {
        self.request_id.as_str()
    }

    /// Identity of the caller.
    #[must_use]
    pub const fn requester_id(&self) -> &str {
        self.requester_id.as_str()
    }

    /// Request options.
    #[must_use]
    pub const fn request_options(&self) -> &RequestOptions {
        &self.request_options
    }

    /// Connection, if the call targets one.
    #[must_use]
    pub const fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Resource context, if the call names a resource type.
    #[must_use]
    pub const fn resource_context(&self) -> Option<&ResourceContext> {
        self.resource_context.as_ref()
    }

    /// Local settings provider.
    #[must_use]
    pub fn settings(&self) -> Option<&Arc<dyn SettingsProvider>> {
        self.settings.as_ref()
    }

    /// Local lifetime.
    #[must_use]
    pub const fn lifetime(&self) -> Option<&CancellationToken> {
        self.lifetime.as_ref()
    }

    /// Copy without process-local handles.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            settings: None,
            lifetime: None,
            ..self.clone()
        }
    }

    /// Encodes the context for the `plugin_context` metadata entry. The
    /// lifetime and settings handle are dropped first.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Encode`] if serialisation fails.
    pub fn to_metadata(&self) -> Result<String, ContextError> {
        serde_json::to_string(&self.detached()).map_err(ContextError::Encode)
    }

    /// Decodes a `plugin_context` metadata entry. The result carries no
    /// lifetime or settings until the receiver attaches its own.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Decode`] when `metadata` is not a valid
    /// encoded context.
    pub fn from_metadata(metadata: &str) -> Result<Self, ContextError> {
        serde_json::from_str(metadata).map_err(ContextError::Decode)
    }
}

impl PartialEq for PluginContext {
    /// Compares the wire-visible fields only.
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
            && self.requester_id == other.requester_id
            && self.request_options == other.request_options
            && self.connection == other.connection
            && self.resource_context == other.resource_context
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("request_id", &self.request_id)
            .field("requester_id", &self.requester_id)
            .field("request_options", &self.request_options)
            .field("connection", &self.connection.as_ref().map(|c| c.id.as_str()))
            .field("resource_context", &self.resource_context)
            .field("has_settings", &self.settings.is_some())
            .field("has_lifetime", &self.lifetime.is_some())
            .finish()
    }
}

/// Serialises a [`Duration`] as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests;
