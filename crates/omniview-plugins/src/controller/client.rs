//! Typed backend clients behind an erased handle.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

use super::DispatchError;
use crate::context::PluginContext;

/// Identifies the concrete type of a backend client.
///
/// Each resourcer declares the tag of the client it expects; the dispatcher
/// compares it with the tag of the resolved client before invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientTag {
    type_id: TypeId,
    name: &'static str,
}

impl ClientTag {
    /// The tag for client type `C`.
    #[must_use]
    pub fn of<C: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            name: type_name::<C>(),
        }
    }

    /// Type name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ClientTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A backend client for one connection, with its type tag.
#[derive(Clone)]
pub struct ConnectedClient {
    tag: ClientTag,
    client: Arc<dyn Any + Send + Sync>,
}

impl ConnectedClient {
    /// Wraps `client`, capturing its tag.
    #[must_use]
    pub fn new<C: Send + Sync + 'static>(client: C) -> Self {
        Self::from_arc(Arc::new(client))
    }

    /// Wraps a shared client.
    #[must_use]
    pub fn from_arc<C: Send + Sync + 'static>(client: Arc<C>) -> Self {
        Self {
            tag: ClientTag::of::<C>(),
            client,
        }
    }

    /// The client's tag.
    #[must_use]
    pub const fn tag(&self) -> ClientTag {
        self.tag
    }

    /// The client as `C`, if that is its type.
    #[must_use]
    pub fn downcast<C: 'static>(&self) -> Option<&C> {
        self.client.downcast_ref::<C>()
    }
}

impl fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedClient")
            .field("tag", &self.tag.name)
            .finish_non_exhaustive()
    }
}

/// Produces the backend client for a request's connection.
pub trait ClientResolver: Send + Sync {
    /// Resolves the client for the context's connection.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoConnection`] when the context carries no
    /// connection, or [`DispatchError::ClientUnavailable`] when a client
    /// cannot be built.
    fn resolve(&self, ctx: &PluginContext) -> Result<ConnectedClient, DispatchError>;
}
