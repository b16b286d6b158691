//! Handler-side context: how transport-provided extras reach handlers.

use core::fmt;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::endpoint::EndpointHandle;

/// Connection-scoped typed values published by a codec.
///
/// A type map: each type stores at most one value. A codec typically
/// publishes its peer address or the underlying connection handle so that
/// handlers can identify who is calling. Values a handler asks for that no
/// codec published simply come back `None`.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type if any.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// Look up a value by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Per-call context handed to handlers registered with
/// [`ServiceScope::method_with_ctx`](crate::ServiceScope::method_with_ctx).
///
/// Carries the two sources of extra handler arguments: the endpoint the
/// request arrived on (so a handler can call back to the peer over the same
/// connection) and the codec's published [`Extensions`].
#[derive(Clone)]
pub struct CallContext {
    endpoint: EndpointHandle,
    extensions: Arc<Extensions>,
}

impl CallContext {
    pub(crate) fn new(endpoint: EndpointHandle, extensions: Arc<Extensions>) -> Self {
        Self {
            endpoint,
            extensions,
        }
    }

    /// The endpoint this request arrived on.
    pub fn endpoint(&self) -> &EndpointHandle {
        &self.endpoint
    }

    /// A codec-published value, if the codec recognises the type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get()
    }
}
