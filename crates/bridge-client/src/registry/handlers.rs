//! Local subscription handlers keyed by address.

use crate::message::Message;
use crate::protocol::Envelope;
use std::collections::HashMap;
use std::sync::Arc;

/// A local subscriber. Identity is the `Arc` allocation, so the same handler
/// may be registered more than once and unregistered one entry at a time.
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Message) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Address to ordered handler list.
///
/// Mutations return the control envelope the peer must be told about, if
/// any: `register` on the first handler for an address, `unregister` when
/// the last one goes.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to an address.
    pub fn register(&mut self, address: &str, handler: Handler) -> Option<Envelope> {
        match self.handlers.get_mut(address) {
            Some(list) => {
                list.push(handler);
                None
            }
            None => {
                self.handlers.insert(address.to_string(), vec![handler]);
                Some(Envelope::register(address))
            }
        }
    }

    /// Remove the first entry for `handler` on an address.
    pub fn unregister(&mut self, address: &str, handler: &Handler) -> Option<Envelope> {
        let list = self.handlers.get_mut(address)?;
        let index = list.iter().position(|h| Arc::ptr_eq(h, handler))?;
        list.remove(index);

        if list.is_empty() {
            self.handlers.remove(address);
            Some(Envelope::unregister(address))
        } else {
            None
        }
    }

    /// Copy of the handler list for an address, in registration order.
    #[must_use]
    pub fn snapshot(&self, address: &str) -> Vec<Handler> {
        self.handlers.get(address).cloned().unwrap_or_default()
    }

    /// Number of handlers registered on an address.
    #[must_use]
    pub fn handler_count(&self, address: &str) -> usize {
        self.handlers.get(address).map_or(0, Vec::len)
    }

    /// Addresses with at least one handler.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Whether no address has a handler.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
