//! Pending reply correlation.

use crate::error::ReplyError;
use crate::message::Message;
use crate::protocol::Failure;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// One-shot continuation for a reply.
pub type ReplyCallback = Box<dyn FnOnce(Result<Message, ReplyError>) + Send>;

/// The callback sits behind a mutex so the map stays `Sync` while callbacks
/// only need to be `Send`.
struct PendingReply {
    callback: Mutex<ReplyCallback>,
    timer: Option<AbortHandle>,
}

/// One-time reply address to pending callback.
///
/// Every entry is removed exactly once: by the reply, by its timeout, or by
/// a bulk rejection on close. Callbacks always run after the entry has left
/// the map, so they may freely issue new requests.
#[derive(Clone, Default)]
pub struct ReplyRegistry {
    pending: Arc<DashMap<String, PendingReply>>,
}

impl ReplyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh reply address.
    #[must_use]
    pub fn mint_address() -> String {
        Uuid::new_v4().to_string()
    }

    /// Record a callback under a reply address.
    pub fn register(&self, address: String, callback: ReplyCallback) {
        let previous = self.pending.insert(
            address,
            PendingReply {
                callback: Mutex::new(callback),
                timer: None,
            },
        );
        if let Some(PendingReply {
            timer: Some(timer), ..
        }) = previous
        {
            timer.abort();
        }
    }

    /// Fail the entry with [`ReplyError::Timeout`] if nothing resolves it
    /// within `after`.
    ///
    /// Outside a tokio runtime no timer can be armed and the entry waits
    /// indefinitely.
    pub fn expire_after(&self, address: &str, after: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(address, "No runtime available, reply timeout not armed");
            return;
        };

        let registry = self.clone();
        let key = address.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if registry.resolve(&key, Err(ReplyError::Timeout(after))) {
                debug!(address = %key, ?after, "Reply timed out");
            }
        });

        match self.pending.get_mut(address) {
            Some(mut entry) => entry.timer = Some(task.abort_handle()),
            None => task.abort(),
        }
    }

    /// Remove an entry without invoking it.
    pub fn take(&self, address: &str) -> Option<ReplyCallback> {
        let (_, pending) = self.pending.remove(address)?;
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        Some(pending.callback.into_inner())
    }

    /// Complete an entry. Returns `false` if the address was not pending.
    pub fn resolve(&self, address: &str, outcome: Result<Message, ReplyError>) -> bool {
        match self.take(address) {
            Some(callback) => {
                callback(outcome);
                true
            }
            None => false,
        }
    }

    /// Complete every entry with the same error. Returns how many were
    /// pending.
    pub fn reject_all(&self, error: &ReplyError) -> usize {
        let addresses: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        addresses
            .iter()
            .filter(|address| self.resolve(address, Err(error.clone())))
            .count()
    }

    /// Whether an address is pending.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.pending.contains_key(address)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl From<Failure> for ReplyError {
    fn from(failure: Failure) -> Self {
        Self::Failure {
            failure_code: failure.failure_code,
            failure_type: failure.failure_type,
            message: failure.message,
        }
    }
}
