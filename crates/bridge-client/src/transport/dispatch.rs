//! Routing of decoded inbound envelopes.

use crate::error::{Error, ReplyError};
use crate::message::{Message, Replier};
use crate::protocol::{Envelope, EnvelopeType};
use crate::transport::client::EventBusClient;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, trace, warn};

/// Routes inbound envelopes to local handlers and pending replies.
///
/// Runs on the connection's reader task, one envelope at a time.
pub(crate) struct Dispatcher {
    client: EventBusClient,
}

impl Dispatcher {
    pub(crate) const fn new(client: EventBusClient) -> Self {
        Self { client }
    }

    pub(crate) fn dispatch(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeType::Error => {
                let err = Error::Bridge(envelope.error_message().to_string());
                self.client.report_error(&err);
                return;
            }
            EnvelopeType::Pong | EnvelopeType::Ping => {
                trace!(kind = ?envelope.kind, "Keep-alive frame received");
                return;
            }
            EnvelopeType::Register | EnvelopeType::Unregister => {
                warn!(kind = ?envelope.kind, "Ignoring control frame from bridge");
                return;
            }
            EnvelopeType::Send | EnvelopeType::Publish => {}
        }

        let Some(address) = envelope.address else {
            warn!(kind = ?envelope.kind, "Dropping delivery without address");
            return;
        };

        let replier = envelope
            .reply_address
            .map(|reply_address| Replier::new(reply_address, self.client.clone()));
        let message = Message::new(address, envelope.body, envelope.headers, replier);

        let handlers = self.client.handlers_for(message.address());
        debug!(
            address = message.address(),
            handlers = handlers.len(),
            "Dispatching message"
        );

        for handler in handlers {
            let delivery = message.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| handler(delivery))).is_err() {
                error!(address = message.address(), "Handler panicked");
            }
        }

        let address = message.address().to_string();
        let outcome = envelope
            .failure
            .map_or(Ok(message), |failure| Err(ReplyError::from(failure)));
        let replies = self.client.replies();
        let resolved = panic::catch_unwind(AssertUnwindSafe(|| replies.resolve(&address, outcome)));
        match resolved {
            Ok(true) => debug!(address = %address, "Reply delivered"),
            Ok(false) => {}
            Err(_) => error!(address = %address, "Reply callback panicked"),
        }
    }
}
