//! Messages delivered to handlers and reply callbacks.

use crate::error::{ProtocolError, ReplyError, Result};
use crate::transport::client::{DeliveryOptions, EventBusClient};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// An inbound message.
///
/// When the sender asked for a reply, the message carries a [`Replier`]
/// bound to the sender's one-time reply address.
#[derive(Clone, Debug)]
pub struct Message {
    address: String,
    body: Option<Value>,
    headers: HashMap<String, String>,
    replier: Option<Replier>,
}

impl Message {
    pub(crate) fn new(
        address: String,
        body: Option<Value>,
        headers: HashMap<String, String>,
        replier: Option<Replier>,
    ) -> Self {
        Self {
            address,
            body,
            headers,
            replier,
        }
    }

    /// Address the message was delivered on.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Message body, if any.
    #[must_use]
    pub const fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Take the body, leaving `None` behind.
    pub fn take_body(&mut self) -> Option<Value> {
        self.body.take()
    }

    /// Message headers.
    #[must_use]
    pub const fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// The reply capability, present when the sender expects a reply.
    #[must_use]
    pub const fn replier(&self) -> Option<&Replier> {
        self.replier.as_ref()
    }

    /// Address the sender expects a reply on.
    #[must_use]
    pub fn reply_address(&self) -> Option<&str> {
        self.replier.as_ref().map(Replier::address)
    }

    /// Reply to the sender.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not expect a reply, or the reply
    /// cannot be written.
    pub fn reply(&self, body: impl Into<Value>) -> Result<()> {
        self.expect_replier()?.reply(body)
    }

    /// Reply to the sender and wait for a reply to the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not expect a reply, or the reply
    /// cannot be written.
    pub fn reply_with<F>(
        &self,
        body: impl Into<Value>,
        options: DeliveryOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(std::result::Result<Self, ReplyError>) + Send + 'static,
    {
        self.expect_replier()?.reply_with(body, options, callback)
    }

    fn expect_replier(&self) -> Result<&Replier> {
        self.replier
            .as_ref()
            .ok_or_else(|| ProtocolError::MissingField("replyAddress").into())
    }
}

/// Capability to answer one message.
///
/// Invoking it is the same as calling [`EventBusClient::send`] on the reply
/// address; the handler never needs to see the correlation token.
#[derive(Clone)]
pub struct Replier {
    reply_address: String,
    client: EventBusClient,
}

impl Replier {
    pub(crate) fn new(reply_address: String, client: EventBusClient) -> Self {
        Self {
            reply_address,
            client,
        }
    }

    /// The reply address this capability writes to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.reply_address
    }

    /// Send a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be written.
    pub fn reply(&self, body: impl Into<Value>) -> Result<()> {
        self.client.send(&self.reply_address, body)
    }

    /// Send a reply and register a callback for the reply to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be written.
    pub fn reply_with<F>(
        &self,
        body: impl Into<Value>,
        options: DeliveryOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(std::result::Result<Message, ReplyError>) + Send + 'static,
    {
        self.client
            .send_with_reply(&self.reply_address, body, options, callback)
    }
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replier")
            .field("reply_address", &self.reply_address)
            .finish_non_exhaustive()
    }
}
