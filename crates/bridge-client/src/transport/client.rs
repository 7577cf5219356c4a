//! Event-bus bridge client.

use crate::error::{ConnectionError, Error, ReplyError, Result};
use crate::message::Message;
use crate::protocol::framing::MAX_FRAME_SIZE;
use crate::protocol::{Envelope, FrameCodec, WireFormat};
use crate::registry::{Handler, HandlerRegistry, ReplyRegistry};
use crate::transport::connection::Connection;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, error, instrument, warn};

/// Connection-wide error hook.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Configuration for the bridge client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bridge host.
    pub host: String,
    /// Bridge port.
    pub port: u16,
    /// Wire generation spoken by the bridge.
    pub wire_format: WireFormat,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// Default deadline for reply callbacks. `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
    /// Period of keep-alive pings. `None` disables them.
    pub ping_interval: Option<Duration>,
    /// Largest frame or line accepted in either direction.
    pub max_frame_size: usize,
}

impl ClientConfig {
    /// The `host:port` string to connect to.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7000,
            wire_format: WireFormat::default(),
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Some(Duration::from_secs(30)),
            ping_interval: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Builder for creating bridge clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bridge host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the bridge port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Select the wire generation.
    #[must_use]
    pub const fn wire_format(mut self, format: WireFormat) -> Self {
        self.config.wire_format = format;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the default reply timeout. `None` waits indefinitely.
    #[must_use]
    pub const fn reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    /// Send a keep-alive ping every `interval`.
    #[must_use]
    pub const fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    /// Set the frame size limit.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Build the client. No connection is made until
    /// [`EventBusClient::connect`].
    #[must_use]
    pub fn build(self) -> EventBusClient {
        EventBusClient::new(self.config)
    }
}

/// Per-call delivery options.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Application headers sent with the message.
    pub headers: HashMap<String, String>,
    /// Reply deadline overriding [`ClientConfig::reply_timeout`].
    pub timeout: Option<Duration>,
}

impl DeliveryOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the reply deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Inner {
    config: ClientConfig,
    codec: FrameCodec,
    handlers: Mutex<HandlerRegistry>,
    replies: ReplyRegistry,
    connection: Mutex<Option<Connection>>,
    next_connection_id: AtomicU64,
    on_error: RwLock<Option<ErrorHook>>,
}

/// Client for an event-bus TCP bridge.
///
/// Cheap to clone; clones share one connection and one set of registries.
/// Outbound operations never block: they encode, queue the frame for the
/// writer task and return.
#[derive(Clone)]
pub struct EventBusClient {
    inner: Arc<Inner>,
}

impl EventBusClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client from a configuration.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let codec = FrameCodec::new(config.wire_format, config.max_frame_size);
        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                handlers: Mutex::new(HandlerRegistry::new()),
                replies: ReplyRegistry::new(),
                connection: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
                on_error: RwLock::new(None),
            }),
        }
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connect to the bridge.
    ///
    /// Any previous connection is dropped, and both registries start empty.
    /// A failure is reported to the error hook as well as returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection cannot be established in time.
    #[instrument(skip(self), fields(addr = %self.inner.config.address()))]
    pub async fn connect(&self) -> Result<()> {
        let addr = self.inner.config.address();
        let stream = match Connection::open(&addr, self.inner.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.report_error(&e);
                return Err(e);
            }
        };

        let (reader, writer) = stream.into_split();
        let id = self.attach(reader, writer);
        debug!(id, "Connected to {}", addr);
        Ok(())
    }

    /// Install a connection over an already-open byte stream.
    pub(crate) fn attach<R, W>(&self, reader: R, writer: W) -> u64
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(previous) = self.inner.connection.lock().take() {
            debug!(id = previous.id(), "Replacing connection");
            previous.abort();
        }
        self.inner.handlers.lock().clear();
        let rejected = self.inner.replies.reject_all(&ReplyError::Closed);
        if rejected > 0 {
            debug!(rejected, "Rejected replies left from previous connection");
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.inner.connection.lock();
        *slot = Some(Connection::spawn(
            id,
            reader,
            writer,
            self.inner.codec.clone(),
            self.clone(),
            self.inner.config.ping_interval,
        ));
        id
    }

    /// Install the connection-wide error hook.
    ///
    /// It receives transport failures, `err` frames from the bridge and
    /// frames that could not be decoded. Without a hook these are logged.
    pub fn set_on_error<F>(&self, hook: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.inner.on_error.write() = Some(Arc::new(hook));
    }

    /// Remove the error hook.
    pub fn clear_on_error(&self) {
        *self.inner.on_error.write() = None;
    }

    /// Send a point-to-point message.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the message cannot
    /// be encoded.
    pub fn send(&self, address: &str, body: impl Into<Value>) -> Result<()> {
        self.send_with(address, body, DeliveryOptions::default())
    }

    /// Send a point-to-point message with headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the message cannot
    /// be encoded.
    pub fn send_with(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
    ) -> Result<()> {
        let envelope = Envelope::send(address, body.into()).with_headers(options.headers);
        self.write(&envelope)
    }

    /// Send a point-to-point message and register a callback for its reply.
    ///
    /// The callback runs exactly once: with the reply, with the failure the
    /// bridge reported, or with [`ReplyError::Timeout`] or
    /// [`ReplyError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the message cannot
    /// be encoded. The callback is not invoked in that case.
    pub fn send_with_reply<F>(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(std::result::Result<Message, ReplyError>) + Send + 'static,
    {
        let reply_address = ReplyRegistry::mint_address();
        let envelope = Envelope::send(address, body.into())
            .with_headers(options.headers)
            .with_reply_address(reply_address.clone());
        let frame = self.encode(&envelope)?;

        let replies = &self.inner.replies;
        replies.register(reply_address.clone(), Box::new(callback));
        if let Some(after) = options.timeout.or(self.inner.config.reply_timeout) {
            replies.expire_after(&reply_address, after);
        }

        if let Err(e) = self.enqueue(frame) {
            replies.take(&reply_address);
            return Err(e);
        }
        debug!(address, reply_address = %reply_address, "Sent with reply");
        Ok(())
    }

    /// Send a point-to-point message and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be sent, or the reply is a
    /// failure, times out or is cut off by close.
    #[instrument(skip(self, body, options))]
    pub async fn request(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.send_with_reply(address, body, options, move |reply| {
            let _ = tx.send(reply);
        })?;

        let reply = rx.await.map_err(|_| Error::ChannelClosed)?;
        Ok(reply?)
    }

    /// Broadcast a message to every subscriber of an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the message cannot
    /// be encoded.
    pub fn publish(&self, address: &str, body: impl Into<Value>) -> Result<()> {
        self.publish_with(address, body, DeliveryOptions::default())
    }

    /// Broadcast a message with headers. The timeout option is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected or the message cannot
    /// be encoded.
    pub fn publish_with(
        &self,
        address: &str,
        body: impl Into<Value>,
        options: DeliveryOptions,
    ) -> Result<()> {
        let envelope = Envelope::publish(address, body.into()).with_headers(options.headers);
        self.write(&envelope)
    }

    /// Subscribe a local handler to an address.
    ///
    /// Only the first handler for an address is announced to the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected. The handler is not
    /// kept in that case.
    pub fn register(&self, address: &str, handler: Handler) -> Result<()> {
        let mut handlers = self.inner.handlers.lock();
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }

        if let Some(control) = handlers.register(address, Arc::clone(&handler)) {
            if let Err(e) = self.write(&control) {
                handlers.unregister(address, &handler);
                return Err(e);
            }
            debug!(address, "Registered with bridge");
        }
        Ok(())
    }

    /// Remove one registration of `handler` from an address.
    ///
    /// Unknown addresses and handlers are ignored. When the last handler goes
    /// the bridge is told, if there is still a connection to tell.
    ///
    /// # Errors
    ///
    /// Returns an error if the unregister frame cannot be written.
    pub fn unregister(&self, address: &str, handler: &Handler) -> Result<()> {
        let mut handlers = self.inner.handlers.lock();
        let Some(control) = handlers.unregister(address, handler) else {
            return Ok(());
        };

        match self.write(&control) {
            Ok(()) => {
                debug!(address, "Unregistered from bridge");
                Ok(())
            }
            Err(Error::Connection(ConnectionError::NotConnected)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send a keep-alive ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn ping(&self) -> Result<()> {
        self.write(&Envelope::ping())
    }

    /// Close the connection.
    ///
    /// Queued frames are flushed and the write side is shut down. Every
    /// pending reply fails with [`ReplyError::Closed`]. Local handlers are
    /// kept until the next [`connect`](Self::connect).
    #[instrument(skip(self))]
    pub fn close(&self) {
        let Some(connection) = self.inner.connection.lock().take() else {
            debug!("Close on idle client");
            return;
        };

        connection.shutdown();
        let rejected = self.inner.replies.reject_all(&ReplyError::Closed);
        debug!(id = connection.id(), rejected, "Connection closed");
    }

    /// Whether a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    /// Number of replies still outstanding.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.inner.replies.len()
    }

    /// Number of local handlers on an address.
    #[must_use]
    pub fn handler_count(&self, address: &str) -> usize {
        self.inner.handlers.lock().handler_count(address)
    }

    /// Whether `id` is the connection currently installed.
    pub(crate) fn is_current(&self, id: u64) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.id() == id)
    }

    pub(crate) fn handlers_for(&self, address: &str) -> Vec<Handler> {
        self.inner.handlers.lock().snapshot(address)
    }

    pub(crate) fn replies(&self) -> &ReplyRegistry {
        &self.inner.replies
    }

    pub(crate) fn report_error(&self, err: &Error) {
        let hook = self.inner.on_error.read().clone();
        match hook {
            Some(hook) => hook(err),
            None => error!("Unhandled bridge client error: {}", err),
        }
    }

    /// Called by the connection tasks when the link goes away.
    pub(crate) fn connection_lost(&self, id: u64, failure: Option<Error>) {
        let current = {
            let mut slot = self.inner.connection.lock();
            if slot.as_ref().is_some_and(|c| c.id() == id) {
                slot.take()
            } else {
                None
            }
        };

        let Some(connection) = current else {
            debug!(id, "Closed connection finished");
            return;
        };

        connection.shutdown();
        let rejected = self.inner.replies.reject_all(&ReplyError::Closed);
        let err = failure.unwrap_or_else(|| ConnectionError::Closed.into());
        warn!(id, rejected, "Connection lost: {}", err);
        self.report_error(&err);
    }

    fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        let mut frame = BytesMut::new();
        self.inner.codec.write_frame(envelope, &mut frame)?;
        Ok(frame.freeze())
    }

    fn enqueue(&self, frame: Bytes) -> Result<()> {
        match self.inner.connection.lock().as_ref() {
            Some(connection) => connection.send(frame),
            None => Err(ConnectionError::NotConnected.into()),
        }
    }

    fn write(&self, envelope: &Envelope) -> Result<()> {
        let frame = self.encode(envelope)?;
        self.enqueue(frame)
    }

    #[cfg(test)]
    pub(crate) fn register_local(&self, address: &str, handler: Handler) {
        self.inner.handlers.lock().register(address, handler);
    }
}

impl fmt::Debug for EventBusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusClient")
            .field("config", &self.inner.config)
            .field("connected", &self.is_connected())
            .field("pending_replies", &self.pending_replies())
            .finish_non_exhaustive()
    }
}
