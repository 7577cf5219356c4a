//! Socket ownership: one reader task, one writer task.

use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{Envelope, FrameCodec};
use crate::transport::client::EventBusClient;
use crate::transport::dispatch::Dispatcher;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, error, warn};

/// Work item for the writer task.
#[derive(Debug)]
enum Outbound {
    /// One fully encoded frame.
    Frame(Bytes),
    /// Flush what is queued, then half-close the socket.
    Shutdown,
}

/// A live link to the bridge.
///
/// Every outbound frame goes through a single queue drained by one writer
/// task, so frames never interleave no matter how many call sites write
/// concurrently or re-entrantly from handlers.
#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    keep_alive: Option<JoinHandle<()>>,
}

impl Connection {
    /// Open a TCP stream to `addr`.
    pub(crate) async fn open(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(connect_timeout))?
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Start the reader, writer and optional keep-alive tasks over a split
    /// byte stream.
    pub(crate) fn spawn<R, W>(
        id: u64,
        reader: R,
        writer: W,
        codec: FrameCodec,
        client: EventBusClient,
        ping_interval: Option<Duration>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, queue) = mpsc::unbounded_channel();

        let keep_alive = ping_interval.map(|period| {
            let outbound = outbound.clone();
            let codec = codec.clone();
            tokio::spawn(keep_alive_loop(outbound, codec, period))
        });

        let writer = tokio::spawn(write_loop(id, writer, queue, client.clone()));
        let reader = tokio::spawn(read_loop(id, reader, codec, client));

        debug!(id, "Connection started");

        Self {
            id,
            outbound,
            reader,
            writer,
            keep_alive,
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Queue one encoded frame.
    pub(crate) fn send(&self, frame: Bytes) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::Closed.into())
    }

    /// Half-close: frames already queued are still written, then the write
    /// side is shut down. The reader stops at the next frame once the
    /// connection is no longer current.
    pub(crate) fn shutdown(&self) {
        if let Some(task) = &self.keep_alive {
            task.abort();
        }
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    /// Stop every task immediately.
    pub(crate) fn abort(&self) {
        if let Some(task) = &self.keep_alive {
            task.abort();
        }
        self.writer.abort();
        self.reader.abort();
    }
}

async fn read_loop<R>(id: u64, reader: R, codec: FrameCodec, client: EventBusClient)
where
    R: AsyncRead + Unpin,
{
    let dispatcher = Dispatcher::new(client.clone());
    let mut frames = FramedRead::new(reader, codec);

    let failure = loop {
        match frames.next().await {
            Some(Ok(_)) if !client.is_current(id) => {
                debug!(id, "Connection detached, dropping inbound frames");
                break None;
            }
            Some(Ok(envelope)) => dispatcher.dispatch(envelope),
            Some(Err(Error::Io(e))) => break Some(ConnectionError::Reset(e).into()),
            Some(Err(e)) => break Some(e),
            None => break None,
        }
    };

    debug!(id, ?failure, "Reader finished");
    client.connection_lost(id, failure);
}

async fn write_loop<W>(
    id: u64,
    writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    client: EventBusClient,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, BytesCodec::new());

    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    error!(id, "Write failed: {}", e);
                    client.connection_lost(id, Some(ConnectionError::Reset(e).into()));
                    return;
                }
            }
            Outbound::Shutdown => break,
        }
    }

    if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
        warn!(id, "Failed to shut down write side: {}", e);
    }
    debug!(id, "Writer finished");
}

async fn keep_alive_loop(
    outbound: mpsc::UnboundedSender<Outbound>,
    codec: FrameCodec,
    period: Duration,
) {
    let mut frame = BytesMut::new();
    if let Err(e) = codec.write_frame(&Envelope::ping(), &mut frame) {
        error!("Failed to encode ping: {}", e);
        return;
    }
    let frame = frame.freeze();

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if outbound.send(Outbound::Frame(frame.clone())).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireFormat;
    use crate::protocol::framing::MAX_FRAME_SIZE;
    use tokio::io::{AsyncReadExt, duplex, split};
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (local, remote) = duplex(64 * 1024);
        let (reader, writer) = split(local);
        let codec = FrameCodec::new(WireFormat::Binary, MAX_FRAME_SIZE);
        let client = EventBusClient::builder().build();
        let connection = Connection::spawn(7, reader, writer, codec.clone(), client, None);

        for i in 0..3_i64 {
            let mut frame = BytesMut::new();
            codec
                .write_frame(&Envelope::publish("a", i.into()), &mut frame)
                .unwrap();
            connection.send(frame.freeze()).unwrap();
        }
        connection.shutdown();

        let mut peer = Framed::new(remote, codec);
        for i in 0..3_i64 {
            let envelope = peer.next().await.unwrap().unwrap();
            assert_eq!(envelope, Envelope::publish("a", i.into()));
        }
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_sends_ping() {
        let (local, mut remote) = duplex(1024);
        let (reader, writer) = split(local);
        let codec = FrameCodec::new(WireFormat::Text, MAX_FRAME_SIZE);
        let client = EventBusClient::builder().build();
        let connection = Connection::spawn(
            1,
            reader,
            writer,
            codec,
            client,
            Some(Duration::from_millis(10)),
        );

        let mut buf = vec![0u8; 64];
        let n = remote.read(&mut buf).await.unwrap();
        let line = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(line.starts_with("{\"type\":\"ping\"}\n"));

        connection.abort();
    }

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (local, _remote) = duplex(1024);
        let (reader, writer) = split(local);
        let codec = FrameCodec::new(WireFormat::Binary, MAX_FRAME_SIZE);
        let client = EventBusClient::builder().build();
        let connection = Connection::spawn(2, reader, writer, codec, client, None);

        connection.abort();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = connection.send(Bytes::from_static(b"x"));
        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Closed))
        ));
    }
}
