//! Common test setup for integration tests: an in-process bridge.

#![allow(dead_code)]

use eventbus_bridge_client::protocol::framing::MAX_FRAME_SIZE;
use eventbus_bridge_client::{
    ClientBuilder, Envelope, EnvelopeType, EventBusClient, Failure, FrameCodec, WireFormat,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber for all tests.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A bridge good enough to exercise the client.
///
/// Behaviour by inbound frame:
/// - `register`/`unregister` update the connection's subscriptions
/// - `ping` is answered with `pong`
/// - `publish` to a subscribed address is delivered back
/// - `send` to a subscribed address is delivered back with its reply address,
///   which then becomes routable back to this client
/// - `send` to `echo` replies with the same body
/// - `send` to `fail` replies with a `NO_HANDLERS` failure
/// - `send` to `twice` replies twice on the same reply address
/// - `send` to `deny` answers with an `err` frame
/// - `send` to `garbage` writes an undecodable frame, then publishes to
///   `after-garbage`
/// - `send` to `hangup` closes the connection
/// - anything else is recorded and ignored
pub struct MockBridge {
    addr: SocketAddr,
    format: WireFormat,
    received: Arc<Mutex<Vec<Envelope>>>,
    task: JoinHandle<()>,
}

impl MockBridge {
    pub async fn start(format: WireFormat) -> Self {
        init_test_logging();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock bridge");
        let addr = listener.local_addr().expect("Mock bridge has no address");
        let received = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&received);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, format, Arc::clone(&recorded)));
            }
        });

        Self {
            addr,
            format,
            received,
            task,
        }
    }

    /// A builder pointed at this bridge.
    pub fn builder(&self) -> ClientBuilder {
        EventBusClient::builder()
            .host(self.addr.ip().to_string())
            .port(self.addr.port())
            .wire_format(self.format)
            .reply_timeout(Some(Duration::from_secs(5)))
    }

    /// A connected client.
    pub async fn client(&self) -> EventBusClient {
        let client = self.builder().build();
        client.connect().await.expect("Failed to connect to mock bridge");
        client
    }

    /// Every frame received so far, in arrival order.
    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    /// `register` and `unregister` frames received so far.
    pub fn control_frames(&self) -> Vec<Envelope> {
        self.received
            .lock()
            .iter()
            .filter(|e| matches!(e.kind, EnvelopeType::Register | EnvelopeType::Unregister))
            .cloned()
            .collect()
    }

    /// Number of frames of one kind received so far.
    pub fn count(&self, kind: EnvelopeType) -> usize {
        self.received.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl Drop for MockBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, format: WireFormat, received: Arc<Mutex<Vec<Envelope>>>) {
    let mut framed = Framed::new(stream, FrameCodec::new(format, MAX_FRAME_SIZE));
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut routes: HashSet<String> = HashSet::new();

    while let Some(Ok(envelope)) = framed.next().await {
        received.lock().push(envelope.clone());

        let address = envelope.address.clone().unwrap_or_default();
        let body = envelope.body.clone().unwrap_or(Value::Null);

        let outbound = match envelope.kind {
            EnvelopeType::Register => {
                subscriptions.insert(address);
                Vec::new()
            }
            EnvelopeType::Unregister => {
                subscriptions.remove(&address);
                Vec::new()
            }
            EnvelopeType::Ping => vec![Envelope::new(EnvelopeType::Pong)],
            EnvelopeType::Publish if subscriptions.contains(&address) => vec![envelope],
            EnvelopeType::Send => match address.as_str() {
                "echo" => reply_to(&envelope, |r| vec![Envelope::send(r, body.clone())]),
                "fail" => reply_to(&envelope, |r| {
                    vec![Envelope::failure_reply(
                        r,
                        Failure {
                            failure_code: 1,
                            failure_type: "NO_HANDLERS".to_string(),
                            message: "no handlers".to_string(),
                        },
                    )]
                }),
                "twice" => reply_to(&envelope, |r| {
                    vec![
                        Envelope::send(r, json!("first")),
                        Envelope::send(r, json!("second")),
                    ]
                }),
                "deny" => vec![Envelope::err("access_denied")],
                "garbage" => {
                    let junk: &[u8] = match format {
                        WireFormat::Text => b"this is not json\n",
                        WireFormat::Binary => b"\x00\x00\x00\x10this is not json",
                    };
                    if SinkExt::<Envelope>::flush(&mut framed).await.is_err()
                        || framed.get_mut().write_all(junk).await.is_err()
                    {
                        return;
                    }
                    vec![Envelope::publish("after-garbage", json!("still alive"))]
                }
                "hangup" => return,
                _ if routes.remove(&address) || subscriptions.contains(&address) => {
                    if let Some(reply_address) = &envelope.reply_address {
                        routes.insert(reply_address.clone());
                    }
                    vec![envelope]
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        for frame in outbound {
            if framed.send(frame).await.is_err() {
                return;
            }
        }
    }
}

fn reply_to<F>(envelope: &Envelope, build: F) -> Vec<Envelope>
where
    F: FnOnce(&str) -> Vec<Envelope>,
{
    envelope
        .reply_address
        .as_deref()
        .map(build)
        .unwrap_or_default()
}

/// Wait until `condition` holds, failing the test after two seconds.
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}
