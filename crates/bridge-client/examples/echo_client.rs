//! Echo client example.
//!
//! Connects to a bridge on `localhost:7000`, subscribes to `news`, sends a
//! request to `echo` and prints the reply.
//! Note: This expects a running bridge with an `echo` consumer.

use anyhow::Result;
use eventbus_bridge_client::{DeliveryOptions, EventBusClient, Message, WireFormat, handler};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let format = match std::env::args().nth(1).as_deref() {
        Some("text") => WireFormat::Text,
        _ => WireFormat::Binary,
    };

    let client = EventBusClient::builder()
        .host("localhost")
        .port(7000)
        .wire_format(format)
        .reply_timeout(Some(Duration::from_secs(5)))
        .ping_interval(Duration::from_secs(10))
        .build();

    client.set_on_error(|e| eprintln!("bridge error: {e}"));
    client.connect().await?;
    println!("Connected using {format} framing");

    client.register(
        "news",
        handler(|message: Message| {
            println!("news on {}: {:?}", message.address(), message.body());
        }),
    )?;

    let reply = client
        .request(
            "echo",
            json!({"value": "vert.x"}),
            DeliveryOptions::new().header("origin", "echo_client"),
        )
        .await?;
    println!("Echo reply: {:?}", reply.body());

    client.publish("news", json!({"headline": "echo client online"}))?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.close();
    Ok(())
}
