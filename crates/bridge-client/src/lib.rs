//! Client for the event-bus TCP bridge protocol.
//!
//! This crate speaks the bridge wire protocol directly over one multiplexed
//! TCP connection: point-to-point `send`, broadcast `publish`, request/reply
//! correlation and local subscriptions.
//!
//! # Features
//!
//! - **Two Wire Generations**: Newline-delimited text and 4-byte length-prefixed
//!   binary framing of the same JSON envelopes
//! - **Reply Correlation**: One-time reply addresses with optional deadlines
//! - **Local Fan-Out**: Many handlers per address, one subscription on the wire
//! - **Single Writer**: Outbound frames never interleave, even when written from
//!   inside a handler
//!
//! # Example
//!
//! ```no_run
//! use eventbus_bridge_client::{DeliveryOptions, EventBusClient, WireFormat, handler};
//! use serde_json::json;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = EventBusClient::builder()
//!         .host("localhost")
//!         .port(7000)
//!         .wire_format(WireFormat::Binary)
//!         .build();
//!     client.connect().await?;
//!
//!     client.register(
//!         "news",
//!         handler(|message| println!("news: {:?}", message.body())),
//!     )?;
//!
//!     let reply = client
//!         .request("echo", json!({"value": "vert.x"}), DeliveryOptions::new())
//!         .await?;
//!     println!("echoed: {:?}", reply.body());
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use error::{ConnectionError, Error, ReplyError, Result};
pub use message::{Message, Replier};
pub use protocol::{Envelope, EnvelopeType, Failure, FrameCodec, WireFormat};
pub use registry::{Handler, handler};
pub use transport::{ClientBuilder, ClientConfig, DeliveryOptions, ErrorHook, EventBusClient};

// Re-export dependencies that are part of our public API
pub use serde_json::Value;
