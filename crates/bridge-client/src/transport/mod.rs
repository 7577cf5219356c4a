//! Transport layer of the bridge client.
//!
//! This module handles the socket and everything driven by it,
//! including the reader/writer tasks, inbound dispatch,
//! and the public client surface.

pub mod client;
mod connection;
mod dispatch;

pub use client::{ClientBuilder, ClientConfig, DeliveryOptions, ErrorHook, EventBusClient};
