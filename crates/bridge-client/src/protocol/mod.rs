//! Protocol layer of the bridge client.
//!
//! This module contains the core protocol definitions including:
//! - The envelope model and its two JSON layouts
//! - Framing codecs for the text and binary wire generations

pub mod envelope;
pub mod framing;

pub use envelope::{Envelope, EnvelopeType, Failure, WireFormat};
pub use framing::{FrameCodec, LengthPrefixedCodec, LineCodec};
