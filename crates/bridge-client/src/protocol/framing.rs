//! Message framing for both wire generations.
//!
//! Decoding never fails on a bad payload: a frame whose JSON cannot be turned
//! into an [`Envelope`] comes out as an `err` envelope carrying the parse
//! failure, and the stream carries on with the next frame. Only conditions
//! that make the byte stream unrecoverable are returned as errors.

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::envelope::{Envelope, WireFormat};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Length prefix size of the binary generation.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload a 4-byte length prefix can describe.
#[allow(clippy::cast_possible_truncation)]
const MAX_PREFIXED_LEN: usize = u32::MAX as usize;

fn decode_payload(payload: &[u8]) -> Envelope {
    Envelope::from_json(payload).unwrap_or_else(|e| {
        warn!("Failed to decode frame: {}", e);
        Envelope::err(e.to_string())
    })
}

/// Newline-delimited JSON codec.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line_length: usize,
    /// Bytes of the buffered partial line already scanned for `\n`.
    next_index: usize,
    /// Skipping the rest of an over-long line.
    discarding: bool,
}

impl LineCodec {
    /// Create a new line codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_line_length: MAX_FRAME_SIZE,
            next_index: 0,
            discarding: false,
        }
    }

    /// Create a codec with a custom max line length.
    #[must_use]
    pub const fn with_max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    /// Append one encoded envelope to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized or is too long.
    pub fn write_frame(&self, envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        let line = envelope.to_json(WireFormat::Text)?;

        if line.len() > self.max_line_length {
            return Err(ProtocolError::FrameTooLarge {
                size: line.len(),
                max: self.max_line_length,
            }
            .into());
        }

        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');

        Ok(())
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        loop {
            let read_to = buf.len().min(self.max_line_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(index)) => {
                    buf.advance(index + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    let err = ProtocolError::FrameTooLarge {
                        size: self.max_line_length.saturating_add(1),
                        max: self.max_line_length,
                    };
                    warn!("Discarded line: {}", err);
                    return Ok(Some(Envelope::err(Error::from(err).to_string())));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(index)) => {
                    self.next_index = 0;
                    let line = buf.split_to(index + 1);
                    let line = &line[..index];
                    if line.iter().all(u8::is_ascii_whitespace) {
                        trace!("Skipping blank line");
                        continue;
                    }
                    return Ok(Some(decode_payload(line)));
                }
                (false, None) if buf.len() > self.max_line_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        if let Some(envelope) = self.decode(buf)? {
            return Ok(Some(envelope));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }

        // End of stream flushes the carried-over fragment as a final line.
        let line = buf.split();
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(decode_payload(&line)))
    }
}

impl Encoder<Envelope> for LineCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        self.write_frame(&envelope, dst)
    }
}

/// Length-prefixed JSON codec.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    /// Create a new length-prefixed codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size, capped at what the length
    /// prefix can express.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = if size > MAX_PREFIXED_LEN {
            MAX_PREFIXED_LEN
        } else {
            size
        };
        self
    }

    /// Append one encoded envelope to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized or is too large.
    pub fn write_frame(&self, envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        let payload = envelope.to_json(WireFormat::Binary)?;

        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            }
            .into());
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());

        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Parse length without consuming
        let mut header = &buf[..LENGTH_PREFIX_SIZE];
        let payload_len = header.get_u32() as usize;

        // An oversized frame cannot be skipped without reading it, so the
        // stream is unrecoverable from here on.
        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            }
            .into());
        }

        let frame_len = LENGTH_PREFIX_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(payload_len);

        Ok(Some(decode_payload(&payload)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        if let Some(envelope) = self.decode(buf)? {
            return Ok(Some(envelope));
        }

        if buf.is_empty() {
            return Ok(None);
        }

        let remaining = buf.len();
        buf.clear();
        warn!("Stream ended inside a frame ({} bytes buffered)", remaining);
        Ok(Some(Envelope::err(format!(
            "stream ended inside a frame ({remaining} bytes buffered)"
        ))))
    }
}

impl Encoder<Envelope> for LengthPrefixedCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        self.write_frame(&envelope, dst)
    }
}

/// Codec for whichever generation a deployment speaks.
#[derive(Debug, Clone)]
pub enum FrameCodec {
    /// Newline-delimited text.
    Text(LineCodec),
    /// Length-prefixed binary.
    Binary(LengthPrefixedCodec),
}

impl FrameCodec {
    /// Create a codec for the given wire format.
    #[must_use]
    pub const fn new(format: WireFormat, max_frame_size: usize) -> Self {
        match format {
            WireFormat::Text => Self::Text(LineCodec::new().with_max_line_length(max_frame_size)),
            WireFormat::Binary => {
                Self::Binary(LengthPrefixedCodec::new().with_max_frame_size(max_frame_size))
            }
        }
    }

    /// The wire format this codec speaks.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        match self {
            Self::Text(_) => WireFormat::Text,
            Self::Binary(_) => WireFormat::Binary,
        }
    }

    /// Append one encoded envelope to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized or is too large.
    pub fn write_frame(&self, envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Text(codec) => codec.write_frame(envelope, dst),
            Self::Binary(codec) => codec.write_frame(envelope, dst),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        match self {
            Self::Text(codec) => codec.decode(buf),
            Self::Binary(codec) => codec.decode(buf),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        match self {
            Self::Text(codec) => codec.decode_eof(buf),
            Self::Binary(codec) => codec.decode_eof(buf),
        }
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        self.write_frame(&envelope, dst)
    }
}
