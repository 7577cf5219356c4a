//! Envelope types and their two wire layouts.
//!
//! Both protocol generations carry the same logical envelope. The text
//! generation places `address`, `replyAddress` and the failure fields at the
//! top level of the JSON object, the binary generation nests them inside
//! `headers`. Decoding accepts either placement.

use crate::error::{CodecError, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Header keys reserved by the protocol in the binary layout.
const ADDRESS: &str = "address";
const REPLY_ADDRESS: &str = "replyAddress";
const FAILURE_CODE: &str = "failureCode";
const FAILURE_TYPE: &str = "failureType";
const MESSAGE: &str = "message";
const RESERVED: [&str; 5] = [ADDRESS, REPLY_ADDRESS, FAILURE_CODE, FAILURE_TYPE, MESSAGE];

/// Which layout an envelope is written in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Newline-delimited JSON with flat protocol fields.
    Text,
    /// 4-byte big-endian length prefix with protocol fields in `headers`.
    #[default]
    Binary,
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// Discriminant of an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    /// Point-to-point delivery. Written as `send` in the text layout and
    /// `message` in the binary layout; both are accepted on input.
    Send,
    /// Broadcast delivery.
    Publish,
    /// Subscribe this connection to an address.
    Register,
    /// Drop this connection's subscription to an address.
    Unregister,
    /// Connection-level error, written as `err`.
    Error,
    /// Keep-alive request.
    Ping,
    /// Keep-alive response.
    Pong,
}

impl EnvelopeType {
    /// Wire name of this type in the given layout.
    #[must_use]
    pub const fn wire_name(self, format: WireFormat) -> &'static str {
        match (self, format) {
            (Self::Send, WireFormat::Text) => "send",
            (Self::Send, WireFormat::Binary) => "message",
            (Self::Publish, _) => "publish",
            (Self::Register, _) => "register",
            (Self::Unregister, _) => "unregister",
            (Self::Error, _) => "err",
            (Self::Ping, _) => "ping",
            (Self::Pong, _) => "pong",
        }
    }

    /// Whether envelopes of this type carry a body to an address.
    #[must_use]
    pub const fn is_delivery(self) -> bool {
        matches!(self, Self::Send | Self::Publish)
    }

    const fn requires_address(self) -> bool {
        matches!(
            self,
            Self::Send | Self::Publish | Self::Register | Self::Unregister
        )
    }
}

impl FromStr for EnvelopeType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, ProtocolError> {
        match s {
            "send" | "message" => Ok(Self::Send),
            "publish" => Ok(Self::Publish),
            "register" => Ok(Self::Register),
            "unregister" => Ok(Self::Unregister),
            "err" => Ok(Self::Error),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Failure fields of an error reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// Numeric failure code.
    pub failure_code: i64,
    /// Failure category.
    pub failure_type: String,
    /// Human-readable message.
    pub message: String,
}

/// One protocol message exchanged over the connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Envelope discriminant.
    pub kind: EnvelopeType,
    /// Destination or subscription address.
    pub address: Option<String>,
    /// One-time address the sender expects a reply on.
    pub reply_address: Option<String>,
    /// Application headers.
    pub headers: HashMap<String, String>,
    /// Payload.
    pub body: Option<Value>,
    /// Present only on error replies.
    pub failure: Option<Failure>,
    /// Error text of an `err` envelope.
    pub message: Option<String>,
}

impl Envelope {
    /// Create a bare envelope of the given type.
    #[must_use]
    pub fn new(kind: EnvelopeType) -> Self {
        Self {
            kind,
            address: None,
            reply_address: None,
            headers: HashMap::new(),
            body: None,
            failure: None,
            message: None,
        }
    }

    /// Point-to-point envelope.
    #[must_use]
    pub fn send(address: impl Into<String>, body: Value) -> Self {
        Self::new(EnvelopeType::Send)
            .with_address(address)
            .with_body(body)
    }

    /// Broadcast envelope.
    #[must_use]
    pub fn publish(address: impl Into<String>, body: Value) -> Self {
        Self::new(EnvelopeType::Publish)
            .with_address(address)
            .with_body(body)
    }

    /// Subscription control envelope.
    #[must_use]
    pub fn register(address: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Register).with_address(address)
    }

    /// Unsubscription control envelope.
    #[must_use]
    pub fn unregister(address: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Unregister).with_address(address)
    }

    /// Connection-level error envelope.
    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeType::Error);
        envelope.message = Some(message.into());
        envelope
    }

    /// Keep-alive request.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(EnvelopeType::Ping)
    }

    /// Error reply addressed to a pending reply address.
    #[must_use]
    pub fn failure_reply(reply_address: impl Into<String>, failure: Failure) -> Self {
        let mut envelope = Self::new(EnvelopeType::Send).with_address(reply_address);
        envelope.failure = Some(failure);
        envelope
    }

    /// Set the address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the reply address.
    #[must_use]
    pub fn with_reply_address(mut self, reply_address: impl Into<String>) -> Self {
        self.reply_address = Some(reply_address.into());
        self
    }

    /// Replace the application headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body. A JSON `null` is treated as no body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = (!body.is_null()).then_some(body);
        self
    }

    /// Error text of an `err` envelope, falling back to a string body.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.message
            .as_deref()
            .or_else(|| self.body.as_ref().and_then(Value::as_str))
            .unwrap_or("unknown error")
    }

    /// Serialize to JSON text in the given layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized.
    pub fn to_json(&self, format: WireFormat) -> Result<Vec<u8>> {
        let kind = self.kind.wire_name(format);
        let failure = self.failure.as_ref();
        let message = failure.map(|f| f.message.as_str()).or(self.message.as_deref());

        let encoded = match format {
            WireFormat::Text => serde_json::to_vec(&TextFrame {
                kind,
                address: self.address.as_deref(),
                reply_address: self.reply_address.as_deref(),
                headers: &self.headers,
                body: self.body.as_ref(),
                failure_code: failure.map(|f| f.failure_code),
                failure_type: failure.map(|f| f.failure_type.as_str()),
                message,
            }),
            WireFormat::Binary => {
                let mut headers: Map<String, Value> = self
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                if let Some(address) = &self.address {
                    headers.insert(ADDRESS.to_string(), Value::from(address.as_str()));
                }
                if let Some(reply_address) = &self.reply_address {
                    headers.insert(REPLY_ADDRESS.to_string(), Value::from(reply_address.as_str()));
                }
                if let Some(failure) = failure {
                    headers.insert(FAILURE_CODE.to_string(), Value::from(failure.failure_code));
                    headers.insert(
                        FAILURE_TYPE.to_string(),
                        Value::from(failure.failure_type.as_str()),
                    );
                }
                if let Some(message) = message {
                    headers.insert(MESSAGE.to_string(), Value::from(message));
                }

                serde_json::to_vec(&BinaryFrame {
                    kind,
                    headers,
                    body: self.body.as_ref(),
                })
            }
        };

        encoded.map_err(|e| CodecError::SerializationFailed(e.to_string()).into())
    }

    /// Parse JSON text in either layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON, the type is unknown,
    /// or a field the type requires is missing.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut frame: InboundFrame = serde_json::from_slice(data)
            .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;

        let kind: EnvelopeType = frame
            .kind
            .as_deref()
            .ok_or(ProtocolError::MissingField("type"))?
            .parse()?;

        let mut headers = frame.headers.take().unwrap_or_default();
        // Reserved keys in headers only carry protocol fields when nothing
        // sits at the top level; otherwise they are application headers.
        let mut nested = Map::new();
        if !frame.is_flat() {
            for key in RESERVED {
                if let Some(value) = headers.remove(key) {
                    nested.insert(key.to_string(), value);
                }
            }
        }

        let address = frame.address.or_else(|| take_string(&mut nested, ADDRESS));
        let reply_address = frame
            .reply_address
            .or_else(|| take_string(&mut nested, REPLY_ADDRESS));
        let failure_code = match frame.failure_code {
            Some(code) => parse_code(code),
            None => nested.remove(FAILURE_CODE).and_then(parse_code),
        };
        let failure_type = frame
            .failure_type
            .or_else(|| take_string(&mut nested, FAILURE_TYPE));
        let message = frame.message.or_else(|| take_string(&mut nested, MESSAGE));

        if kind.requires_address() && address.is_none() {
            return Err(ProtocolError::MissingField(ADDRESS).into());
        }

        let (failure, message) = match failure_code {
            Some(failure_code) => (
                Some(Failure {
                    failure_code,
                    failure_type: failure_type.unwrap_or_default(),
                    message: message.unwrap_or_default(),
                }),
                None,
            ),
            None => (None, message),
        };

        Ok(Self {
            kind,
            address,
            reply_address,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k, header_value(v)))
                .collect(),
            body: frame.body.filter(|b| !b.is_null()),
            failure,
            message,
        })
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn no_headers(headers: &&HashMap<String, String>) -> bool {
    headers.is_empty()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TextFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_address: Option<&'a str>,
    #[serde(skip_serializing_if = "no_headers")]
    headers: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct BinaryFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    headers: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    address: Option<String>,
    reply_address: Option<String>,
    headers: Option<Map<String, Value>>,
    body: Option<Value>,
    failure_code: Option<Value>,
    failure_type: Option<String>,
    message: Option<String>,
}

impl InboundFrame {
    /// Whether any protocol field sits at the top level, as in the text
    /// layout.
    const fn is_flat(&self) -> bool {
        self.address.is_some()
            || self.reply_address.is_some()
            || self.failure_code.is_some()
            || self.failure_type.is_some()
            || self.message.is_some()
    }
}

fn take_string(headers: &mut Map<String, Value>, key: &str) -> Option<String> {
    headers.remove(key).map(header_value)
}

/// Failure codes arrive as numbers or numeric strings.
fn parse_code(value: Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn header_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_value(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_text_layout_is_flat() {
        let envelope = Envelope::send("echo", json!({"value": "vert.x"})).with_reply_address("r-1");

        let encoded = as_value(&envelope.to_json(WireFormat::Text).unwrap());

        assert_eq!(
            encoded,
            json!({
                "type": "send",
                "address": "echo",
                "replyAddress": "r-1",
                "body": {"value": "vert.x"}
            })
        );
    }

    #[test]
    fn test_binary_layout_nests_protocol_fields() {
        let mut headers = HashMap::new();
        headers.insert("trace".to_string(), "abc".to_string());
        let envelope = Envelope::send("echo", json!(1))
            .with_reply_address("r-1")
            .with_headers(headers);

        let encoded = as_value(&envelope.to_json(WireFormat::Binary).unwrap());

        assert_eq!(
            encoded,
            json!({
                "type": "message",
                "headers": {"address": "echo", "replyAddress": "r-1", "trace": "abc"},
                "body": 1
            })
        );
    }

    #[test]
    fn test_control_frames_omit_body() {
        let encoded = as_value(&Envelope::register("news").to_json(WireFormat::Text).unwrap());
        assert_eq!(encoded, json!({"type": "register", "address": "news"}));

        let encoded = as_value(&Envelope::unregister("news").to_json(WireFormat::Binary).unwrap());
        assert_eq!(encoded, json!({"type": "unregister", "headers": {"address": "news"}}));
    }

    #[test]
    fn test_roundtrip_both_layouts() {
        let mut headers = HashMap::new();
        headers.insert("k".to_string(), "v".to_string());
        let envelopes = vec![
            Envelope::send("a", json!({"x": [1, 2, 3]})).with_reply_address("r"),
            Envelope::publish("b", json!("text")).with_headers(headers),
            Envelope::register("c"),
            Envelope::unregister("c"),
            Envelope::err("access_denied"),
            Envelope::ping(),
            Envelope::failure_reply(
                "r",
                Failure {
                    failure_code: 1,
                    failure_type: "NO_HANDLERS".to_string(),
                    message: "no handlers".to_string(),
                },
            ),
        ];

        for format in [WireFormat::Text, WireFormat::Binary] {
            for envelope in &envelopes {
                let decoded = Envelope::from_json(&envelope.to_json(format).unwrap()).unwrap();
                assert_eq!(&decoded, envelope, "{format} layout");
            }
        }
    }

    #[test]
    fn test_decode_failure_from_headers() {
        let data = br#"{"type":"message","headers":{"address":"r","failureCode":1,"failureType":"NO_HANDLERS","message":"no handlers"}}"#;

        let envelope = Envelope::from_json(data).unwrap();

        assert_eq!(envelope.address.as_deref(), Some("r"));
        assert_eq!(
            envelope.failure,
            Some(Failure {
                failure_code: 1,
                failure_type: "NO_HANDLERS".to_string(),
                message: "no handlers".to_string(),
            })
        );
        assert!(envelope.headers.is_empty());
    }

    #[test]
    fn test_decode_flat_failure_fields() {
        let data = br#"{"type":"message","address":"r","failureCode":2,"failureType":"TIMEOUT","message":"timed out"}"#;

        let envelope = Envelope::from_json(data).unwrap();

        assert_eq!(envelope.address.as_deref(), Some("r"));
        assert_eq!(envelope.failure.map(|f| f.failure_type), Some("TIMEOUT".to_string()));
        assert_eq!(envelope.message, None);
    }

    #[test]
    fn test_string_failure_code_in_headers() {
        let data = br#"{"type":"message","headers":{"address":"r","failureCode":"3"}}"#;

        let envelope = Envelope::from_json(data).unwrap();

        assert_eq!(envelope.failure.map(|f| f.failure_code), Some(3));
    }

    #[test]
    fn test_string_failure_code_at_top_level() {
        let data = br#"{"type":"send","address":"r","failureCode":"1","failureType":"NO_HANDLERS","message":"none"}"#;

        let envelope = Envelope::from_json(data).unwrap();

        assert_eq!(
            envelope.failure,
            Some(Failure {
                failure_code: 1,
                failure_type: "NO_HANDLERS".to_string(),
                message: "none".to_string(),
            })
        );
    }

    #[test]
    fn test_reserved_header_names_survive_text_layout() {
        let mut headers = HashMap::new();
        headers.insert("message".to_string(), "hello".to_string());
        headers.insert("replyAddress".to_string(), "not-mine".to_string());
        let envelope = Envelope::send("a", json!(1)).with_headers(headers.clone());

        let decoded = Envelope::from_json(&envelope.to_json(WireFormat::Text).unwrap()).unwrap();

        assert_eq!(decoded.headers, headers);
        assert_eq!(decoded.message, None);
        assert_eq!(decoded.reply_address, None);
    }

    #[test]
    fn test_server_send_flag_is_ignored() {
        let data = br#"{"type":"message","address":"news","send":false,"body":{"n":1}}"#;

        let envelope = Envelope::from_json(data).unwrap();

        assert_eq!(envelope.kind, EnvelopeType::Send);
        assert_eq!(envelope.body, Some(json!({"n": 1})));
    }

    #[test]
    fn test_missing_address_is_rejected() {
        let err = Envelope::from_json(br#"{"type":"publish","body":1}"#).unwrap_err();
        assert!(err.to_string().contains("address"));
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let err = Envelope::from_json(br#"{"address":"a"}"#).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Envelope::from_json(br#"{"type":"shout","address":"a"}"#).unwrap_err();
        assert!(err.to_string().contains("shout"));
    }

    #[test]
    fn test_err_message_falls_back_to_body() {
        let envelope = Envelope::from_json(br#"{"type":"err","body":"boom"}"#).unwrap();
        assert_eq!(envelope.error_message(), "boom");

        let envelope = Envelope::from_json(br#"{"type":"err","message":"access_denied"}"#).unwrap();
        assert_eq!(envelope.error_message(), "access_denied");
    }

    #[test]
    fn test_non_string_headers_are_stringified() {
        let data = br#"{"type":"message","headers":{"address":"a","n":3,"ok":true}}"#;

        let envelope = Envelope::from_json(data).unwrap();

        assert_eq!(envelope.headers.get("n").map(String::as_str), Some("3"));
        assert_eq!(envelope.headers.get("ok").map(String::as_str), Some("true"));
    }
}
