//! Wire protocol message types.
//!
//! Every frame exchanged between peers is a [`SignedMessage`]: a JSON envelope
//! carrying a `msg_type` string and a `payload` object. On the wire each frame
//! is prefixed with a 4-byte big-endian length header.
//!
//! Callers work with the typed [`MessageBody`] instead of raw JSON. Known
//! message types are schema-checked when decoded; unknown types survive as
//! [`MessageBody::Opaque`] so newer peers can add message kinds without
//! breaking older ones.

use crate::record::{Contact, PeerRecord};
use agentmesh_types::config::PROTOCOL_VERSION;
use agentmesh_types::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Upper bound on an inflated delivery payload.
pub const MAX_INFLATED_SIZE: u64 = 4 * MAX_FRAME_SIZE as u64;

/// Random bytes in a message nonce.
pub const NONCE_LEN: usize = 16;

/// Message type names as they appear on the wire.
pub mod msg_types {
    pub const HANDSHAKE: &str = "handshake";
    pub const HANDSHAKE_ACK: &str = "handshake_ack";
    pub const DELIVER: &str = "deliver";
    pub const CHUNK: &str = "chunk";
    pub const ENCRYPTED: &str = "encrypted";
    pub const ACK: &str = "ack";
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SESSION_CLOSE: &str = "session_close";
    pub const DHT_STORE: &str = "dht_store";
    pub const DHT_FIND_NODE: &str = "dht_find_node";
    pub const DHT_FIND_VALUE: &str = "dht_find_value";
    pub const DHT_RESULT: &str = "dht_result";
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub version: String,
    pub msg_type: String,
    /// `peer_id` of the sender (hex SHA-256 of its public key).
    pub sender_id: String,
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sequence_num: Option<u64>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Hex-encoded random nonce (at least 16 bytes).
    pub nonce: String,
    /// Base64 Ed25519 signature over [`SignedMessage::signing_bytes`].
    #[serde(default)]
    pub signature: Option<String>,
}

/// The fields covered by the signature, in a fixed order.
#[derive(Serialize)]
struct SigningView<'a> {
    version: &'a str,
    msg_type: &'a str,
    sender_id: &'a str,
    recipient_id: Option<&'a str>,
    session_id: Option<&'a str>,
    sequence_num: Option<u64>,
    payload: &'a Value,
    timestamp: String,
    nonce: &'a str,
}

impl SignedMessage {
    /// Build an unsigned envelope with a fresh nonce and the current time.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: Option<String>,
        body: &MessageBody,
    ) -> MeshResult<Self> {
        let (msg_type, payload) = body.to_parts()?;
        Ok(Self {
            version: PROTOCOL_VERSION.to_string(),
            msg_type,
            sender_id: sender_id.into(),
            recipient_id,
            session_id: None,
            sequence_num: None,
            payload,
            timestamp: Utc::now(),
            nonce: generate_nonce(),
            signature: None,
        })
    }

    /// Attach session ordering fields.
    pub fn with_session(mut self, session_id: impl Into<String>, sequence_num: u64) -> Self {
        self.session_id = Some(session_id.into());
        self.sequence_num = Some(sequence_num);
        self
    }

    /// Canonical bytes covered by the signature.
    ///
    /// JSON objects inside the payload serialize with sorted keys, so the
    /// bytes only depend on the logical content. The signature field itself
    /// is never included.
    pub fn signing_bytes(&self) -> MeshResult<Vec<u8>> {
        let view = SigningView {
            version: &self.version,
            msg_type: &self.msg_type,
            sender_id: &self.sender_id,
            recipient_id: self.recipient_id.as_deref(),
            session_id: self.session_id.as_deref(),
            sequence_num: self.sequence_num,
            payload: &self.payload,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            nonce: &self.nonce,
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Decode the typed body.
    pub fn body(&self) -> MeshResult<MessageBody> {
        MessageBody::from_parts(&self.msg_type, self.payload.clone())
    }
}

/// Generate a hex-encoded random nonce.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Typed message bodies, one per `msg_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Handshake(HandshakeOffer),
    HandshakeAck(HandshakeAck),
    Deliver(Delivery),
    Chunk(ChunkEnvelope),
    Encrypted(SealedPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    SessionClose(SessionClosePayload),
    DhtStore(DhtStoreRequest),
    DhtFindNode(DhtFindRequest),
    DhtFindValue(DhtFindRequest),
    DhtResult(DhtResultPayload),
    /// A message type this node does not know. Kept verbatim.
    Opaque { msg_type: String, payload: Value },
}

impl MessageBody {
    /// The wire name of this body.
    pub fn msg_type(&self) -> &str {
        match self {
            MessageBody::Handshake(_) => msg_types::HANDSHAKE,
            MessageBody::HandshakeAck(_) => msg_types::HANDSHAKE_ACK,
            MessageBody::Deliver(_) => msg_types::DELIVER,
            MessageBody::Chunk(_) => msg_types::CHUNK,
            MessageBody::Encrypted(_) => msg_types::ENCRYPTED,
            MessageBody::Ack(_) => msg_types::ACK,
            MessageBody::Error(_) => msg_types::ERROR,
            MessageBody::Ping(_) => msg_types::PING,
            MessageBody::Pong(_) => msg_types::PONG,
            MessageBody::SessionClose(_) => msg_types::SESSION_CLOSE,
            MessageBody::DhtStore(_) => msg_types::DHT_STORE,
            MessageBody::DhtFindNode(_) => msg_types::DHT_FIND_NODE,
            MessageBody::DhtFindValue(_) => msg_types::DHT_FIND_VALUE,
            MessageBody::DhtResult(_) => msg_types::DHT_RESULT,
            MessageBody::Opaque { msg_type, .. } => msg_type,
        }
    }

    /// Split into the `(msg_type, payload)` pair carried by the envelope.
    pub fn to_parts(&self) -> MeshResult<(String, Value)> {
        let payload = match self {
            MessageBody::Handshake(p) => serde_json::to_value(p)?,
            MessageBody::HandshakeAck(p) => serde_json::to_value(p)?,
            MessageBody::Deliver(p) => serde_json::to_value(p)?,
            MessageBody::Chunk(p) => serde_json::to_value(p)?,
            MessageBody::Encrypted(p) => serde_json::to_value(p)?,
            MessageBody::Ack(p) => serde_json::to_value(p)?,
            MessageBody::Error(p) => serde_json::to_value(p)?,
            MessageBody::Ping(p) => serde_json::to_value(p)?,
            MessageBody::Pong(p) => serde_json::to_value(p)?,
            MessageBody::SessionClose(p) => serde_json::to_value(p)?,
            MessageBody::DhtStore(p) => serde_json::to_value(p)?,
            MessageBody::DhtFindNode(p) => serde_json::to_value(p)?,
            MessageBody::DhtFindValue(p) => serde_json::to_value(p)?,
            MessageBody::DhtResult(p) => serde_json::to_value(p)?,
            MessageBody::Opaque { payload, .. } => payload.clone(),
        };
        Ok((self.msg_type().to_string(), payload))
    }

    /// Rebuild a typed body, validating the payload schema of known types.
    pub fn from_parts(msg_type: &str, payload: Value) -> MeshResult<Self> {
        fn parse<T: DeserializeOwned>(msg_type: &str, payload: Value) -> MeshResult<T> {
            serde_json::from_value(payload).map_err(|e| {
                MeshError::Serialization(format!("invalid '{msg_type}' payload: {e}"))
            })
        }

        let body = match msg_type {
            msg_types::HANDSHAKE => MessageBody::Handshake(parse(msg_type, payload)?),
            msg_types::HANDSHAKE_ACK => MessageBody::HandshakeAck(parse(msg_type, payload)?),
            msg_types::DELIVER => MessageBody::Deliver(parse(msg_type, payload)?),
            msg_types::CHUNK => MessageBody::Chunk(parse(msg_type, payload)?),
            msg_types::ENCRYPTED => MessageBody::Encrypted(parse(msg_type, payload)?),
            msg_types::ACK => MessageBody::Ack(parse(msg_type, payload)?),
            msg_types::ERROR => MessageBody::Error(parse(msg_type, payload)?),
            msg_types::PING => MessageBody::Ping(parse(msg_type, payload)?),
            msg_types::PONG => MessageBody::Pong(parse(msg_type, payload)?),
            msg_types::SESSION_CLOSE => MessageBody::SessionClose(parse(msg_type, payload)?),
            msg_types::DHT_STORE => MessageBody::DhtStore(parse(msg_type, payload)?),
            msg_types::DHT_FIND_NODE => MessageBody::DhtFindNode(parse(msg_type, payload)?),
            msg_types::DHT_FIND_VALUE => MessageBody::DhtFindValue(parse(msg_type, payload)?),
            msg_types::DHT_RESULT => MessageBody::DhtResult(parse(msg_type, payload)?),
            other => MessageBody::Opaque {
                msg_type: other.to_string(),
                payload,
            },
        };
        Ok(body)
    }
}

/// Session handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    pub session_id: String,
    /// Hex-encoded random challenge echoed by the responder.
    pub challenge: String,
    /// Base64 X25519 ephemeral public key. Absent for plain sessions.
    #[serde(default)]
    pub ephemeral_public_key: Option<String>,
    pub supported_versions: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub e2e_enabled: bool,
    /// Base64 Ed25519 identity key of the initiator.
    pub identity_public_key: String,
    /// The initiator's signed directory record.
    #[serde(default)]
    pub record: Option<PeerRecord>,
}

/// Session handshake acknowledgement. Mirrors the offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub session_id: String,
    pub challenge: String,
    #[serde(default)]
    pub ephemeral_public_key: Option<String>,
    pub supported_versions: Vec<String>,
    /// Version chosen by the responder from the offer.
    pub selected_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub e2e_enabled: bool,
    pub identity_public_key: String,
    /// Hex HMAC over the challenge under the derived session key. Proves the
    /// responder holds the same key.
    #[serde(default)]
    pub authenticator: Option<String>,
    #[serde(default)]
    pub record: Option<PeerRecord>,
}

/// An application payload addressed to a registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Idempotent logical message id.
    pub message_id: String,
    /// Application-level message type (selects the handler).
    pub msg_type: String,
    /// Application payload. A base64 gzip string when `compressed`.
    pub payload: Value,
    #[serde(default)]
    pub compressed: bool,
}

impl Delivery {
    /// Replace the payload with base64 gzip of its JSON form.
    pub fn compress(mut self) -> MeshResult<Self> {
        if self.compressed {
            return Ok(self);
        }
        let json = serde_json::to_vec(&self.payload)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&json)?;
        let packed = encoder.finish()?;
        self.payload = Value::String(BASE64.encode(packed));
        self.compressed = true;
        Ok(self)
    }

    /// Undo [`Delivery::compress`].
    pub fn decompress(mut self) -> MeshResult<Self> {
        if !self.compressed {
            return Ok(self);
        }
        let encoded = self.payload.as_str().ok_or_else(|| {
            MeshError::Serialization("compressed payload is not a string".into())
        })?;
        let packed = BASE64
            .decode(encoded)
            .map_err(|e| MeshError::Serialization(format!("compressed payload: {e}")))?;
        let mut json = Vec::new();
        GzDecoder::new(packed.as_slice())
            .take(MAX_INFLATED_SIZE + 1)
            .read_to_end(&mut json)
            .map_err(|e| MeshError::Serialization(format!("gzip: {e}")))?;
        if json.len() as u64 > MAX_INFLATED_SIZE {
            return Err(MeshError::MessageTooLarge {
                size: json.len() as u64,
                max: MAX_INFLATED_SIZE,
            });
        }
        self.payload = serde_json::from_slice(&json)?;
        self.compressed = false;
        Ok(self)
    }
}

/// One fragment of a chunked delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub chunk_id: String,
    pub index: u32,
    pub total_chunks: u32,
    /// Base64 fragment bytes.
    pub data: String,
}

/// An AEAD-sealed inner body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Base64 96-bit AES-GCM nonce.
    pub nonce: String,
    /// Base64 ciphertext with the GCM tag appended.
    pub ciphertext: String,
}

/// Plaintext inside a [`SealedPayload`]: the body the envelope would have
/// carried unencrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBody {
    pub msg_type: String,
    pub payload: Value,
}

impl SealedBody {
    pub fn from_body(body: &MessageBody) -> MeshResult<Self> {
        let (msg_type, payload) = body.to_parts()?;
        Ok(Self { msg_type, payload })
    }

    pub fn into_body(self) -> MeshResult<MessageBody> {
        MessageBody::from_parts(&self.msg_type, self.payload)
    }
}

/// Successful response to a request frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default)]
    pub message_id: Option<String>,
    /// Optional reply produced by the receiving handler.
    #[serde(default)]
    pub reply: Option<Value>,
    /// `false` while a chunked delivery is still incomplete.
    #[serde(default = "default_true")]
    pub complete: bool,
}

fn default_true() -> bool {
    true
}

/// Rejection of a request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<u64>,
}

impl From<&MeshError> for ErrorPayload {
    fn from(err: &MeshError) -> Self {
        let (expected, received) = match err {
            MeshError::SequenceError { expected, received } => (Some(*expected), Some(*received)),
            _ => (None, None),
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            expected,
            received,
        }
    }
}

impl ErrorPayload {
    /// Rebuild the typed error.
    pub fn into_error(self) -> MeshError {
        MeshError::from_wire(self.code, self.message, self.expected, self.received)
    }
}

/// Liveness probe. Carries the caller's contact so the callee can learn it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub origin: Option<Contact>,
}

/// Liveness reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub contact: Contact,
    pub uptime_secs: u64,
}

/// Explicit session termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClosePayload {
    pub session_id: String,
    pub reason: String,
}

/// Ask a DHT node to store a record under `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtStoreRequest {
    pub origin: Contact,
    /// Hex DHT key.
    pub key: String,
    pub record: PeerRecord,
}

/// Ask a DHT node for the contacts (or value) closest to `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtFindRequest {
    pub origin: Contact,
    pub key: String,
}

/// Reply to a DHT find request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DhtResultPayload {
    #[serde(default)]
    pub record: Option<PeerRecord>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(msg: &SignedMessage) -> MeshResult<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_SIZE as usize {
        return Err(MeshError::MessageTooLarge {
            size: json.len() as u64,
            max: MAX_FRAME_SIZE as u64,
        });
    }
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a SignedMessage.
pub fn decode_frame(body: &[u8]) -> MeshResult<SignedMessage> {
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver_body() -> MessageBody {
        MessageBody::Deliver(Delivery {
            message_id: "m-1".to_string(),
            msg_type: "task.offer".to_string(),
            payload: serde_json::json!({"task": "summarize", "budget": 12}),
            compressed: false,
        })
    }

    #[test]
    fn test_frame_length_prefix() {
        let msg = SignedMessage::new("peer-a", Some("peer-b".into()), &deliver_body()).unwrap();
        let bytes = encode_frame(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_frame(&bytes[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = SignedMessage::new("peer-a", None, &MessageBody::Ping(PingPayload::default()))
            .unwrap()
            .with_session("s-1", 4);
        let json = serde_json::to_value(&msg).unwrap();
        for field in [
            "version",
            "msg_type",
            "sender_id",
            "recipient_id",
            "session_id",
            "sequence_num",
            "payload",
            "timestamp",
            "nonce",
            "signature",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(json["msg_type"], "ping");
        assert_eq!(json["sequence_num"], 4);
    }

    #[test]
    fn test_nonce_is_sixteen_bytes_hex() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LEN * 2);
        assert!(hex::decode(&nonce).is_ok());
        assert_ne!(nonce, generate_nonce());
    }

    #[test]
    fn test_signing_bytes_ignore_signature() {
        let mut msg = SignedMessage::new("peer-a", None, &deliver_body()).unwrap();
        let before = msg.signing_bytes().unwrap();
        msg.signature = Some("c2ln".to_string());
        assert_eq!(before, msg.signing_bytes().unwrap());
    }

    #[test]
    fn test_signing_bytes_cover_payload() {
        let mut msg = SignedMessage::new("peer-a", None, &deliver_body()).unwrap();
        let before = msg.signing_bytes().unwrap();
        msg.payload["payload"]["budget"] = serde_json::json!(13);
        assert_ne!(before, msg.signing_bytes().unwrap());
    }

    #[test]
    fn test_unknown_type_is_opaque() {
        let body =
            MessageBody::from_parts("telemetry.v2", serde_json::json!({"cpu": 0.5})).unwrap();
        match &body {
            MessageBody::Opaque { msg_type, payload } => {
                assert_eq!(msg_type, "telemetry.v2");
                assert_eq!(payload["cpu"], 0.5);
            }
            other => panic!("Expected Opaque, got {other:?}"),
        }
        let (msg_type, _) = body.to_parts().unwrap();
        assert_eq!(msg_type, "telemetry.v2");
    }

    #[test]
    fn test_known_type_schema_enforced() {
        let err = MessageBody::from_parts("chunk", serde_json::json!({"index": "zero"}));
        assert!(matches!(err, Err(MeshError::Serialization(_))));
    }

    #[test]
    fn test_error_payload_carries_sequence_fields() {
        let err = MeshError::SequenceError {
            expected: 3,
            received: 9,
        };
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, 422);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["expected"], 3);
        assert_eq!(json["received"], 9);
        assert!(matches!(
            payload.into_error(),
            MeshError::SequenceError {
                expected: 3,
                received: 9
            }
        ));
    }

    #[test]
    fn test_compressed_delivery_restores_payload() {
        let original = Delivery {
            message_id: "m-2".into(),
            msg_type: "report".into(),
            payload: serde_json::json!({"rows": vec!["same row"; 200]}),
            compressed: false,
        };
        let packed = original.clone().compress().unwrap();
        assert!(packed.compressed);
        assert!(packed.payload.is_string());
        let packed_len = packed.payload.as_str().unwrap().len();
        assert!(packed_len < serde_json::to_vec(&original.payload).unwrap().len());
        assert_eq!(packed.decompress().unwrap(), original);
    }

    #[test]
    fn test_garbage_compressed_payload_rejected() {
        let bogus = Delivery {
            message_id: "m-3".into(),
            msg_type: "report".into(),
            payload: Value::String("bm90IGd6aXA=".into()),
            compressed: true,
        };
        assert!(matches!(bogus.decompress(), Err(MeshError::Serialization(_))));
    }

    #[test]
    fn test_sealed_body_keeps_type() {
        let sealed = SealedBody::from_body(&deliver_body()).unwrap();
        assert_eq!(sealed.msg_type, "deliver");
        assert_eq!(sealed.into_body().unwrap(), deliver_body());
    }

    #[test]
    fn test_ack_defaults_complete() {
        let ack: AckPayload = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(ack.complete);
        assert!(ack.reply.is_none());
    }
}
