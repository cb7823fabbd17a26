//! Shared error types for the agentmesh transport.

use thiserror::Error;

/// Top-level error type for the transport.
///
/// The first group of variants is the protocol taxonomy; every one of them
/// maps to a stable wire code (see [`MeshError::code`]) so that a rejection
/// produced on the receiving node can be rebuilt on the sending node.
#[derive(Error, Debug)]
pub enum MeshError {
    /// A signature was missing, malformed, made by an unknown key, or did not
    /// match the signed bytes.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The (sender, nonce) pair was already seen, or the timestamp fell
    /// outside the replay window.
    #[error("Replayed message: {0}")]
    Replayed(String),

    /// An inbound sequence number did not match the session's expected value.
    #[error("Sequence error: expected {expected}, received {received}")]
    SequenceError {
        /// The next sequence number the receiver would accept.
        expected: u64,
        /// The sequence number that was actually received.
        received: u64,
    },

    /// The session handshake could not be completed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD tag verification failed. The session is torn down.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// A chunked payload did not complete before its buffer expired.
    #[error("Chunk reassembly timed out: {0}")]
    ChunkTimeout(String),

    /// A send was refused by flow control.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The peer could not be reached over the transport.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// No record exists for the requested peer.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A directory record is past its `timestamp + ttl`.
    #[error("Record expired: {0}")]
    RecordExpired(String),

    /// A message referenced a session that does not exist or has expired.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No handler is registered for the delivered message type.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// A frame exceeded the maximum accepted size.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Declared size of the frame.
        size: u64,
        /// Maximum accepted size.
        max: u64,
    },

    /// The peer speaks no protocol version we support.
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Versions supported locally.
        local: String,
        /// Version(s) offered by the remote side.
        remote: String,
    },

    /// A caller-supplied deadline elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Stable numeric code carried in `error` response frames.
    pub fn code(&self) -> u16 {
        match self {
            MeshError::InvalidSignature => 401,
            MeshError::HandshakeFailed(_) => 403,
            MeshError::PeerNotFound(_) => 404,
            MeshError::ChunkTimeout(_) => 408,
            MeshError::Replayed(_) => 409,
            MeshError::RecordExpired(_) => 410,
            MeshError::MessageTooLarge { .. } => 413,
            MeshError::SequenceError { .. } => 422,
            MeshError::RateLimited(_) => 429,
            MeshError::SessionNotFound(_) => 440,
            MeshError::DecryptionFailed => 498,
            MeshError::Serialization(_) => 400,
            MeshError::UnknownMessageType(_) => 501,
            MeshError::PeerUnreachable(_) => 503,
            MeshError::Timeout(_) => 504,
            MeshError::VersionMismatch { .. } => 505,
            MeshError::Config(_) | MeshError::Io(_) | MeshError::Internal(_) => 500,
        }
    }

    /// Rebuild a typed error from the fields of an `error` response frame.
    pub fn from_wire(
        code: u16,
        message: String,
        expected: Option<u64>,
        received: Option<u64>,
    ) -> Self {
        match code {
            401 => MeshError::InvalidSignature,
            403 => MeshError::HandshakeFailed(message),
            404 => MeshError::PeerNotFound(message),
            408 => MeshError::ChunkTimeout(message),
            409 => MeshError::Replayed(message),
            410 => MeshError::RecordExpired(message),
            413 => MeshError::MessageTooLarge { size: 0, max: 0 },
            422 => MeshError::SequenceError {
                expected: expected.unwrap_or_default(),
                received: received.unwrap_or_default(),
            },
            429 => MeshError::RateLimited(message),
            440 => MeshError::SessionNotFound(message),
            498 => MeshError::DecryptionFailed,
            400 => MeshError::Serialization(message),
            501 => MeshError::UnknownMessageType(message),
            503 => MeshError::PeerUnreachable(message),
            504 => MeshError::Timeout(message),
            505 => MeshError::VersionMismatch {
                local: String::new(),
                remote: message,
            },
            _ => MeshError::Internal(format!("remote error {code}: {message}")),
        }
    }

    /// Whether this error must tear down the session it occurred in.
    ///
    /// Decryption failures and bad handshake signatures leave the session in
    /// a state that cannot be trusted.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::DecryptionFailed | MeshError::HandshakeFailed(_)
        )
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_error_survives_wire() {
        let err = MeshError::SequenceError {
            expected: 7,
            received: 12,
        };
        let rebuilt = MeshError::from_wire(err.code(), err.to_string(), Some(7), Some(12));
        match rebuilt {
            MeshError::SequenceError { expected, received } => {
                assert_eq!(expected, 7);
                assert_eq!(received, 12);
            }
            other => panic!("Expected SequenceError, got {other:?}"),
        }
    }

    #[test]
    fn test_codes_are_distinct_for_taxonomy() {
        let errors = [
            MeshError::InvalidSignature,
            MeshError::Replayed(String::new()),
            MeshError::SequenceError {
                expected: 0,
                received: 0,
            },
            MeshError::HandshakeFailed(String::new()),
            MeshError::DecryptionFailed,
            MeshError::ChunkTimeout(String::new()),
            MeshError::RateLimited(String::new()),
            MeshError::PeerUnreachable(String::new()),
            MeshError::PeerNotFound(String::new()),
            MeshError::RecordExpired(String::new()),
        ];
        let mut codes: Vec<u16> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MeshError::DecryptionFailed.is_session_fatal());
        assert!(MeshError::HandshakeFailed("bad sig".into()).is_session_fatal());
        assert!(!MeshError::RateLimited("low".into()).is_session_fatal());
    }

    #[test]
    fn test_unknown_code_is_internal() {
        let err = MeshError::from_wire(999, "boom".into(), None, None);
        assert!(matches!(err, MeshError::Internal(_)));
    }
}
