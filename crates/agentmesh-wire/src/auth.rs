//! Message authentication: signing outgoing envelopes and verifying incoming ones.
//!
//! Verification fails closed. Any malformed field, unknown signer or signature
//! mismatch is reported as [`MeshError::InvalidSignature`]. Unsigned messages are
//! only let through when legacy traffic is explicitly allowed, and are then
//! flagged as [`Authenticity::UnsignedLegacy`] so handlers can tell the
//! difference.

use crate::identity::{decode_public_key, Keypair, KeyRing};
use crate::message::{MessageBody, SignedMessage, NONCE_LEN};
use crate::replay::ReplayGuard;
use agentmesh_types::config::SecurityConfig;
use agentmesh_types::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier};
use std::time::Duration;
use tracing::{debug, warn};

/// How an accepted message was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    /// Signature verified against the sender's key.
    Verified,
    /// Unsigned message accepted under the legacy allowance.
    UnsignedLegacy,
}

/// Signs, verifies and replay-checks envelopes for one local identity.
#[derive(Debug)]
pub struct Authenticator {
    keypair: Keypair,
    peer_id: String,
    keyring: KeyRing,
    replay: ReplayGuard,
    allow_unsigned_legacy: bool,
}

impl Authenticator {
    /// Create an authenticator for `keypair`.
    pub fn new(keypair: Keypair, security: &SecurityConfig) -> Self {
        let peer_id = keypair.peer_id();
        let keyring = KeyRing::new();
        keyring.learn(keypair.public_key());
        Self {
            keypair,
            peer_id,
            keyring,
            replay: ReplayGuard::new(
                Duration::from_secs(security.replay_window_secs),
                Duration::from_secs(security.clock_skew_secs),
            ),
            allow_unsigned_legacy: security.allow_unsigned_legacy,
        }
    }

    /// The local peer id.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The local key pair.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Known peer keys.
    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    /// The nonce cache.
    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    /// Sign raw bytes with the local key.
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.keypair.sign(payload)
    }

    /// Fill in the signature of an envelope sent by this node.
    pub fn sign_message(&self, msg: &mut SignedMessage) -> MeshResult<()> {
        if msg.sender_id != self.peer_id {
            return Err(MeshError::Internal(format!(
                "refusing to sign message for sender {}",
                msg.sender_id
            )));
        }
        let bytes = msg.signing_bytes()?;
        msg.signature = Some(BASE64.encode(self.keypair.sign(&bytes)));
        Ok(())
    }

    /// Build and sign an envelope from this node.
    pub fn envelope(
        &self,
        recipient_id: Option<String>,
        body: &MessageBody,
        session: Option<(&str, u64)>,
    ) -> MeshResult<SignedMessage> {
        let mut msg = SignedMessage::new(self.peer_id.clone(), recipient_id, body)?;
        if let Some((session_id, sequence)) = session {
            msg = msg.with_session(session_id, sequence);
        }
        self.sign_message(&mut msg)?;
        Ok(msg)
    }

    /// Verify signature and freshness of an inbound envelope.
    pub fn verify_message(&self, msg: &SignedMessage) -> MeshResult<Authenticity> {
        self.verify_message_at(msg, Utc::now())
    }

    /// Verify an inbound envelope as of `now`.
    pub fn verify_message_at(
        &self,
        msg: &SignedMessage,
        now: DateTime<Utc>,
    ) -> MeshResult<Authenticity> {
        let nonce_ok = hex::decode(&msg.nonce)
            .map(|n| n.len() >= NONCE_LEN)
            .unwrap_or(false);
        if !nonce_ok || msg.sender_id.is_empty() {
            warn!(sender = %msg.sender_id, "Rejected message with malformed nonce or sender");
            return Err(MeshError::InvalidSignature);
        }

        let authenticity = match &msg.signature {
            None if self.allow_unsigned_legacy => {
                debug!(sender = %msg.sender_id, msg_type = %msg.msg_type, "Accepting unsigned legacy message");
                Authenticity::UnsignedLegacy
            }
            None => {
                warn!(sender = %msg.sender_id, msg_type = %msg.msg_type, "Rejected unsigned message");
                return Err(MeshError::InvalidSignature);
            }
            Some(signature) => {
                self.check_signature(msg, signature)?;
                Authenticity::Verified
            }
        };

        self.replay
            .check_replay_at(&msg.sender_id, &msg.nonce, msg.timestamp, now)?;
        Ok(authenticity)
    }

    fn check_signature(&self, msg: &SignedMessage, signature: &str) -> MeshResult<()> {
        let sig_bytes = BASE64
            .decode(signature)
            .map_err(|_| MeshError::InvalidSignature)?;
        let sig_bytes: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        let data = msg.signing_bytes()?;

        if let Some(key) = self.keyring.get(&msg.sender_id) {
            return key.verify(&data, &signature).map_err(|_| {
                warn!(sender = %msg.sender_id, msg_type = %msg.msg_type, "Signature mismatch");
                MeshError::InvalidSignature
            });
        }

        // Unknown signer: accept only a key carried in the message that
        // hashes to the claimed sender id.
        let presented = presented_key(msg).ok_or_else(|| {
            warn!(sender = %msg.sender_id, msg_type = %msg.msg_type, "Unknown signer");
            MeshError::InvalidSignature
        })?;
        let key = decode_public_key(&presented)?;
        key.verify(&data, &signature).map_err(|_| {
            warn!(sender = %msg.sender_id, "Signature mismatch with presented key");
            MeshError::InvalidSignature
        })?;
        self.keyring.learn_for(&msg.sender_id, key)?;
        debug!(sender = %msg.sender_id, "Learned peer key");
        Ok(())
    }
}

/// The identity key a message carries about its own sender, if any.
fn presented_key(msg: &SignedMessage) -> Option<String> {
    let body = msg.body().ok()?;
    match body {
        MessageBody::Handshake(offer) => Some(offer.identity_public_key),
        MessageBody::HandshakeAck(ack) => Some(ack.identity_public_key),
        MessageBody::Ping(ping) => ping
            .origin
            .filter(|c| c.peer_id == msg.sender_id)
            .map(|c| c.public_key),
        MessageBody::Pong(pong) if pong.contact.peer_id == msg.sender_id => {
            Some(pong.contact.public_key)
        }
        MessageBody::DhtStore(req) if req.origin.peer_id == msg.sender_id => {
            Some(req.origin.public_key)
        }
        MessageBody::DhtFindNode(req) | MessageBody::DhtFindValue(req)
            if req.origin.peer_id == msg.sender_id =>
        {
            Some(req.origin.public_key)
        }
        _ => None,
    }
}
