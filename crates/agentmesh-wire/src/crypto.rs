//! End-to-end session cryptography.
//!
//! Both sides of a handshake contribute an ephemeral X25519 key. The shared
//! secret is stretched with HKDF-SHA256, salted with both ephemeral public keys
//! in initiator/responder order, into a 256-bit AES-GCM key. Each sealed
//! message uses a fresh random 96-bit nonce and binds the session id and
//! sequence number as associated data, so ciphertext cannot be replayed into
//! another session or position.

use crate::message::SealedPayload;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use agentmesh_types::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const SESSION_KEY_INFO: &[u8] = b"agentmesh/session-key/v1";
const GCM_NONCE_LEN: usize = 12;

/// One side's ephemeral Diffie-Hellman key for a single handshake.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn public_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// X25519 with the peer's base64 public key.
    ///
    /// Low-order peer keys that force an all-zero secret are rejected.
    pub fn diffie_hellman(&self, remote_b64: &str) -> MeshResult<[u8; 32]> {
        let remote = decode_x25519(remote_b64)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        if !shared.was_contributory() {
            return Err(MeshError::HandshakeFailed(
                "non-contributory ephemeral key".into(),
            ));
        }
        Ok(shared.to_bytes())
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public_b64())
            .finish_non_exhaustive()
    }
}

/// Decode a base64 X25519 public key.
pub fn decode_x25519(encoded: &str) -> MeshResult<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| MeshError::HandshakeFailed("ephemeral key is not base64".into()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| MeshError::HandshakeFailed("ephemeral key must be 32 bytes".into()))
}

/// Symmetric AES-256-GCM key shared by the two ends of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Derive the session key from an X25519 shared secret.
    pub fn derive(
        shared_secret: &[u8; 32],
        initiator_public: &[u8; 32],
        responder_public: &[u8; 32],
        session_id: &str,
    ) -> MeshResult<Self> {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(initiator_public);
        salt[32..].copy_from_slice(responder_public);
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

        let mut info = Vec::with_capacity(SESSION_KEY_INFO.len() + session_id.len());
        info.extend_from_slice(SESSION_KEY_INFO);
        info.extend_from_slice(session_id.as_bytes());

        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| MeshError::Internal("HKDF output length rejected".into()))?;
        Ok(Self(okm))
    }

    /// Encrypt `plaintext`, binding `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> MeshResult<SealedPayload> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| MeshError::Internal("invalid AES key length".into()))?;
        let mut nonce = [0u8; GCM_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| MeshError::Internal("AES-GCM encryption failed".into()))?;
        Ok(SealedPayload {
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Decrypt and authenticate a sealed payload.
    ///
    /// Any malformed field or tag mismatch is `DecryptionFailed`.
    pub fn open(&self, sealed: &SealedPayload, aad: &[u8]) -> MeshResult<Vec<u8>> {
        let nonce = BASE64
            .decode(&sealed.nonce)
            .map_err(|_| MeshError::DecryptionFailed)?;
        if nonce.len() != GCM_NONCE_LEN {
            return Err(MeshError::DecryptionFailed);
        }
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|_| MeshError::DecryptionFailed)?;
        let cipher =
            Aes256Gcm::new_from_slice(&self.0).map_err(|_| MeshError::DecryptionFailed)?;
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| MeshError::DecryptionFailed)
    }

    /// Key-confirmation tag over a handshake challenge.
    pub fn authenticator(&self, challenge: &str) -> MeshResult<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|_| MeshError::Internal("invalid HMAC key".into()))?;
        mac.update(challenge.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a peer's key-confirmation tag.
    pub fn verify_authenticator(&self, challenge: &str, tag: &str) -> bool {
        match self.authenticator(challenge) {
            Ok(expected) => expected.as_bytes().ct_eq(tag.as_bytes()).into(),
            Err(_) => false,
        }
    }

    /// Short non-secret identifier of the key, for logs and diagnostics.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(Sha256::digest(self.0))[..8])
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Associated data binding a sealed payload to its session position.
pub fn session_aad(session_id: &str, sequence_num: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session_id.len() + 9);
    aad.extend_from_slice(session_id.as_bytes());
    aad.push(b':');
    aad.extend_from_slice(&sequence_num.to_be_bytes());
    aad
}

/// Random hex handshake challenge.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
