//! Local Ed25519 identity and the cache of known peer keys.
//!
//! A peer is identified by `peer_id = hex(sha256(public_key))`. Because the id
//! is derived from the key, a key presented alongside a `sender_id` can be
//! checked without any prior trust: it is accepted only if it hashes to that id.

use agentmesh_types::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};
use zeroize::Zeroize;

/// Long-lived signing key pair owned by the local node.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh key pair from OS entropy.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load the hex seed stored at `path`, or generate and persist a new one.
    pub fn load_or_generate(path: &Path) -> MeshResult<Self> {
        if path.exists() {
            let mut contents = std::fs::read_to_string(path)?;
            let decoded = hex::decode(contents.trim());
            contents.zeroize();
            let mut bytes = decoded
                .map_err(|e| MeshError::Config(format!("invalid key file {}: {e}", path.display())))?;
            let seed: Result<[u8; 32], _> = bytes.as_slice().try_into();
            bytes.zeroize();
            let mut seed = seed.map_err(|_| {
                MeshError::Config(format!(
                    "invalid key file {}: expected 32-byte seed",
                    path.display()
                ))
            })?;
            let keypair = Self::from_seed(&seed);
            seed.zeroize();
            debug!(path = %path.display(), peer = %keypair.peer_id(), "Loaded identity key");
            return Ok(keypair);
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut encoded = hex::encode(keypair.signing_key.to_bytes());
        write_private(path, encoded.as_bytes())?;
        encoded.zeroize();
        info!(path = %path.display(), peer = %keypair.peer_id(), "Generated new identity key");
        Ok(keypair)
    }

    /// The Ed25519 verifying key.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key().to_bytes()
    }

    /// Base64 public key, as carried in handshakes and directory records.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// `hex(sha256(public_key))`.
    pub fn peer_id(&self) -> String {
        peer_id_for(&self.public_key_bytes())
    }

    /// Sign arbitrary bytes.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Derive the peer id of a raw public key.
pub fn peer_id_for(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Decode a base64 Ed25519 public key.
pub fn decode_public_key(encoded: &str) -> MeshResult<VerifyingKey> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| MeshError::InvalidSignature)?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| MeshError::InvalidSignature)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| MeshError::InvalidSignature)
}

/// Verify `signature` over `data` under `public_key`.
///
/// Fails closed: a malformed key or signature is reported as `false`.
pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    key.verify(data, &Signature::from_bytes(&sig_bytes)).is_ok()
}

/// Concurrent cache of verified peer keys, keyed by `peer_id`.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: DashMap<String, VerifyingKey>,
}

impl KeyRing {
    /// Create an empty key ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a key, returning the peer id it was stored under.
    pub fn learn(&self, key: VerifyingKey) -> String {
        let peer_id = peer_id_for(key.as_bytes());
        self.keys.insert(peer_id.clone(), key);
        peer_id
    }

    /// Remember a key presented for `peer_id`, but only if it hashes to it.
    pub fn learn_for(&self, peer_id: &str, key: VerifyingKey) -> MeshResult<()> {
        if peer_id_for(key.as_bytes()) != peer_id {
            return Err(MeshError::InvalidSignature);
        }
        self.keys.insert(peer_id.to_string(), key);
        Ok(())
    }

    /// Look up the key of a peer.
    pub fn get(&self, peer_id: &str) -> Option<VerifyingKey> {
        self.keys.get(peer_id).map(|k| *k)
    }

    /// Forget a peer.
    pub fn forget(&self, peer_id: &str) {
        self.keys.remove(peer_id);
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are known.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
