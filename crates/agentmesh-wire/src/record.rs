//! Signed peer records and DHT keys.
//!
//! A [`PeerRecord`] is created and signed by the peer it describes. Other
//! nodes replicate it read-only and must call [`PeerRecord::verify`] before
//! acting on it: the record is checked against its own embedded public key,
//! and the key must hash to the record's `peer_id`.

use crate::identity::{decode_public_key, peer_id_for, Keypair};
use agentmesh_types::{MeshError, MeshResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// How to reach a peer. Carried in DHT replies and liveness probes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub peer_id: String,
    /// `host:port`.
    pub endpoint: String,
    /// Base64 Ed25519 public key. Hashes to `peer_id`.
    pub public_key: String,
}

impl Contact {
    /// DHT position of this contact.
    pub fn key(&self) -> MeshResult<DhtKey> {
        DhtKey::from_hex(&self.peer_id)
    }

    /// Whether the carried key actually belongs to `peer_id`.
    pub fn is_self_consistent(&self) -> bool {
        decode_public_key(&self.public_key)
            .map(|k| peer_id_for(k.as_bytes()) == self.peer_id)
            .unwrap_or(false)
    }
}

/// A signed, expiring description of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// `hex(sha256(public_key))`.
    pub peer_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub endpoint: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Base64 signature over every other field.
    #[serde(default)]
    pub signature: String,
}

#[derive(Serialize)]
struct RecordSigningView<'a> {
    peer_id: &'a str,
    entity_id: &'a str,
    entity_name: &'a str,
    endpoint: &'a str,
    public_key: &'a str,
    capabilities: &'a [String],
    timestamp: String,
    ttl_secs: u64,
}

impl PeerRecord {
    /// Build and sign a record describing the holder of `keypair`.
    pub fn signed(
        keypair: &Keypair,
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
        ttl_secs: u64,
    ) -> MeshResult<Self> {
        Self::signed_at(
            keypair,
            entity_id,
            entity_name,
            endpoint,
            capabilities,
            ttl_secs,
            Utc::now(),
        )
    }

    /// Like [`PeerRecord::signed`], with an explicit issue time.
    pub fn signed_at(
        keypair: &Keypair,
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
        ttl_secs: u64,
        timestamp: DateTime<Utc>,
    ) -> MeshResult<Self> {
        let mut record = Self {
            peer_id: keypair.peer_id(),
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            endpoint: endpoint.into(),
            public_key: keypair.public_key_b64(),
            capabilities,
            timestamp,
            ttl_secs,
            signature: String::new(),
        };
        let bytes = record.signing_bytes()?;
        record.signature = BASE64.encode(keypair.sign(&bytes));
        Ok(record)
    }

    fn signing_bytes(&self) -> MeshResult<Vec<u8>> {
        let view = RecordSigningView {
            peer_id: &self.peer_id,
            entity_id: &self.entity_id,
            entity_name: &self.entity_name,
            endpoint: &self.endpoint,
            public_key: &self.public_key,
            capabilities: &self.capabilities,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ttl_secs: self.ttl_secs,
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Check the record against its own embedded key.
    ///
    /// Fails with `InvalidSignature` if the key does not hash to `peer_id` or
    /// the signature does not cover the current contents.
    pub fn verify(&self) -> MeshResult<()> {
        let key = decode_public_key(&self.public_key)?;
        if peer_id_for(key.as_bytes()) != self.peer_id {
            return Err(MeshError::InvalidSignature);
        }
        let sig_bytes = BASE64
            .decode(&self.signature)
            .map_err(|_| MeshError::InvalidSignature)?;
        let sig_bytes: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::InvalidSignature)?;
        key.verify(&self.signing_bytes()?, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| MeshError::InvalidSignature)
    }

    /// When the record stops being valid.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.timestamp + Duration::seconds(self.ttl_secs.min(i64::MAX as u64) as i64)
    }

    /// `now > timestamp + ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn contact(&self) -> Contact {
        Contact {
            peer_id: self.peer_id.clone(),
            endpoint: self.endpoint.clone(),
            public_key: self.public_key.clone(),
        }
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            entity_id: self.entity_id.clone(),
            entity_name: self.entity_name.clone(),
            endpoint: self.endpoint.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// What `discover()` hands to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
}

/// A 256-bit position in the DHT keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtKey(pub [u8; 32]);

impl DhtKey {
    /// Identity key: `sha256(public_key)`.
    pub fn for_public_key(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    /// Capability-scoped key:
    /// `sha256(entity_id ":" hex(sha256(capability))[0..16])`.
    pub fn for_capability(entity_id: &str, capability: &str) -> Self {
        let cap_hash = hex::encode(Sha256::digest(capability.as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(entity_id.as_bytes());
        hasher.update(b":");
        hasher.update(&cap_hash.as_bytes()[..16]);
        Self(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> MeshResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MeshError::Serialization(format!("invalid DHT key: {e}")))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::Serialization("DHT key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &DhtKey) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the k-bucket `other` falls in, or `None` for the key itself.
    ///
    /// Bucket `i` holds keys whose distance has its highest set bit at `i`.
    pub fn bucket_index(&self, other: &DhtKey) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_idx, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((31 - byte_idx) * 8 + bit);
            }
        }
        None
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
