//! DHT storage abstraction.
//!
//! [`DhtBackend`] is what the peer directory talks to. The production backend
//! is [`crate::kademlia::KademliaDht`]; [`MemoryDht`] keeps records in process
//! and is used for isolated nodes and tests.
//!
//! Every backend stores records through a [`RecordStore`], which only accepts
//! records that verify against their own key, have not expired, and are filed
//! under a key the record is entitled to. The DHT itself is not a trust root:
//! callers still verify whatever a backend hands back.

use crate::message::DhtResultPayload;
use crate::record::{Contact, DhtKey, PeerRecord};
use agentmesh_types::{MeshError, MeshResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage backend behind the peer directory.
#[async_trait]
pub trait DhtBackend: Send + Sync {
    /// Publish a record under `key`.
    async fn put(&self, key: DhtKey, record: PeerRecord) -> MeshResult<()>;

    /// Fetch the record stored under `key`. Expired records are absent.
    async fn get(&self, key: &DhtKey) -> MeshResult<Option<PeerRecord>>;

    /// Up to `count` records known to the backend, expired ones excluded.
    async fn sample(&self, count: usize) -> Vec<PeerRecord>;

    /// Join the network through the given endpoints, in order. Returns how
    /// many answered.
    async fn join(&self, endpoints: &[String]) -> usize;

    /// Serve a remote store request.
    fn serve_store(&self, origin: &Contact, key: DhtKey, record: PeerRecord) -> MeshResult<()>;

    /// Serve a remote find request.
    fn serve_find(&self, origin: &Contact, key: &DhtKey, want_value: bool) -> DhtResultPayload;

    /// Purge expired records. Returns how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;

    /// Note a live contact, e.g. the origin of a ping.
    fn observe(&self, _contact: &Contact) {}

    /// Number of other nodes this backend can reach.
    fn contact_count(&self) -> usize {
        0
    }
}

/// Verified, expiring record storage.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: DashMap<DhtKey, PeerRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `record` may be filed under `key`: its identity key, or one of
    /// its capability keys.
    pub fn key_matches(key: &DhtKey, record: &PeerRecord) -> bool {
        if key.to_hex() == record.peer_id {
            return true;
        }
        record
            .capabilities
            .iter()
            .any(|c| DhtKey::for_capability(&record.entity_id, c) == *key)
    }

    /// Store a record. Returns `Ok(false)` if a newer copy is already held,
    /// or if the slot belongs to another peer whose record is still live.
    pub fn store(&self, key: DhtKey, record: PeerRecord, now: DateTime<Utc>) -> MeshResult<bool> {
        record.verify()?;
        if record.is_expired_at(now) {
            return Err(MeshError::RecordExpired(record.peer_id));
        }
        if !Self::key_matches(&key, &record) {
            warn!(key = %key, peer = %record.peer_id, "Record filed under foreign key");
            return Err(MeshError::InvalidSignature);
        }
        if let Some(existing) = self.records.get(&key) {
            if existing.peer_id == record.peer_id {
                if existing.timestamp >= record.timestamp {
                    return Ok(false);
                }
            } else if !existing.is_expired_at(now) {
                warn!(
                    key = %key,
                    holder = %existing.peer_id,
                    peer = %record.peer_id,
                    "Refusing to replace live record of another peer"
                );
                return Ok(false);
            }
        }
        debug!(key = %key, peer = %record.peer_id, "Stored record");
        self.records.insert(key, record);
        Ok(true)
    }

    /// The unexpired record under `key`.
    pub fn get(&self, key: &DhtKey, now: DateTime<Utc>) -> Option<PeerRecord> {
        self.records
            .get(key)
            .filter(|r| !r.is_expired_at(now))
            .map(|r| r.clone())
    }

    /// Unexpired records, one per peer (the newest).
    pub fn live_records(&self, now: DateTime<Utc>) -> Vec<PeerRecord> {
        let mut newest: std::collections::HashMap<String, PeerRecord> = Default::default();
        for entry in self.records.iter() {
            let record = entry.value();
            if record.is_expired_at(now) {
                continue;
            }
            match newest.get(&record.peer_id) {
                Some(held) if held.timestamp >= record.timestamp => {}
                _ => {
                    newest.insert(record.peer_id.clone(), record.clone());
                }
            }
        }
        newest.into_values().collect()
    }

    /// Withdraw everything filed for `peer_id`.
    pub fn withdraw(&self, peer_id: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.peer_id != peer_id);
        before - self.records.len()
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired_at(now));
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, "Swept expired records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// In-process backend. Several nodes may share one store to simulate a
/// fully replicated table.
#[derive(Debug, Clone, Default)]
pub struct MemoryDht {
    store: Arc<RecordStore>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }
}

#[async_trait]
impl DhtBackend for MemoryDht {
    async fn put(&self, key: DhtKey, record: PeerRecord) -> MeshResult<()> {
        self.store.store(key, record, Utc::now()).map(|_| ())
    }

    async fn get(&self, key: &DhtKey) -> MeshResult<Option<PeerRecord>> {
        Ok(self.store.get(key, Utc::now()))
    }

    async fn sample(&self, count: usize) -> Vec<PeerRecord> {
        let mut records = self.store.live_records(Utc::now());
        records.truncate(count);
        records
    }

    async fn join(&self, _endpoints: &[String]) -> usize {
        0
    }

    fn serve_store(&self, _origin: &Contact, key: DhtKey, record: PeerRecord) -> MeshResult<()> {
        self.store.store(key, record, Utc::now()).map(|_| ())
    }

    fn serve_find(&self, _origin: &Contact, key: &DhtKey, want_value: bool) -> DhtResultPayload {
        DhtResultPayload {
            record: if want_value {
                self.store.get(key, Utc::now())
            } else {
                None
            },
            contacts: Vec::new(),
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.store.sweep(now)
    }
}
