//! Kademlia routing and iterative lookup.
//!
//! Contacts live in 256 k-buckets indexed by the position of the highest bit
//! of their XOR distance from the local key. Inside a bucket contacts are kept
//! least recently seen first; a full bucket keeps its old contacts and drops
//! the newcomer, and contacts are only removed when an RPC to them fails.
//!
//! Lookups query the `alpha` closest unqueried contacts in parallel until no
//! unqueried contact remains among the `k` closest. The whole lookup runs
//! under a deadline; on expiry it reports "not found" and leaves nothing
//! behind but routing-table updates.

use crate::dht::{DhtBackend, RecordStore};
use crate::message::DhtResultPayload;
use crate::record::{Contact, DhtKey, PeerRecord};
use agentmesh_types::config::DhtConfig;
use agentmesh_types::MeshResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const BUCKETS: usize = 256;

/// Network calls a Kademlia node makes to other nodes.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// Probe an endpoint and learn who answers there.
    async fn ping(&self, endpoint: &str) -> MeshResult<Contact>;

    async fn find_node(&self, to: &Contact, key: &DhtKey) -> MeshResult<Vec<Contact>>;

    async fn find_value(&self, to: &Contact, key: &DhtKey) -> MeshResult<DhtResultPayload>;

    async fn store(&self, to: &Contact, key: &DhtKey, record: &PeerRecord) -> MeshResult<()>;
}

/// Outcome of offering a contact to the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Inserted,
    Refreshed,
    /// Bucket full; the newcomer was not added.
    BucketFull,
    /// The local node or an inconsistent contact.
    Ignored,
}

/// k-bucket routing table.
#[derive(Debug)]
pub struct RoutingTable {
    local: DhtKey,
    k: usize,
    buckets: RwLock<Vec<VecDeque<Contact>>>,
}

impl RoutingTable {
    pub fn new(local: DhtKey, k: usize) -> Self {
        Self {
            local,
            k: k.max(1),
            buckets: RwLock::new(vec![VecDeque::new(); BUCKETS]),
        }
    }

    pub fn local_key(&self) -> DhtKey {
        self.local
    }

    /// Record that `contact` was seen.
    pub fn observe(&self, contact: Contact) -> Observed {
        let Ok(key) = contact.key() else {
            return Observed::Ignored;
        };
        let Some(index) = self.local.bucket_index(&key) else {
            return Observed::Ignored;
        };
        if !contact.is_self_consistent() {
            return Observed::Ignored;
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let bucket = &mut buckets[index];
        if let Some(pos) = bucket.iter().position(|c| c.peer_id == contact.peer_id) {
            bucket.remove(pos);
            bucket.push_back(contact);
            return Observed::Refreshed;
        }
        if bucket.len() < self.k {
            bucket.push_back(contact);
            Observed::Inserted
        } else {
            Observed::BucketFull
        }
    }

    /// Forget a contact after a failed RPC.
    pub fn remove(&self, peer_id: &str) -> bool {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        for bucket in buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|c| c.peer_id == peer_id) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    /// The `n` contacts closest to `target`.
    pub fn closest(&self, target: &DhtKey, n: usize) -> Vec<Contact> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<([u8; 32], Contact)> = buckets
            .iter()
            .flatten()
            .filter_map(|c| c.key().ok().map(|k| (k.distance(target), c.clone())))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().take(n).map(|(_, c)| c).collect()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of an iterative lookup.
#[derive(Debug, Default)]
struct LookupOutcome {
    record: Option<PeerRecord>,
    closest: Vec<Contact>,
}

/// Kademlia DHT backend over a [`DhtRpc`] transport.
pub struct KademliaDht {
    local: Contact,
    routing: RoutingTable,
    store: Arc<RecordStore>,
    rpc: Arc<dyn DhtRpc>,
    k: usize,
    alpha: usize,
    lookup_timeout: Duration,
}

impl KademliaDht {
    pub fn new(local: Contact, rpc: Arc<dyn DhtRpc>, config: &DhtConfig) -> MeshResult<Self> {
        let local_key = local.key()?;
        Ok(Self {
            local,
            routing: RoutingTable::new(local_key, config.bucket_size),
            store: Arc::new(RecordStore::new()),
            rpc,
            k: config.bucket_size.max(1),
            alpha: config.alpha.max(1),
            lookup_timeout: Duration::from_secs(config.lookup_timeout_secs),
        })
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn records(&self) -> &RecordStore {
        &self.store
    }

    /// Iterative lookup without a deadline. Callers wrap it.
    async fn lookup(&self, target: &DhtKey, want_value: bool) -> LookupOutcome {
        let mut shortlist = self.routing.closest(target, self.k);
        let mut seen: HashSet<String> = shortlist.iter().map(|c| c.peer_id.clone()).collect();
        let mut queried: HashSet<String> = HashSet::new();
        seen.insert(self.local.peer_id.clone());

        loop {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.peer_id))
                .take(self.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.peer_id.clone());
            }

            let replies = futures::future::join_all(candidates.iter().map(|c| async move {
                let reply = if want_value {
                    self.rpc.find_value(c, target).await
                } else {
                    self.rpc.find_node(c, target).await.map(|contacts| DhtResultPayload {
                        record: None,
                        contacts,
                    })
                };
                (c, reply)
            }))
            .await;

            for (contact, reply) in replies {
                match reply {
                    Ok(result) => {
                        self.routing.observe(contact.clone());
                        if let Some(record) = result.record {
                            if self.acceptable(target, &record) {
                                return LookupOutcome {
                                    record: Some(record),
                                    closest: shortlist,
                                };
                            }
                            warn!(from = %contact.peer_id, key = %target, "Discarding unverifiable record");
                        }
                        for learned in result.contacts {
                            if seen.insert(learned.peer_id.clone()) && learned.is_self_consistent() {
                                shortlist.push(learned);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(peer = %contact.peer_id, error = %e, "DHT query failed");
                        self.routing.remove(&contact.peer_id);
                    }
                }
            }

            shortlist.retain(|c| c.key().is_ok());
            shortlist.sort_by_key(|c| c.key().map(|k| k.distance(target)).unwrap_or([0xff; 32]));
            shortlist.truncate(self.k);
        }

        LookupOutcome {
            record: None,
            closest: shortlist,
        }
    }

    fn acceptable(&self, key: &DhtKey, record: &PeerRecord) -> bool {
        record.verify().is_ok()
            && !record.is_expired()
            && RecordStore::key_matches(key, record)
    }

    async fn lookup_with_deadline(&self, target: &DhtKey, want_value: bool) -> LookupOutcome {
        match tokio::time::timeout(self.lookup_timeout, self.lookup(target, want_value)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(key = %target, "DHT lookup timed out");
                LookupOutcome::default()
            }
        }
    }
}

#[async_trait]
impl DhtBackend for KademliaDht {
    async fn put(&self, key: DhtKey, record: PeerRecord) -> MeshResult<()> {
        self.store.store(key, record.clone(), Utc::now())?;
        let targets = self.lookup_with_deadline(&key, false).await.closest;
        let stored = futures::future::join_all(
            targets.iter().map(|c| self.rpc.store(c, &key, &record)),
        )
        .await;
        let replicas = stored.iter().filter(|r| r.is_ok()).count();
        debug!(key = %key, replicas, "Published record");
        Ok(())
    }

    async fn get(&self, key: &DhtKey) -> MeshResult<Option<PeerRecord>> {
        if let Some(record) = self.store.get(key, Utc::now()) {
            return Ok(Some(record));
        }
        Ok(self.lookup_with_deadline(key, true).await.record)
    }

    async fn sample(&self, count: usize) -> Vec<PeerRecord> {
        let now = Utc::now();
        let mut records = self.store.live_records(now);
        if records.len() >= count {
            records.truncate(count);
            return records;
        }

        let have: HashSet<String> = records.iter().map(|r| r.peer_id.clone()).collect();
        let missing: Vec<DhtKey> = self
            .routing
            .contacts()
            .into_iter()
            .filter(|c| !have.contains(&c.peer_id))
            .filter_map(|c| c.key().ok())
            .take(count - records.len())
            .collect();
        let fetched = tokio::time::timeout(
            self.lookup_timeout,
            futures::future::join_all(missing.iter().map(|key| self.lookup(key, true))),
        )
        .await
        .unwrap_or_default();
        for outcome in fetched {
            if let Some(record) = outcome.record {
                records.push(record);
            }
        }
        records.truncate(count);
        records
    }

    async fn join(&self, endpoints: &[String]) -> usize {
        let mut reachable = 0;
        for endpoint in endpoints {
            match self.rpc.ping(endpoint).await {
                Ok(contact) if contact.peer_id != self.local.peer_id => {
                    self.routing.observe(contact);
                    reachable += 1;
                }
                Ok(_) => {}
                Err(e) => debug!(endpoint = %endpoint, error = %e, "Bootstrap node unreachable"),
            }
        }
        if reachable > 0 {
            let own = self.routing.local_key();
            self.lookup_with_deadline(&own, false).await;
            info!(reachable, contacts = self.routing.len(), "Joined DHT");
        }
        reachable
    }

    fn serve_store(&self, origin: &Contact, key: DhtKey, record: PeerRecord) -> MeshResult<()> {
        self.routing.observe(origin.clone());
        self.store.store(key, record, Utc::now()).map(|_| ())
    }

    fn serve_find(&self, origin: &Contact, key: &DhtKey, want_value: bool) -> DhtResultPayload {
        self.routing.observe(origin.clone());
        let record = if want_value {
            self.store.get(key, Utc::now())
        } else {
            None
        };
        let contacts = self
            .routing
            .closest(key, self.k)
            .into_iter()
            .filter(|c| c.peer_id != origin.peer_id)
            .collect();
        DhtResultPayload { record, contacts }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.store.sweep(now)
    }

    fn observe(&self, contact: &Contact) {
        if contact.peer_id != self.local.peer_id {
            self.routing.observe(contact.clone());
        }
    }

    fn contact_count(&self) -> usize {
        self.routing.len()
    }
}
