//! Peer directory: one discovery abstraction over pluggable sources.
//!
//! Records come from the [`PeerRegistry`] (first-hand, from handshakes) and
//! from a [`DhtBackend`], consulted in the configured order. Whatever the
//! source, a record is verified against its own embedded key, and dropped if
//! expired, before it is returned.

use crate::auth::Authenticator;
use crate::dht::DhtBackend;
use crate::identity::decode_public_key;
use crate::record::{DhtKey, PeerRecord, PeerSummary};
use crate::registry::PeerRegistry;
use agentmesh_types::config::{BootstrapNode, DhtConfig, DiscoverySource, NodeConfig};
use agentmesh_types::MeshResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Upper bound on records pulled for a capability search.
const CAPABILITY_SCAN_LIMIT: usize = 1024;

pub struct PeerDirectory {
    auth: Arc<Authenticator>,
    registry: PeerRegistry,
    backend: Arc<dyn DhtBackend>,
    sources: Vec<DiscoverySource>,
    bootstrap: Vec<BootstrapNode>,
    entity_id: String,
    entity_name: String,
    capabilities: Vec<String>,
    record_ttl_secs: u64,
    endpoint: RwLock<String>,
    local_record: RwLock<Option<PeerRecord>>,
    joined: AtomicBool,
}

impl PeerDirectory {
    pub fn new(
        auth: Arc<Authenticator>,
        backend: Arc<dyn DhtBackend>,
        node: &NodeConfig,
        dht: &DhtConfig,
    ) -> Self {
        let mut bootstrap = dht.bootstrap.clone();
        bootstrap.sort_by_key(|b| b.priority);
        Self {
            auth,
            registry: PeerRegistry::new(),
            backend,
            sources: dht.sources.clone(),
            bootstrap,
            entity_id: node.entity_id.clone(),
            entity_name: node.entity_name.clone(),
            capabilities: node.capabilities.clone(),
            record_ttl_secs: dht.record_ttl_secs,
            endpoint: RwLock::new(
                node.advertised_endpoint
                    .clone()
                    .unwrap_or_else(|| node.listen_addr.clone()),
            ),
            local_record: RwLock::new(None),
            joined: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn DhtBackend> {
        &self.backend
    }

    /// Set the endpoint advertised in the local record.
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        *self.endpoint.write().unwrap_or_else(|e| e.into_inner()) = endpoint.into();
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The most recently published local record, if any.
    pub fn local_record(&self) -> Option<PeerRecord> {
        self.local_record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// A freshly signed record describing this node.
    pub fn sign_local_record(&self) -> MeshResult<PeerRecord> {
        PeerRecord::signed(
            self.auth.keypair(),
            self.entity_id.clone(),
            self.entity_name.clone(),
            self.endpoint(),
            self.capabilities.clone(),
            self.record_ttl_secs,
        )
    }

    /// Publish the local record under its identity key and every capability key.
    pub async fn register_self(&self) -> MeshResult<PeerRecord> {
        let record = self.sign_local_record()?;
        let identity = DhtKey::for_public_key(&self.auth.keypair().public_key_bytes());
        self.backend.put(identity, record.clone()).await?;
        for capability in &self.capabilities {
            let key = DhtKey::for_capability(&self.entity_id, capability);
            if let Err(e) = self.backend.put(key, record.clone()).await {
                warn!(capability = %capability, error = %e, "Failed to publish capability record");
            }
        }
        *self.local_record.write().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        debug!(peer = %record.peer_id, ttl = record.ttl_secs, "Registered self");
        Ok(record)
    }

    /// Contact bootstrap nodes in ascending priority. Returns how many answered.
    ///
    /// An unreachable bootstrap list is not an error: the node stays isolated
    /// and [`PeerDirectory::refresh`] tries again.
    pub async fn bootstrap(&self) -> usize {
        if self.bootstrap.is_empty() {
            return 0;
        }
        let endpoints: Vec<String> = self.bootstrap.iter().map(BootstrapNode::endpoint).collect();
        let reachable = self.backend.join(&endpoints).await;
        if reachable == 0 {
            warn!(nodes = endpoints.len(), "No bootstrap node reachable; running isolated");
        } else {
            info!(reachable, "Bootstrapped into directory");
            self.joined.store(true, Ordering::Release);
        }
        reachable
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Periodic refresh: retry bootstrap while isolated, then re-publish.
    pub async fn refresh(&self) -> MeshResult<PeerRecord> {
        if !self.is_joined() && self.backend.contact_count() == 0 {
            self.bootstrap().await;
        }
        self.register_self().await
    }

    /// Remember a record presented first-hand. It must verify.
    pub fn learn(&self, record: PeerRecord) -> MeshResult<()> {
        record.verify()?;
        if record.peer_id == self.auth.peer_id() || record.is_expired() {
            return Ok(());
        }
        let key = decode_public_key(&record.public_key)?;
        self.auth.keyring().learn_for(&record.peer_id, key)?;
        self.registry.upsert(record);
        Ok(())
    }

    fn trusted(&self, record: &PeerRecord, now: DateTime<Utc>) -> bool {
        if record.is_expired_at(now) {
            return false;
        }
        if let Err(e) = record.verify() {
            warn!(peer = %record.peer_id, error = %e, "Ignoring unverifiable record");
            return false;
        }
        if let Ok(key) = decode_public_key(&record.public_key) {
            if let Err(e) = self.auth.keyring().learn_for(&record.peer_id, key) {
                warn!(peer = %record.peer_id, error = %e, "Could not cache record key");
            }
        }
        true
    }

    /// The record of `peer_id`, or `None` if unknown, expired or unverifiable.
    pub async fn lookup(&self, peer_id: &str) -> Option<PeerRecord> {
        let now = Utc::now();
        for source in &self.sources {
            let found = match source {
                DiscoverySource::Registry => self.registry.live_record(peer_id, now),
                DiscoverySource::Dht => {
                    let Ok(key) = DhtKey::from_hex(peer_id) else {
                        return None;
                    };
                    match self.backend.get(&key).await {
                        Ok(record) => record,
                        Err(e) => {
                            debug!(peer = %peer_id, error = %e, "DHT lookup failed");
                            None
                        }
                    }
                }
            };
            if let Some(record) = found {
                if record.peer_id == peer_id && self.trusted(&record, now) {
                    return Some(record);
                }
            }
        }
        None
    }

    /// Up to `count` live peer records, excluding this node.
    pub async fn discover(&self, count: usize) -> Vec<PeerRecord> {
        let now = Utc::now();
        let local = self.auth.peer_id().to_string();
        let mut by_peer: HashMap<String, PeerRecord> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for source in &self.sources {
            if order.len() >= count {
                break;
            }
            let candidates = match source {
                DiscoverySource::Registry => self.registry.live_records(now),
                DiscoverySource::Dht => self.backend.sample(count.saturating_add(1)).await,
            };
            for record in candidates {
                if record.peer_id == local || !self.trusted(&record, now) {
                    continue;
                }
                match by_peer.get(&record.peer_id) {
                    Some(held) if held.timestamp >= record.timestamp => {}
                    Some(_) => {
                        by_peer.insert(record.peer_id.clone(), record);
                    }
                    None => {
                        order.push(record.peer_id.clone());
                        by_peer.insert(record.peer_id.clone(), record);
                    }
                }
            }
        }

        order
            .into_iter()
            .filter_map(|id| by_peer.remove(&id))
            .take(count)
            .collect()
    }

    /// Live records advertising `capability`.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<PeerRecord> {
        self.discover(CAPABILITY_SCAN_LIMIT)
            .await
            .into_iter()
            .filter(|r| r.has_capability(capability))
            .collect()
    }

    /// Summaries for collaborators, optionally filtered by capability.
    pub async fn discover_summaries(&self, capability: Option<&str>) -> Vec<PeerSummary> {
        let records = match capability {
            Some(cap) => self.find_by_capability(cap).await,
            None => self.discover(CAPABILITY_SCAN_LIMIT).await,
        };
        records.iter().map(PeerRecord::summary).collect()
    }

    /// Purge expired records from every source.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.registry.sweep_expired(now) + self.backend.sweep(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{MemoryDht, RecordStore};
    use crate::identity::Keypair;
    use agentmesh_types::config::SecurityConfig;
    use chrono::Duration;

    fn directory(store: Arc<RecordStore>, caps: Vec<String>) -> PeerDirectory {
        let auth = Arc::new(Authenticator::new(Keypair::generate(), &SecurityConfig::default()));
        let node = NodeConfig {
            entity_id: "self".into(),
            capabilities: caps,
            ..NodeConfig::default()
        };
        PeerDirectory::new(
            auth,
            Arc::new(MemoryDht::shared(store)),
            &node,
            &DhtConfig::default(),
        )
    }

    fn foreign(caps: Vec<String>, ttl: u64) -> PeerRecord {
        let kp = Keypair::generate();
        PeerRecord::signed(&kp, "other", "Other", "127.0.0.1:9", caps, ttl).unwrap()
    }

    #[tokio::test]
    async fn test_register_self_then_lookup_from_peer() {
        let store = Arc::new(RecordStore::new());
        let a = directory(store.clone(), vec!["pricing".into()]);
        let b = directory(store.clone(), vec![]);
        let record = a.register_self().await.unwrap();
        // identity key + one capability key
        assert_eq!(store.len(), 2);
        let found = b.lookup(&record.peer_id).await.unwrap();
        assert_eq!(found, record);
        assert!(b.auth.keyring().get(&record.peer_id).is_some());
    }

    #[tokio::test]
    async fn test_discover_excludes_self() {
        let store = Arc::new(RecordStore::new());
        let a = directory(store.clone(), vec![]);
        let b = directory(store.clone(), vec![]);
        a.register_self().await.unwrap();
        b.register_self().await.unwrap();
        let seen = a.discover(10).await;
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0].peer_id, a.auth.peer_id());
    }

    #[tokio::test]
    async fn test_expired_record_excluded_from_discover_and_lookup() {
        let store = Arc::new(RecordStore::new());
        let dir = directory(store.clone(), vec![]);
        let kp = Keypair::generate();
        let issued = Utc::now() - Duration::seconds(120);
        let record =
            PeerRecord::signed_at(&kp, "stale", "Stale", "127.0.0.1:9", vec![], 60, issued).unwrap();
        let key = DhtKey::from_hex(&record.peer_id).unwrap();
        store.store(key, record.clone(), issued).unwrap();

        // Still physically stored, but invisible.
        assert_eq!(store.len(), 1);
        assert!(dir.discover(10).await.is_empty());
        assert!(dir.lookup(&record.peer_id).await.is_none());
    }

    #[tokio::test]
    async fn test_unverifiable_registry_record_rejected() {
        let store = Arc::new(RecordStore::new());
        let dir = directory(store, vec![]);
        let mut record = foreign(vec![], 60);
        record.entity_name = "forged".into();
        assert!(dir.learn(record).is_err());
        assert_eq!(dir.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_find_by_capability() {
        let store = Arc::new(RecordStore::new());
        let dir = directory(store, vec![]);
        dir.learn(foreign(vec!["pricing".into()], 60)).unwrap();
        dir.learn(foreign(vec!["search".into()], 60)).unwrap();
        let found = dir.find_by_capability("pricing").await;
        assert_eq!(found.len(), 1);
        assert!(found[0].has_capability("pricing"));
        assert!(dir.find_by_capability("nothing").await.is_empty());
        assert_eq!(dir.discover_summaries(Some("search")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_non_fatal() {
        let store = Arc::new(RecordStore::new());
        let auth = Arc::new(Authenticator::new(Keypair::generate(), &SecurityConfig::default()));
        let dht = DhtConfig {
            bootstrap: vec![
                BootstrapNode {
                    host: "10.0.0.9".into(),
                    port: 1,
                    priority: 5,
                },
                BootstrapNode {
                    host: "127.0.0.1".into(),
                    port: 1,
                    priority: 0,
                },
            ],
            ..DhtConfig::default()
        };
        let dir = PeerDirectory::new(auth, Arc::new(MemoryDht::shared(store)), &NodeConfig::default(), &dht);
        assert_eq!(dir.bootstrap[0].priority, 0);
        assert_eq!(dir.bootstrap().await, 0);
        assert!(!dir.is_joined());
        assert!(dir.refresh().await.is_ok());
    }
}
