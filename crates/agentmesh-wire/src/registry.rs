//! Peer registry: directory records learned first-hand.
//!
//! The [`PeerRegistry`] holds the signed records peers presented during an
//! authenticated handshake, plus records the directory has already verified.
//! It is one of the discovery sources behind the peer directory, next to the
//! DHT. Only verified records are ever inserted.

use crate::record::PeerRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Reachability of a peer as last observed by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Last exchange succeeded.
    Reachable,
    /// Last exchange failed. Kept until the record expires.
    Unreachable,
}

/// An entry representing a single known peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub record: PeerRecord,
    pub state: PeerState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe registry of verified peer records.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a verified record. An older record never replaces a
    /// newer one. Returns whether the stored record changed.
    pub fn upsert(&self, record: PeerRecord) -> bool {
        let now = Utc::now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(&record.peer_id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.state = PeerState::Reachable;
                if record.timestamp > entry.record.timestamp {
                    entry.record = record;
                    true
                } else {
                    false
                }
            }
            None => {
                peers.insert(
                    record.peer_id.clone(),
                    PeerEntry {
                        record,
                        state: PeerState::Reachable,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer_id)
    }

    pub fn mark_unreachable(&self, peer_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.state = PeerState::Unreachable;
        }
    }

    pub fn mark_reachable(&self, peer_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.state = PeerState::Reachable;
            entry.last_seen = Utc::now();
        }
    }

    /// Snapshot of a peer, expired or not.
    pub fn get_peer(&self, peer_id: &str) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(peer_id).cloned()
    }

    /// The peer's record if it has not expired.
    pub fn live_record(&self, peer_id: &str, now: DateTime<Utc>) -> Option<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer_id)
            .filter(|e| !e.record.is_expired_at(now))
            .map(|e| e.record.clone())
    }

    /// All unexpired records, reachable peers first.
    pub fn live_records(&self, now: DateTime<Utc>) -> Vec<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<&PeerEntry> = peers
            .values()
            .filter(|e| !e.record.is_expired_at(now))
            .collect();
        entries.sort_by_key(|e| (e.state != PeerState::Reachable, std::cmp::Reverse(e.last_seen)));
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Drop entries whose record has expired.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let before = peers.len();
        peers.retain(|_, e| !e.record.is_expired_at(now));
        before - peers.len()
    }

    /// Number of peers tracked, expired or not.
    pub fn count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}
