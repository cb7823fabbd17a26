//! Sliding-window replay protection.
//!
//! A `(sender_id, nonce)` pair is accepted at most once while it is inside the
//! window. Messages whose timestamp is older than the window, or further in the
//! future than the allowed clock skew, are rejected outright, so an entry can
//! safely be forgotten once it is older than the window.
//!
//! The hot path is a single concurrent map insert. Old entries are removed by
//! [`ReplayGuard::sweep`], which the maintenance loop calls periodically.

use agentmesh_types::{MeshError, MeshResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Replay guard over a concurrent nonce cache.
#[derive(Debug)]
pub struct ReplayGuard {
    /// `(sender_id, nonce)` -> message timestamp.
    seen: DashMap<(String, String), DateTime<Utc>>,
    window: Duration,
    clock_skew: Duration,
}

impl ReplayGuard {
    /// Create a guard with the given window and tolerated clock skew.
    pub fn new(window: std::time::Duration, clock_skew: std::time::Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window: Duration::from_std(window).unwrap_or(Duration::seconds(60)),
            clock_skew: Duration::from_std(clock_skew).unwrap_or(Duration::seconds(30)),
        }
    }

    /// Check a message against the window using the current time.
    pub fn check_replay(
        &self,
        sender_id: &str,
        nonce: &str,
        timestamp: DateTime<Utc>,
    ) -> MeshResult<()> {
        self.check_replay_at(sender_id, nonce, timestamp, Utc::now())
    }

    /// Check a message against the window as of `now`.
    ///
    /// On acceptance the pair is recorded.
    pub fn check_replay_at(
        &self,
        sender_id: &str,
        nonce: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> MeshResult<()> {
        if timestamp < now - self.window {
            warn!(sender = %sender_id, %timestamp, "Rejected stale message");
            return Err(MeshError::Replayed(format!(
                "timestamp {timestamp} is older than the {}s window",
                self.window.num_seconds()
            )));
        }
        if timestamp > now + self.clock_skew {
            warn!(sender = %sender_id, %timestamp, "Rejected message from the future");
            return Err(MeshError::Replayed(format!(
                "timestamp {timestamp} exceeds allowed clock skew"
            )));
        }

        match self.seen.entry((sender_id.to_string(), nonce.to_string())) {
            Entry::Occupied(mut existing) => {
                // Outlived the window but not swept yet.
                if *existing.get() < now - self.window {
                    existing.insert(timestamp);
                    return Ok(());
                }
                warn!(sender = %sender_id, nonce = %nonce, "Rejected replayed nonce");
                Err(MeshError::Replayed(format!(
                    "nonce {nonce} already seen from {sender_id}"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(timestamp);
                Ok(())
            }
        }
    }

    /// Drop entries that have left the window. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.seen.len();
        self.seen.retain(|_, ts| *ts >= cutoff);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!(removed, remaining = self.seen.len(), "Swept nonce cache");
        }
        removed
    }

    /// Number of remembered pairs.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ReplayGuard {
        ReplayGuard::new(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(30),
        )
    }

    #[test]
    fn test_first_message_accepted() {
        let g = guard();
        let now = Utc::now();
        assert!(g.check_replay_at("alice", "n1", now, now).is_ok());
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected_within_window() {
        let g = guard();
        let now = Utc::now();
        g.check_replay_at("alice", "n1", now, now).unwrap();
        let err = g
            .check_replay_at("alice", "n1", now, now + Duration::seconds(5))
            .unwrap_err();
        assert!(matches!(err, MeshError::Replayed(_)));
    }

    #[test]
    fn test_same_nonce_other_sender_allowed() {
        let g = guard();
        let now = Utc::now();
        g.check_replay_at("alice", "n1", now, now).unwrap();
        assert!(g.check_replay_at("bob", "n1", now, now).is_ok());
    }

    #[test]
    fn test_resubmission_after_window_is_stale() {
        let g = guard();
        let sent = Utc::now();
        g.check_replay_at("alice", "n1", sent, sent).unwrap();
        let later = sent + Duration::seconds(61);
        assert!(g.check_replay_at("alice", "n1", sent, later).is_err());
    }

    #[test]
    fn test_fresh_nonce_after_window_accepted() {
        let g = guard();
        let sent = Utc::now();
        g.check_replay_at("alice", "n1", sent, sent).unwrap();
        let later = sent + Duration::seconds(61);
        assert!(g.check_replay_at("alice", "n2", later, later).is_ok());
    }

    #[test]
    fn test_future_timestamp_beyond_skew_rejected() {
        let g = guard();
        let now = Utc::now();
        assert!(g
            .check_replay_at("alice", "n1", now + Duration::seconds(31), now)
            .is_err());
        assert!(g
            .check_replay_at("alice", "n2", now + Duration::seconds(29), now)
            .is_ok());
    }

    #[test]
    fn test_sweep_evicts_old_entries() {
        let g = guard();
        let now = Utc::now();
        g.check_replay_at("alice", "old", now - Duration::seconds(50), now)
            .unwrap();
        g.check_replay_at("alice", "new", now, now).unwrap();
        let removed = g.sweep(now + Duration::seconds(20));
        assert_eq!(removed, 1);
        assert_eq!(g.len(), 1);
    }
}
