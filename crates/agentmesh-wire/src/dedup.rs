//! Outbound duplicate suppression.
//!
//! The router remembers the logical message ids it has sent recently, per
//! recipient, so the same logical message is not put on the wire twice within
//! a short window. This sits above the wire-level replay guard: a re-send here
//! would carry a fresh nonce and pass the receiver's replay check.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Sliding-window set of recently sent `(recipient, message_id)` pairs.
#[derive(Debug)]
pub struct RecentIds {
    sent: DashMap<(String, String), DateTime<Utc>>,
    window: Duration,
}

impl RecentIds {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            sent: DashMap::new(),
            window: Duration::from_std(window).unwrap_or(Duration::seconds(30)),
        }
    }

    /// Record a send. Returns `true` if the pair was already sent within the window.
    pub fn check_and_record(&self, recipient: &str, message_id: &str) -> bool {
        self.check_and_record_at(recipient, message_id, Utc::now())
    }

    pub fn check_and_record_at(&self, recipient: &str, message_id: &str, now: DateTime<Utc>) -> bool {
        match self.sent.entry((recipient.to_string(), message_id.to_string())) {
            Entry::Occupied(mut existing) => {
                if now - *existing.get() > self.window {
                    existing.insert(now);
                    false
                } else {
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    /// Forget a pair, so a failed send can be retried by the caller.
    pub fn forget(&self, recipient: &str, message_id: &str) {
        self.sent
            .remove(&(recipient.to_string(), message_id.to_string()));
    }

    /// Drop entries older than the window.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.sent.len();
        self.sent.retain(|_, at| now - *at <= self.window);
        before.saturating_sub(self.sent.len())
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recent() -> RecentIds {
        RecentIds::new(std::time::Duration::from_secs(30))
    }

    #[test]
    fn test_duplicate_within_window() {
        let ids = recent();
        let now = Utc::now();
        assert!(!ids.check_and_record_at("bob", "m-1", now));
        assert!(ids.check_and_record_at("bob", "m-1", now + Duration::seconds(10)));
    }

    #[test]
    fn test_other_recipient_not_duplicate() {
        let ids = recent();
        let now = Utc::now();
        ids.check_and_record_at("bob", "m-1", now);
        assert!(!ids.check_and_record_at("carol", "m-1", now));
    }

    #[test]
    fn test_allowed_again_after_window() {
        let ids = recent();
        let now = Utc::now();
        ids.check_and_record_at("bob", "m-1", now);
        assert!(!ids.check_and_record_at("bob", "m-1", now + Duration::seconds(31)));
    }

    #[test]
    fn test_forget_and_sweep() {
        let ids = recent();
        let now = Utc::now();
        ids.check_and_record_at("bob", "m-1", now);
        ids.forget("bob", "m-1");
        assert!(!ids.check_and_record_at("bob", "m-1", now));
        ids.check_and_record_at("bob", "m-2", now);
        assert_eq!(ids.sweep(now + Duration::seconds(60)), 2);
        assert!(ids.is_empty());
    }
}
