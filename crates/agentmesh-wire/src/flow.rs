//! Priority-aware flow control.
//!
//! Two layers decide whether a send may go out:
//!
//! - a token bucket per `(peer, priority)`, implemented with GCRA via
//!   `governor` keyed limiters (one limiter per priority, keyed by peer id);
//! - a congestion policy recomputed once per monitor interval from measured
//!   bandwidth utilization. The policy can switch on compression, drop whole
//!   priority classes and cap how many sends each class gets per interval.
//!
//! The policy only changes in [`FlowController::evaluate_interval`], never per
//! message.

use agentmesh_types::config::{BucketConfig, FlowConfig};
use agentmesh_types::{MeshError, MeshResult};
use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

/// Roughly a century. Keeps `period * burst` inside governor's nanosecond range.
const NO_REFILL_HORIZON_SECS: u64 = 100 * 365 * 24 * 3600;

type PeerLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Traffic class, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Discretized link utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    None,
    Light,
    Moderate,
    Severe,
}

impl CongestionLevel {
    /// Map a utilization ratio (1.0 = link saturated) to a level.
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            CongestionLevel::None
        } else if utilization < 0.7 {
            CongestionLevel::Light
        } else if utilization < 0.9 {
            CongestionLevel::Moderate
        } else {
            CongestionLevel::Severe
        }
    }
}

/// What the current congestion level allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CongestionPolicy {
    pub level: CongestionLevel,
    pub compress: bool,
    /// Classes refused outright.
    pub dropped: Vec<Priority>,
    /// Sends allowed per class per interval, indexed like [`Priority::ALL`].
    pub quotas: [u32; 5],
}

impl CongestionPolicy {
    pub fn for_level(level: CongestionLevel, baseline: u32) -> Self {
        let full = baseline;
        let half = baseline / 2;
        let quarter = baseline / 4;
        let (compress, dropped, quotas) = match level {
            CongestionLevel::None => (false, vec![], [full, full, full, full, full]),
            CongestionLevel::Light => (true, vec![], [full, full, full, half, half]),
            CongestionLevel::Moderate => (
                true,
                vec![Priority::Background],
                [full, half, half, quarter, 0],
            ),
            CongestionLevel::Severe => (
                true,
                vec![Priority::Low, Priority::Background],
                [quarter, quarter, quarter, 0, 0],
            ),
        };
        Self {
            level,
            compress,
            dropped,
            quotas,
        }
    }

    pub fn quota(&self, priority: Priority) -> u32 {
        self.quotas[priority.index()]
    }
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub level: CongestionLevel,
    pub compress: bool,
    pub bytes_this_interval: u64,
    pub sent_this_interval: [u32; 5],
}

fn build_limiter(bucket: &BucketConfig) -> Option<PeerLimiter> {
    let burst = NonZeroU32::new(bucket.capacity)?;
    let period = if bucket.refill_per_sec == 0 {
        // No refill: the whole burst takes the horizon to come back.
        Duration::from_secs(NO_REFILL_HORIZON_SECS / bucket.capacity as u64)
    } else {
        Duration::from_nanos(1_000_000_000 / bucket.refill_per_sec as u64).max(Duration::from_nanos(1))
    };
    let quota = Quota::with_period(period)?.allow_burst(burst);
    Some(RateLimiter::keyed(quota))
}

/// Per-node flow controller shared by every send path.
pub struct FlowController {
    /// `None` for a zero-capacity class: nothing is ever admitted.
    limiters: [Option<PeerLimiter>; 5],
    baseline_quota: u32,
    bandwidth_bytes_per_sec: u64,
    policy: RwLock<CongestionPolicy>,
    sent: [AtomicU32; 5],
    bytes: AtomicU64,
}

impl FlowController {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            limiters: [
                build_limiter(&config.critical),
                build_limiter(&config.high),
                build_limiter(&config.normal),
                build_limiter(&config.low),
                build_limiter(&config.background),
            ],
            baseline_quota: config.baseline_quota,
            bandwidth_bytes_per_sec: config.bandwidth_bytes_per_sec.max(1),
            policy: RwLock::new(CongestionPolicy::for_level(
                CongestionLevel::None,
                config.baseline_quota,
            )),
            sent: Default::default(),
            bytes: AtomicU64::new(0),
        }
    }

    /// Current policy.
    pub fn policy(&self) -> CongestionPolicy {
        self.policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn level(&self) -> CongestionLevel {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).level
    }

    /// Whether outgoing payloads should be compressed this interval.
    pub fn should_compress(&self) -> bool {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).compress
    }

    /// Admit one send to `peer_id` at `priority`, or fail with `RateLimited`.
    ///
    /// A refused send consumes nothing.
    pub fn admit(&self, peer_id: &str, priority: Priority) -> MeshResult<()> {
        let policy = self.policy();
        if policy.dropped.contains(&priority) {
            debug!(peer = %peer_id, ?priority, level = ?policy.level, "Dropping send under congestion");
            return Err(MeshError::RateLimited(format!(
                "{priority:?} traffic dropped under {:?} congestion",
                policy.level
            )));
        }

        let quota = policy.quota(priority);
        let counter = &self.sent[priority.index()];
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < quota).then_some(n + 1)
            })
            .is_err()
        {
            return Err(MeshError::RateLimited(format!(
                "{priority:?} interval quota of {quota} exhausted"
            )));
        }

        let allowed = match &self.limiters[priority.index()] {
            Some(limiter) => limiter.check_key(&peer_id.to_string()).is_ok(),
            None => false,
        };
        if !allowed {
            counter.fetch_sub(1, Ordering::AcqRel);
            debug!(peer = %peer_id, ?priority, "Token bucket empty");
            return Err(MeshError::RateLimited(format!(
                "{priority:?} bucket for {peer_id} is empty"
            )));
        }
        Ok(())
    }

    /// Account bytes put on the wire.
    pub fn record_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Close the current interval: recompute the congestion level from the
    /// bytes sent over `elapsed`, install the matching policy and reset the
    /// per-interval counters.
    pub fn evaluate_interval(&self, elapsed: Duration) -> CongestionLevel {
        let bytes = self.bytes.swap(0, Ordering::AcqRel);
        for counter in &self.sent {
            counter.store(0, Ordering::Release);
        }
        let capacity = self.bandwidth_bytes_per_sec as f64 * elapsed.as_secs_f64().max(0.001);
        let utilization = bytes as f64 / capacity;
        let level = CongestionLevel::from_utilization(utilization);

        let mut policy = self.policy.write().unwrap_or_else(|e| e.into_inner());
        if policy.level != level {
            info!(from = ?policy.level, to = ?level, utilization, "Congestion level changed");
        }
        *policy = CongestionPolicy::for_level(level, self.baseline_quota);
        level
    }

    /// Drop bucket state for peers that have been idle long enough to be full.
    pub fn shrink(&self) {
        for limiter in self.limiters.iter().flatten() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    pub fn stats(&self) -> FlowStats {
        let policy = self.policy();
        FlowStats {
            level: policy.level,
            compress: policy.compress,
            bytes_this_interval: self.bytes.load(Ordering::Relaxed),
            sent_this_interval: std::array::from_fn(|i| self.sent[i].load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_refill(capacity: u32) -> FlowConfig {
        let bucket = BucketConfig {
            capacity,
            refill_per_sec: 0,
        };
        FlowConfig {
            critical: bucket,
            high: bucket,
            normal: bucket,
            low: bucket,
            background: bucket,
            ..FlowConfig::default()
        }
    }

    #[test]
    fn test_capacity_plus_k_admits_exactly_capacity() {
        let flow = FlowController::new(&no_refill(5));
        let results: Vec<bool> = (0..8)
            .map(|_| flow.admit("peer-a", Priority::Normal).is_ok())
            .collect();
        assert_eq!(results.iter().filter(|ok| **ok).count(), 5);
        assert_eq!(results.iter().filter(|ok| !**ok).count(), 3);
        assert!(matches!(
            flow.admit("peer-a", Priority::Normal),
            Err(MeshError::RateLimited(_))
        ));
    }

    #[test]
    fn test_buckets_are_per_peer_and_priority() {
        let flow = FlowController::new(&no_refill(1));
        assert!(flow.admit("peer-a", Priority::Normal).is_ok());
        assert!(flow.admit("peer-a", Priority::Normal).is_err());
        assert!(flow.admit("peer-b", Priority::Normal).is_ok());
        assert!(flow.admit("peer-a", Priority::High).is_ok());
    }

    #[test]
    fn test_zero_capacity_admits_nothing() {
        let flow = FlowController::new(&no_refill(0));
        assert!(flow.admit("peer-a", Priority::Critical).is_err());
    }

    #[test]
    fn test_congestion_levels() {
        assert_eq!(CongestionLevel::from_utilization(0.1), CongestionLevel::None);
        assert_eq!(CongestionLevel::from_utilization(0.6), CongestionLevel::Light);
        assert_eq!(CongestionLevel::from_utilization(0.8), CongestionLevel::Moderate);
        assert_eq!(CongestionLevel::from_utilization(1.4), CongestionLevel::Severe);
    }

    #[test]
    fn test_severe_policy() {
        let policy = CongestionPolicy::for_level(CongestionLevel::Severe, 1000);
        assert!(policy.compress);
        assert_eq!(policy.quota(Priority::Low), 0);
        assert_eq!(policy.quota(Priority::Background), 0);
        assert_eq!(policy.quota(Priority::Critical), 250);
        assert_eq!(policy.quota(Priority::Normal), 250);
        assert!(policy.dropped.contains(&Priority::Low));
    }

    #[test]
    fn test_evaluate_interval_switches_policy() {
        let config = FlowConfig {
            bandwidth_bytes_per_sec: 1000,
            ..FlowConfig::default()
        };
        let flow = FlowController::new(&config);
        assert!(!flow.should_compress());

        flow.record_bytes(5000);
        let level = flow.evaluate_interval(Duration::from_secs(5));
        assert_eq!(level, CongestionLevel::Severe);
        assert!(flow.should_compress());
        assert!(matches!(
            flow.admit("peer-a", Priority::Background),
            Err(MeshError::RateLimited(_))
        ));
        assert!(flow.admit("peer-a", Priority::Critical).is_ok());

        let level = flow.evaluate_interval(Duration::from_secs(5));
        assert_eq!(level, CongestionLevel::None);
        assert!(flow.admit("peer-a", Priority::Background).is_ok());
    }

    #[test]
    fn test_interval_quota_caps_sends() {
        let config = FlowConfig {
            baseline_quota: 3,
            ..FlowConfig::default()
        };
        let flow = FlowController::new(&config);
        for _ in 0..3 {
            flow.admit("peer-a", Priority::Normal).unwrap();
        }
        assert!(flow.admit("peer-b", Priority::Normal).is_err());
        flow.evaluate_interval(Duration::from_secs(5));
        assert!(flow.admit("peer-b", Priority::Normal).is_ok());
        assert_eq!(flow.stats().sent_this_interval[Priority::Normal as usize], 1);
    }

    #[test]
    fn test_priority_serde() {
        let p: Priority = serde_json::from_str("\"background\"").unwrap();
        assert_eq!(p, Priority::Background);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
