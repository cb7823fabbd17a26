//! Transport configuration.
//!
//! Every section defaults independently, so a config file only needs to name
//! the values it overrides.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current protocol version string.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Root configuration for a mesh node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Emit JSON-formatted logs.
    pub log_json: bool,
    pub node: NodeConfig,
    pub security: SecurityConfig,
    pub session: SessionConfig,
    pub chunking: ChunkingConfig,
    pub flow: FlowConfig,
    pub dht: DhtConfig,
    pub router: RouterConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            node: NodeConfig::default(),
            security: SecurityConfig::default(),
            session: SessionConfig::default(),
            chunking: ChunkingConfig::default(),
            flow: FlowConfig::default(),
            dht: DhtConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Reject values the transport cannot operate with.
    pub fn validate(&self) -> MeshResult<()> {
        if self.node.entity_id.trim().is_empty() {
            return Err(MeshError::Config("node.entity_id must not be empty".into()));
        }
        if self.chunking.chunk_size_bytes == 0 {
            return Err(MeshError::Config(
                "chunking.chunk_size_bytes must be positive".into(),
            ));
        }
        if self.chunking.max_chunks == 0 {
            return Err(MeshError::Config("chunking.max_chunks must be positive".into()));
        }
        if self.chunking.max_payload_bytes < self.chunking.threshold_bytes {
            return Err(MeshError::Config(format!(
                "chunking.max_payload_bytes ({}) must not be below chunking.threshold_bytes ({})",
                self.chunking.max_payload_bytes, self.chunking.threshold_bytes
            )));
        }
        if self.chunking.max_pending_per_sender == 0 {
            return Err(MeshError::Config(
                "chunking.max_pending_per_sender must be positive".into(),
            ));
        }
        if self.dht.refresh_interval_secs >= self.dht.record_ttl_secs {
            return Err(MeshError::Config(format!(
                "dht.refresh_interval_secs ({}) must be shorter than dht.record_ttl_secs ({})",
                self.dht.refresh_interval_secs, self.dht.record_ttl_secs
            )));
        }
        if self.session.supported_versions.is_empty() {
            return Err(MeshError::Config(
                "session.supported_versions must list at least one version".into(),
            ));
        }
        if self.dht.bucket_size == 0 || self.dht.alpha == 0 {
            return Err(MeshError::Config(
                "dht.bucket_size and dht.alpha must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Local node identity and listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: String,
    /// Endpoint advertised to other peers. Defaults to the bound address.
    pub advertised_endpoint: Option<String>,
    /// Stable entity identifier (business-level name of this agent).
    pub entity_id: String,
    /// Human-readable entity name.
    pub entity_name: String,
    /// Where the Ed25519 seed is persisted. `None` keeps the key in memory.
    pub key_path: Option<PathBuf>,
    /// Capabilities advertised in this node's directory record.
    pub capabilities: Vec<String>,
    /// Deadline for a single request/response exchange with a peer.
    pub request_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            advertised_endpoint: None,
            entity_id: "agentmesh-node".to_string(),
            entity_name: "agentmesh-node".to_string(),
            key_path: None,
            capabilities: Vec::new(),
            request_timeout_secs: 10,
        }
    }
}

/// Authentication and anti-replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// How long a (sender, nonce) pair is remembered, and the maximum age of
    /// an accepted message.
    pub replay_window_secs: u64,
    /// Tolerated clock drift for timestamps in the future.
    pub clock_skew_secs: u64,
    /// Accept unsigned messages, flagged as legacy to handlers.
    pub allow_unsigned_legacy: bool,
    /// Interval of the nonce-cache sweep.
    pub sweep_interval_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 60,
            clock_skew_secs: 30,
            allow_unsigned_legacy: false,
            sweep_interval_secs: 15,
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session expires.
    pub ttl_secs: u64,
    /// Deadline for a handshake round trip.
    pub handshake_timeout_secs: u64,
    /// Request end-to-end encryption for new sessions.
    pub e2e_enabled: bool,
    /// Protocol versions offered during the handshake, most preferred first.
    pub supported_versions: Vec<String>,
    /// Interval of the expired-session sweep.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            handshake_timeout_secs: 10,
            e2e_enabled: true,
            supported_versions: vec![PROTOCOL_VERSION.to_string()],
            sweep_interval_secs: 60,
        }
    }
}

/// Chunked transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Serialized deliveries larger than this are split.
    pub threshold_bytes: usize,
    /// Raw bytes per chunk (before base64).
    pub chunk_size_bytes: usize,
    /// Upper bound on `total_chunks` accepted from a peer.
    pub max_chunks: u32,
    /// Upper bound on the reassembled size of one chunked payload.
    pub max_payload_bytes: usize,
    /// Incomplete buffers one sender may hold open at a time.
    pub max_pending_per_sender: usize,
    /// Incomplete buffers older than this are dropped.
    pub buffer_max_age_secs: u64,
    /// Interval of the stale-buffer sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 64 * 1024,
            chunk_size_bytes: 48 * 1024,
            max_chunks: 4096,
            max_payload_bytes: 64 * 1024 * 1024,
            max_pending_per_sender: 32,
            buffer_max_age_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// Token-bucket parameters for one priority class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum burst size.
    pub capacity: u32,
    /// Tokens restored per second. Zero disables refill.
    pub refill_per_sec: u32,
}

/// Flow control and congestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub critical: BucketConfig,
    pub high: BucketConfig,
    pub normal: BucketConfig,
    pub low: BucketConfig,
    pub background: BucketConfig,
    /// Sends allowed per priority per monitor interval with no congestion.
    pub baseline_quota: u32,
    /// How often utilization is re-evaluated.
    pub monitor_interval_secs: u64,
    /// Link capacity used to compute utilization.
    pub bandwidth_bytes_per_sec: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            critical: BucketConfig {
                capacity: 200,
                refill_per_sec: 100,
            },
            high: BucketConfig {
                capacity: 100,
                refill_per_sec: 50,
            },
            normal: BucketConfig {
                capacity: 50,
                refill_per_sec: 20,
            },
            low: BucketConfig {
                capacity: 20,
                refill_per_sec: 5,
            },
            background: BucketConfig {
                capacity: 10,
                refill_per_sec: 2,
            },
            baseline_quota: 1000,
            monitor_interval_secs: 5,
            bandwidth_bytes_per_sec: 10 * 1024 * 1024,
        }
    }
}

/// A bootstrap endpoint used to join the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub host: String,
    pub port: u16,
    /// Lower values are contacted first (local/trusted nodes).
    #[serde(default)]
    pub priority: u32,
}

impl BootstrapNode {
    /// `host:port` form used by the transport.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where `discover()` collects peer records from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// Records learned from authenticated handshakes.
    Registry,
    /// Records stored in the distributed hash table.
    Dht,
}

/// Peer directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Lifetime of a published record.
    pub record_ttl_secs: u64,
    /// How often the local record is re-published. Must be below the TTL.
    pub refresh_interval_secs: u64,
    /// Deadline for an iterative lookup.
    pub lookup_timeout_secs: u64,
    /// Kademlia `k`.
    pub bucket_size: usize,
    /// Kademlia `alpha` (lookup parallelism).
    pub alpha: usize,
    /// Nodes contacted on startup.
    pub bootstrap: Vec<BootstrapNode>,
    /// Discovery sources, consulted in order.
    pub sources: Vec<DiscoverySource>,
    /// Interval of the expired-record sweep.
    pub sweep_interval_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 3600,
            refresh_interval_secs: 1200,
            lookup_timeout_secs: 10,
            bucket_size: 20,
            alpha: 3,
            bootstrap: Vec::new(),
            sources: vec![DiscoverySource::Registry, DiscoverySource::Dht],
            sweep_interval_secs: 120,
        }
    }
}

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identical logical messages inside this window are sent once.
    pub dedup_window_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.security.replay_window_secs, 60);
        assert!(config.dht.refresh_interval_secs < config.dht.record_ttl_secs);
    }

    #[test]
    fn test_refresh_must_be_shorter_than_ttl() {
        let mut config = MeshConfig::default();
        config.dht.refresh_interval_secs = config.dht.record_ttl_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refresh_interval_secs"));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut config = MeshConfig::default();
        config.chunking.chunk_size_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_limits_validated() {
        let mut config = MeshConfig::default();
        config.chunking.max_pending_per_sender = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.chunking.max_payload_bytes = config.chunking.threshold_bytes - 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_payload_bytes"));
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            log_level = "debug"

            [node]
            entity_id = "trader-7"

            [[dht.bootstrap]]
            host = "10.0.0.2"
            port = 7400
            priority = 1
        "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.entity_id, "trader-7");
        assert_eq!(config.node.request_timeout_secs, 10);
        assert_eq!(config.dht.bootstrap[0].endpoint(), "10.0.0.2:7400");
        assert_eq!(config.dht.alpha, 3);
    }

    #[test]
    fn test_discovery_sources_parse() {
        let config: MeshConfig = toml::from_str(
            r#"
            [dht]
            sources = ["dht"]
        "#,
        )
        .unwrap();
        assert_eq!(config.dht.sources, vec![DiscoverySource::Dht]);
    }
}
