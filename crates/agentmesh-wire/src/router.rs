//! Message router: the entry point collaborators send through.
//!
//! The router resolves a [`DeliveryStrategy`] into recipients, suppresses
//! duplicate logical messages, applies flow control, and hands each
//! per-peer delivery to the node's session layer. Payloads above the chunking
//! threshold are split and sent as consecutive frames on the same session.
//!
//! Sends to one peer go through that peer's send lane, a FIFO that keeps
//! sequence numbers arriving in the order they were assigned. Different peers
//! proceed concurrently.

use crate::chunking::split;
use crate::dedup::RecentIds;
use crate::flow::Priority;
use crate::message::{Delivery, MessageBody};
use crate::node::{MeshNode, MessageHandler};
use crate::record::{PeerRecord, PeerSummary};
use agentmesh_types::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Upper bound on peers addressed by one broadcast.
const FANOUT_LIMIT: usize = 1024;

/// How to choose recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStrategy {
    /// One named peer. Fails if it cannot be reached.
    Direct(String),
    /// Every known peer. Succeeds if at least one delivery succeeds.
    Broadcast,
    /// Every peer advertising the capability.
    Multicast { capability: String },
    /// The first candidate that accepts the message.
    Anycast(AnycastTarget),
}

/// Candidate list for [`DeliveryStrategy::Anycast`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnycastTarget {
    /// Tried in the given order.
    Peers(Vec<String>),
    /// Peers advertising the capability, in discovery order.
    Capability(String),
}

/// A logical message. Re-sending the same `message_id` to the same peer inside
/// the dedup window is a no-op.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub msg_type: String,
    pub payload: Value,
    pub priority: Priority,
}

impl OutboundMessage {
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            payload,
            priority: Priority::default(),
        }
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A successful per-peer delivery.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub peer_id: String,
    /// Whatever the remote handler returned.
    pub reply: Option<Value>,
}

/// A failed per-peer delivery.
#[derive(Debug)]
pub struct FailedDelivery {
    pub peer_id: String,
    pub error: MeshError,
}

/// Per-peer outcome of a send.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub message_id: String,
    pub delivered: Vec<Delivered>,
    pub failed: Vec<FailedDelivery>,
    /// Peers skipped because the same message already went out recently.
    pub deduplicated: Vec<String>,
    /// Non-fatal condition worth surfacing, e.g. an empty multicast group.
    pub note: Option<String>,
}

impl DeliveryReport {
    fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            ..Self::default()
        }
    }

    /// At least one peer has (or recently had) the message.
    pub fn is_success(&self) -> bool {
        !self.delivered.is_empty() || !self.deduplicated.is_empty()
    }

    pub fn delivered_peers(&self) -> Vec<&str> {
        self.delivered.iter().map(|d| d.peer_id.as_str()).collect()
    }

    pub fn failed_peers(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.peer_id.as_str()).collect()
    }

    fn record(&mut self, peer_id: String, outcome: Outcome) {
        match outcome {
            Outcome::Delivered(reply) => self.delivered.push(Delivered { peer_id, reply }),
            Outcome::Duplicate => self.deduplicated.push(peer_id),
            Outcome::Failed(error) => self.failed.push(FailedDelivery { peer_id, error }),
        }
    }
}

enum Outcome {
    Delivered(Option<Value>),
    Duplicate,
    Failed(MeshError),
}

/// Routes logical messages to peers through one [`MeshNode`].
pub struct Router {
    node: Arc<MeshNode>,
    recent: RecentIds,
    /// Per-peer send lanes. A lane guards no data: holding it across the
    /// exchange only keeps one peer's frames in sequence order. The session,
    /// flow and dedup tables are never locked across transport I/O, and a busy
    /// lane delays nothing but sends to its own peer.
    lanes: DashMap<String, Arc<Mutex<()>>>,
}

impl Router {
    pub fn new(node: Arc<MeshNode>) -> Self {
        let window = Duration::from_secs(node.config().router.dedup_window_secs);
        Self {
            node,
            recent: RecentIds::new(window),
            lanes: DashMap::new(),
        }
    }

    pub fn node(&self) -> &Arc<MeshNode> {
        &self.node
    }

    pub fn recent_ids(&self) -> &RecentIds {
        &self.recent
    }

    pub fn register_handler(&self, msg_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.node.register_handler(msg_type, handler);
    }

    /// Known peers, optionally only those advertising `capability`.
    pub async fn discover(&self, capability: Option<&str>) -> Vec<PeerSummary> {
        self.node.directory().discover_summaries(capability).await
    }

    /// Send a fresh logical message.
    pub async fn send(
        &self,
        strategy: DeliveryStrategy,
        msg_type: impl Into<String>,
        payload: Value,
        priority: Priority,
    ) -> MeshResult<DeliveryReport> {
        let message = OutboundMessage::new(msg_type, payload).with_priority(priority);
        self.send_message(strategy, message).await
    }

    /// Send `message` according to `strategy`.
    pub async fn send_message(
        &self,
        strategy: DeliveryStrategy,
        message: OutboundMessage,
    ) -> MeshResult<DeliveryReport> {
        match strategy {
            DeliveryStrategy::Direct(peer_id) => self.send_direct(&peer_id, &message).await,
            DeliveryStrategy::Broadcast => {
                let peers = self.node.directory().discover(FANOUT_LIMIT).await;
                self.fan_out(peers, &message, "no known peers").await
            }
            DeliveryStrategy::Multicast { capability } => {
                let peers = self.node.directory().find_by_capability(&capability).await;
                let note = format!("no peer advertises capability '{capability}'");
                self.fan_out(peers, &message, &note).await
            }
            DeliveryStrategy::Anycast(target) => self.send_anycast(target, &message).await,
        }
    }

    async fn send_direct(&self, peer_id: &str, message: &OutboundMessage) -> MeshResult<DeliveryReport> {
        let mut report = DeliveryReport::new(&message.message_id);
        match self.deliver_to(peer_id, message).await {
            Outcome::Failed(e) => Err(e),
            outcome => {
                report.record(peer_id.to_string(), outcome);
                Ok(report)
            }
        }
    }

    async fn fan_out(
        &self,
        peers: Vec<PeerRecord>,
        message: &OutboundMessage,
        empty_note: &str,
    ) -> MeshResult<DeliveryReport> {
        let mut report = DeliveryReport::new(&message.message_id);
        if peers.is_empty() {
            info!(message = %message.message_id, "{empty_note}");
            report.note = Some(empty_note.to_string());
            return Ok(report);
        }

        let outcomes = futures::future::join_all(
            peers.iter().map(|record| self.deliver_deduplicated(record, message)),
        )
        .await;
        for (record, outcome) in peers.into_iter().zip(outcomes) {
            if let Outcome::Failed(e) = &outcome {
                warn!(peer = %record.peer_id, message = %message.message_id, error = %e, "Delivery failed");
            }
            report.record(record.peer_id, outcome);
        }

        if report.is_success() {
            Ok(report)
        } else {
            Err(MeshError::PeerUnreachable(format!(
                "message {} reached none of {} peers",
                message.message_id,
                report.failed.len()
            )))
        }
    }

    async fn send_anycast(&self, target: AnycastTarget, message: &OutboundMessage) -> MeshResult<DeliveryReport> {
        let candidates: Vec<String> = match target {
            AnycastTarget::Peers(peers) => peers,
            AnycastTarget::Capability(capability) => self
                .node
                .directory()
                .find_by_capability(&capability)
                .await
                .into_iter()
                .map(|r| r.peer_id)
                .collect(),
        };
        if candidates.is_empty() {
            return Err(MeshError::PeerNotFound("no anycast candidates".into()));
        }

        let mut report = DeliveryReport::new(&message.message_id);
        for peer_id in candidates {
            let outcome = self.deliver_to(&peer_id, message).await;
            let done = !matches!(outcome, Outcome::Failed(_));
            report.record(peer_id, outcome);
            if done {
                return Ok(report);
            }
        }
        Err(MeshError::PeerUnreachable(format!(
            "none of {} anycast candidates accepted message {}",
            report.failed.len(),
            message.message_id
        )))
    }

    async fn deliver_to(&self, peer_id: &str, message: &OutboundMessage) -> Outcome {
        if peer_id == self.node.peer_id() {
            return Outcome::Failed(MeshError::PeerNotFound("cannot send to self".into()));
        }
        match self.node.directory().lookup(peer_id).await {
            Some(record) => self.deliver_deduplicated(&record, message).await,
            None => Outcome::Failed(MeshError::PeerNotFound(peer_id.to_string())),
        }
    }

    async fn deliver_deduplicated(&self, record: &PeerRecord, message: &OutboundMessage) -> Outcome {
        if self.recent.check_and_record(&record.peer_id, &message.message_id) {
            debug!(peer = %record.peer_id, message = %message.message_id, "Suppressed duplicate send");
            return Outcome::Duplicate;
        }
        match self.deliver(record, message).await {
            Ok(reply) => Outcome::Delivered(reply),
            Err(e) => {
                self.recent.forget(&record.peer_id, &message.message_id);
                Outcome::Failed(e)
            }
        }
    }

    /// One delivery to one peer: admit, handshake if needed, compress, chunk,
    /// send.
    async fn deliver(&self, record: &PeerRecord, message: &OutboundMessage) -> MeshResult<Option<Value>> {
        let flow = self.node.flow();
        flow.admit(&record.peer_id, message.priority)?;

        let lane = Arc::clone(&*self.lanes.entry(record.peer_id.clone()).or_default());
        let _turn = lane.lock().await;

        self.node.ensure_session(record).await?;

        let mut delivery = Delivery {
            message_id: message.message_id.clone(),
            msg_type: message.msg_type.clone(),
            payload: message.payload.clone(),
            compressed: false,
        };
        if flow.should_compress() {
            delivery = delivery.compress()?;
        }

        let chunking = &self.node.config().chunking;
        let encoded = serde_json::to_vec(&delivery)?;
        if encoded.len() <= chunking.threshold_bytes {
            let ack = self
                .node
                .send_on_session(record, MessageBody::Deliver(delivery))
                .await?;
            return Ok(ack.reply);
        }

        let max = (chunking.max_chunks as u64 * chunking.chunk_size_bytes as u64)
            .min(chunking.max_payload_bytes as u64);
        if encoded.len() as u64 > max {
            return Err(MeshError::MessageTooLarge {
                size: encoded.len() as u64,
                max,
            });
        }
        let chunks = split(&encoded, chunking.chunk_size_bytes);
        debug!(
            peer = %record.peer_id,
            message = %message.message_id,
            chunks = chunks.len(),
            bytes = encoded.len(),
            "Sending chunked delivery"
        );
        let mut last = None;
        for chunk in chunks {
            last = Some(
                self.node
                    .send_on_session(record, MessageBody::Chunk(chunk))
                    .await?,
            );
        }
        match last {
            Some(ack) if ack.complete => Ok(ack.reply),
            _ => Err(MeshError::Internal(
                "last chunk was not acknowledged as complete".into(),
            )),
        }
    }

    /// Expire dedup entries and idle send lanes.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        self.recent.sweep(now)
    }
}
