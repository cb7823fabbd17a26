//! End-to-end tests for the mesh: several nodes wired through a real
//! transport, exercising handshakes, routing, ordering and the directory.
//!
//! Most tests use the in-process transport with a shared record store; the
//! TCP test binds loopback listeners.

use agentmesh_types::{MeshConfig, MeshError};
use agentmesh_wire::dht::{MemoryDht, RecordStore};
use agentmesh_wire::message::{msg_types, Delivery, MessageBody, SignedMessage};
use agentmesh_wire::transport::{FrameHandler, MemoryTransport, Transport};
use agentmesh_wire::{
    handler_fn, DeliveryStrategy, Direction, InboundMessage, Keypair, MeshNode, MessageHandler,
    PeerRecord, Priority, Router,
};
use agentmesh_types::MeshResult;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Forwards to a [`MemoryTransport`] and keeps a copy of every request frame.
#[derive(Clone, Default)]
struct TapTransport {
    inner: MemoryTransport,
    seen: Arc<Mutex<Vec<SignedMessage>>>,
}

impl TapTransport {
    fn frames_of_type(&self, msg_type: &str) -> Vec<SignedMessage> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.msg_type == msg_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for TapTransport {
    async fn request(&self, endpoint: &str, frame: &SignedMessage) -> MeshResult<SignedMessage> {
        self.seen.lock().unwrap().push(frame.clone());
        self.inner.request(endpoint, frame).await
    }
}

/// Records every payload it receives and echoes it back.
fn recording_echo(log: Arc<Mutex<Vec<Value>>>) -> Arc<dyn MessageHandler> {
    handler_fn(move |msg: InboundMessage| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(msg.payload.clone());
            Ok(Some(msg.payload))
        }
    })
}

struct Mesh {
    transport: TapTransport,
    store: Arc<RecordStore>,
    routers: Vec<Router>,
}

impl Mesh {
    async fn new(n: usize, tweak: impl Fn(&mut MeshConfig)) -> Self {
        let transport = TapTransport::default();
        let store = Arc::new(RecordStore::new());
        let mut routers = Vec::new();
        for i in 0..n {
            let mut config = MeshConfig::default();
            config.node.entity_id = format!("agent-{i}");
            tweak(&mut config);
            let endpoint = format!("node-{i}");
            let node = MeshNode::with_backend(
                config,
                Keypair::generate(),
                endpoint.clone(),
                Arc::new(transport.clone()),
                Arc::new(MemoryDht::shared(store.clone())),
            )
            .unwrap();
            transport.inner.register(endpoint, &node);
            node.directory().register_self().await.unwrap();
            routers.push(Router::new(node));
        }
        Self {
            transport,
            store,
            routers,
        }
    }

    fn node(&self, i: usize) -> &Arc<MeshNode> {
        self.routers[i].node()
    }
}

fn deliver(payload: Value) -> MessageBody {
    MessageBody::Deliver(Delivery {
        message_id: uuid::Uuid::new_v4().to_string(),
        msg_type: "task".to_string(),
        payload,
        compressed: false,
    })
}

fn error_code(frame: &SignedMessage) -> Option<u16> {
    match frame.body().unwrap() {
        MessageBody::Error(e) => Some(e.code),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_encrypted_session_recovers_exact_plaintext() {
    let mesh = Mesh::new(2, |_| {}).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    mesh.routers[1].register_handler("task", recording_echo(log.clone()));

    let payload = json!({"secret": "launch-code-7731", "nested": {"n": [1, 2, 3]}});
    let report = mesh.routers[0]
        .send(
            DeliveryStrategy::Direct(mesh.node(1).peer_id().to_string()),
            "task",
            payload.clone(),
            Priority::High,
        )
        .await
        .unwrap();

    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.delivered[0].reply.as_ref(), Some(&payload));
    assert_eq!(log.lock().unwrap().as_slice(), &[payload]);

    // Both ends derived the same key.
    let outbound = mesh
        .node(0)
        .sessions()
        .lookup(mesh.node(1).peer_id(), Direction::Outbound)
        .unwrap();
    assert!(outbound.e2e);
    assert_eq!(
        mesh.node(0).sessions().key_fingerprint(&outbound.session_id),
        mesh.node(1).sessions().key_fingerprint(&outbound.session_id)
    );

    // The delivery travelled sealed; the plaintext never hit the wire.
    let sealed = mesh.transport.frames_of_type(msg_types::ENCRYPTED);
    assert_eq!(sealed.len(), 1);
    assert!(!sealed[0].payload.to_string().contains("launch-code-7731"));
    assert!(mesh.transport.frames_of_type(msg_types::DELIVER).is_empty());
}

#[tokio::test]
async fn test_broadcast_reports_unreachable_peer() {
    let mesh = Mesh::new(4, |_| {}).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    for router in &mesh.routers[1..] {
        router.register_handler("task", recording_echo(log.clone()));
    }
    mesh.transport.inner.set_offline("node-3", true);

    let report = mesh.routers[0]
        .send(DeliveryStrategy::Broadcast, "task", json!({"all": true}), Priority::Normal)
        .await
        .unwrap();

    assert_eq!(report.delivered.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].peer_id, mesh.node(3).peer_id());
    assert!(matches!(report.failed[0].error, MeshError::PeerUnreachable(_)));
    assert_eq!(log.lock().unwrap().len(), 2);
    assert!(!report
        .delivered_peers()
        .contains(&mesh.node(0).peer_id()));
}

#[tokio::test]
async fn test_sequence_replay_and_gap_rejected_without_buffering() {
    let mesh = Mesh::new(2, |c| c.session.e2e_enabled = false).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    mesh.routers[1].register_handler("task", recording_echo(log.clone()));

    let a = mesh.node(0);
    let b = mesh.node(1);
    let record: PeerRecord = a.directory().lookup(b.peer_id()).await.unwrap();
    let info = a.connect(&record).await.unwrap();
    let sid = info.session_id.as_str();
    let frame = |seq: u64, n: u64| {
        a.auth()
            .envelope(Some(b.peer_id().to_string()), &deliver(json!(n)), Some((sid, seq)))
            .unwrap()
    };

    // In order.
    assert!(error_code(&b.handle_frame(frame(0, 0)).await).is_none());
    // Same position again, fresh nonce: a sequence replay.
    assert_eq!(error_code(&b.handle_frame(frame(0, 1)).await), Some(422));
    // Skipping ahead is a gap, and is not held for later.
    assert_eq!(error_code(&b.handle_frame(frame(2, 2)).await), Some(422));
    // The expected position still works.
    assert!(error_code(&b.handle_frame(frame(1, 3)).await).is_none());
    // Position 2 was never buffered, so it is accepted now as a new frame.
    assert!(error_code(&b.handle_frame(frame(2, 4)).await).is_none());

    assert_eq!(log.lock().unwrap().as_slice(), &[json!(0), json!(3), json!(4)]);
}

#[tokio::test]
async fn test_large_payload_is_chunked_and_reassembled() {
    let mesh = Mesh::new(2, |c| {
        c.chunking.threshold_bytes = 512;
        c.chunking.chunk_size_bytes = 128;
    })
    .await;
    mesh.routers[1].register_handler(
        "task",
        handler_fn(|msg: InboundMessage| async move {
            let text = msg.payload.as_str().unwrap_or_default().to_string();
            Ok(Some(json!({"len": text.len(), "tail": text[text.len() - 36..].to_string()})))
        }),
    );

    let body: String = (0..100).map(|_| uuid::Uuid::new_v4().to_string()).collect();
    let report = mesh.routers[0]
        .send(
            DeliveryStrategy::Direct(mesh.node(1).peer_id().to_string()),
            "task",
            json!(body),
            Priority::Normal,
        )
        .await
        .unwrap();

    let reply = report.delivered[0].reply.clone().unwrap();
    assert_eq!(reply["len"], body.len());
    assert_eq!(reply["tail"], body[body.len() - 36..]);
    assert!(mesh.transport.frames_of_type(msg_types::ENCRYPTED).len() > 1);
    assert_eq!(mesh.node(1).reassembler().pending(), 0);
}

#[tokio::test]
async fn test_expired_record_excluded_from_discovery() {
    let mesh = Mesh::new(2, |_| {}).await;
    let ghost = Keypair::generate();
    let issued = Utc::now() - ChronoDuration::seconds(120);
    let stale = PeerRecord::signed_at(
        &ghost,
        "ghost",
        "ghost",
        "node-ghost",
        vec!["task".to_string()],
        60,
        issued,
    )
    .unwrap();
    // Present in the store and offered first-hand, yet never served.
    mesh.store
        .store(stale.contact().key().unwrap(), stale.clone(), issued)
        .unwrap();
    mesh.node(0).directory().learn(stale).unwrap();
    assert!(mesh
        .node(0)
        .directory()
        .lookup(&ghost.peer_id())
        .await
        .is_none());

    let peers = mesh.routers[0].discover(None).await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, mesh.node(1).peer_id());
}

#[tokio::test]
async fn test_tcp_nodes_bootstrap_and_exchange() {
    let (tx, rx) = watch::channel(false);

    let (seed, seed_accept) = MeshNode::start_tcp(MeshConfig::default(), Keypair::generate(), rx.clone())
        .await
        .unwrap();
    seed.join().await.unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    seed.register_handler("task", recording_echo(log.clone()));

    let (host, port) = seed.endpoint().rsplit_once(':').unwrap();
    let mut config = MeshConfig::default();
    config.dht.bootstrap.push(agentmesh_types::config::BootstrapNode {
        host: host.to_string(),
        port: port.parse().unwrap(),
        priority: 0,
    });
    let (joiner, joiner_accept) = MeshNode::start_tcp(config, Keypair::generate(), rx)
        .await
        .unwrap();
    assert_eq!(joiner.directory().bootstrap().await, 1);
    joiner.directory().register_self().await.unwrap();

    let seed_record = seed.directory().local_record().unwrap();
    joiner.directory().learn(seed_record).unwrap();
    let router = Router::new(joiner.clone());
    let report = router
        .send(
            DeliveryStrategy::Direct(seed.peer_id().to_string()),
            "task",
            json!({"over": "tcp"}),
            Priority::Normal,
        )
        .await
        .unwrap();
    assert_eq!(report.delivered[0].reply, Some(json!({"over": "tcp"})));
    assert_eq!(log.lock().unwrap().len(), 1);

    tx.send(true).unwrap();
    for accept in [seed_accept, joiner_accept] {
        tokio::time::timeout(Duration::from_secs(5), accept)
            .await
            .unwrap()
            .unwrap();
    }
}
