//! Node lifecycle: start, join, serve until shutdown.

use crate::supervisor::Supervisor;
use agentmesh_types::{MeshConfig, MeshError, MeshResult};
use agentmesh_wire::{
    handler_fn, AnycastTarget, DeliveryReport, DeliveryStrategy, InboundMessage, Keypair,
    Maintenance, MeshNode, Priority, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Message type answered by every daemon with the payload it was sent.
pub const ECHO_MSG_TYPE: &str = "mesh.echo";

fn keypair(config: &MeshConfig) -> MeshResult<Keypair> {
    match &config.node.key_path {
        Some(path) => Keypair::load_or_generate(path),
        None => Ok(Keypair::generate()),
    }
}

/// Start a TCP node and join the directory. Join failures leave the node
/// running isolated.
async fn start(
    config: MeshConfig,
    supervisor: &Supervisor,
) -> MeshResult<(Arc<Router>, JoinHandle<()>)> {
    config.validate()?;
    let keypair = keypair(&config)?;
    let (node, accept) = MeshNode::start_tcp(config, keypair, supervisor.subscribe()).await?;
    match node.join().await {
        Ok(record) => info!(
            peer = %record.peer_id,
            endpoint = %record.endpoint,
            capabilities = ?record.capabilities,
            "Joined mesh"
        ),
        Err(e) => warn!(error = %e, "Could not publish own record; running isolated"),
    }
    Ok((Arc::new(Router::new(node)), accept))
}

/// Run a node until Ctrl+C.
pub async fn run_daemon(config: MeshConfig) -> MeshResult<()> {
    let supervisor = Supervisor::new();
    let (router, accept) = start(config, &supervisor).await?;
    router.register_handler(
        ECHO_MSG_TYPE,
        handler_fn(|msg: InboundMessage| async move { Ok(Some(msg.payload)) }),
    );
    let maintenance = Maintenance::spawn(Arc::clone(&router), supervisor.subscribe());
    info!(
        peer = %router.node().peer_id(),
        endpoint = %router.node().endpoint(),
        "agentmesh node running; press Ctrl+C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl+C; shutting down");
    }
    supervisor.shutdown();

    supervisor.reap("accept", accept).await;
    supervisor.record_failures(maintenance.join().await as u64);
    let health = supervisor.health();
    info!(
        failures = health.failure_count,
        uptime_secs = health.uptime_secs,
        sessions = router.node().sessions().len(),
        "agentmesh node stopped"
    );
    Ok(())
}

pub fn print_id(config: &MeshConfig) -> MeshResult<()> {
    let keypair = keypair(config)?;
    println!("{}", keypair.peer_id());
    Ok(())
}

/// Join, print the directory view and exit.
pub async fn list_peers(config: MeshConfig, capability: Option<String>) -> MeshResult<()> {
    let supervisor = Supervisor::new();
    let (router, accept) = start(config, &supervisor).await?;
    for peer in router.discover(capability.as_deref()).await {
        println!(
            "{}  {}  {}  [{}]",
            peer.peer_id,
            peer.entity_id,
            peer.endpoint,
            peer.capabilities.join(", ")
        );
    }
    supervisor.shutdown();
    supervisor.reap("accept", accept).await;
    Ok(())
}

fn strategy(to: Option<String>, capability: Option<String>, anycast: bool) -> DeliveryStrategy {
    match (to, capability) {
        (Some(peer), _) => DeliveryStrategy::Direct(peer),
        (None, Some(capability)) if anycast => {
            DeliveryStrategy::Anycast(AnycastTarget::Capability(capability))
        }
        (None, Some(capability)) => DeliveryStrategy::Multicast { capability },
        (None, None) => DeliveryStrategy::Broadcast,
    }
}

fn print_report(report: &DeliveryReport) {
    for delivered in &report.delivered {
        let reply = delivered
            .reply
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        println!("ok      {}  {}", delivered.peer_id, reply);
    }
    for failed in &report.failed {
        println!("failed  {}  {}", failed.peer_id, failed.error);
    }
    if let Some(note) = &report.note {
        println!("note    {note}");
    }
}

/// Join, send one message and exit.
pub async fn send_once(
    config: MeshConfig,
    to: Option<String>,
    capability: Option<String>,
    anycast: bool,
    msg_type: String,
    payload: &str,
) -> MeshResult<()> {
    let payload: Value = serde_json::from_str(payload)
        .map_err(|e| MeshError::Serialization(format!("payload is not JSON: {e}")))?;
    let supervisor = Supervisor::new();
    let (router, accept) = start(config, &supervisor).await?;

    let result = router
        .send(strategy(to, capability, anycast), msg_type, payload, Priority::Normal)
        .await;
    if let Ok(report) = &result {
        print_report(report);
    }

    supervisor.shutdown();
    supervisor.reap("accept", accept).await;
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        assert!(matches!(
            strategy(Some("p".into()), Some("c".into()), true),
            DeliveryStrategy::Direct(p) if p == "p"
        ));
        assert!(matches!(
            strategy(None, Some("c".into()), false),
            DeliveryStrategy::Multicast { capability } if capability == "c"
        ));
        assert!(matches!(
            strategy(None, Some("c".into()), true),
            DeliveryStrategy::Anycast(AnycastTarget::Capability(c)) if c == "c"
        ));
        assert!(matches!(strategy(None, None, false), DeliveryStrategy::Broadcast));
    }

    #[test]
    fn test_print_id_is_stable_for_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeshConfig::default();
        config.node.key_path = Some(dir.path().join("identity.key"));
        let first = keypair(&config).unwrap().peer_id();
        let second = keypair(&config).unwrap().peer_id();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn test_send_once_reaches_echo_node() {
        let supervisor = Supervisor::new();
        let (server, accept) = start(MeshConfig::default(), &supervisor).await.unwrap();
        server.register_handler(
            ECHO_MSG_TYPE,
            handler_fn(|msg: InboundMessage| async move { Ok(Some(msg.payload)) }),
        );

        let (host, port) = server.node().endpoint().rsplit_once(':').unwrap();
        let mut config = MeshConfig::default();
        config.dht.bootstrap.push(agentmesh_types::config::BootstrapNode {
            host: host.to_string(),
            port: port.parse().unwrap(),
            priority: 0,
        });
        send_once(
            config,
            Some(server.node().peer_id().to_string()),
            None,
            false,
            ECHO_MSG_TYPE.to_string(),
            "{\"hello\": 1}",
        )
        .await
        .unwrap();

        supervisor.shutdown();
        supervisor.reap("accept", accept).await;
        assert_eq!(supervisor.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_send_once_rejects_bad_payload() {
        let err = send_once(MeshConfig::default(), None, None, false, "x".into(), "{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Serialization(_)));
    }
}
