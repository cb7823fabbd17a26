//! Periodic maintenance jobs.
//!
//! Caches on the hot path (nonces, sessions, chunk buffers, dedup ids, DHT
//! records) are only ever pruned here, never inline. Each job runs in its own
//! task and stops when the shared shutdown signal flips to `true`.

use crate::router::Router;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handles of the running maintenance jobs.
pub struct Maintenance {
    jobs: Vec<(&'static str, JoinHandle<()>)>,
}

fn every(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Run `job` every `interval` until shutdown.
fn periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(job = name, interval_secs = interval.as_secs(), "Maintenance job started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(job = name, "Maintenance job stopped");
                        return;
                    }
                    continue;
                }
            }
            job().await;
        }
    })
}

impl Maintenance {
    /// Start every job for the node behind `router`.
    pub fn spawn(router: Arc<Router>, shutdown: watch::Receiver<bool>) -> Self {
        let config = router.node().config().clone();
        let mut jobs = Vec::new();

        let node = Arc::clone(router.node());
        jobs.push((
            "nonce_sweep",
            periodic("nonce_sweep", every(config.security.sweep_interval_secs), shutdown.clone(), move || {
                let node = Arc::clone(&node);
                async move {
                    let removed = node.auth().replay_guard().sweep(Utc::now());
                    if removed > 0 {
                        debug!(removed, "Swept nonce cache");
                    }
                }
            }),
        ));

        let node = Arc::clone(router.node());
        jobs.push((
            "session_sweep",
            periodic("session_sweep", every(config.session.sweep_interval_secs), shutdown.clone(), move || {
                let node = Arc::clone(&node);
                async move {
                    node.sessions().sweep_expired(Utc::now());
                }
            }),
        ));

        let node = Arc::clone(router.node());
        jobs.push((
            "chunk_sweep",
            periodic("chunk_sweep", every(config.chunking.sweep_interval_secs), shutdown.clone(), move || {
                let node = Arc::clone(&node);
                async move {
                    for dropped in node.reassembler().sweep(Utc::now()) {
                        warn!(chunk = %dropped, "Dropped incomplete chunked payload");
                    }
                }
            }),
        ));

        let node = Arc::clone(router.node());
        let mut last = Instant::now();
        jobs.push((
            "congestion_monitor",
            periodic("congestion_monitor", every(config.flow.monitor_interval_secs), shutdown.clone(), move || {
                let node = Arc::clone(&node);
                let elapsed = last.elapsed();
                last = Instant::now();
                async move {
                    node.flow().evaluate_interval(elapsed);
                    node.flow().shrink();
                }
            }),
        ));

        let dedup = Arc::clone(&router);
        jobs.push((
            "dedup_sweep",
            periodic("dedup_sweep", every(config.router.dedup_window_secs), shutdown.clone(), move || {
                let router = Arc::clone(&dedup);
                async move {
                    router.sweep(Utc::now());
                }
            }),
        ));

        let node = Arc::clone(router.node());
        jobs.push((
            "record_sweep",
            periodic("record_sweep", every(config.dht.sweep_interval_secs), shutdown.clone(), move || {
                let node = Arc::clone(&node);
                async move {
                    let removed = node.directory().sweep(Utc::now());
                    if removed > 0 {
                        debug!(removed, "Swept expired peer records");
                    }
                }
            }),
        ));

        let node = Arc::clone(router.node());
        jobs.push((
            "directory_refresh",
            periodic("directory_refresh", every(config.dht.refresh_interval_secs), shutdown, move || {
                let node = Arc::clone(&node);
                async move {
                    if let Err(e) = node.directory().refresh().await {
                        warn!(error = %e, "Directory refresh failed");
                    }
                }
            }),
        ));

        info!(jobs = jobs.len(), "Maintenance started");
        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wait for every job to finish. Returns how many ended abnormally.
    pub async fn join(self) -> usize {
        let mut failed = 0;
        for (name, handle) in self.jobs {
            if let Err(e) = handle.await {
                error!(job = name, error = %e, "Maintenance job failed");
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDht;
    use crate::identity::Keypair;
    use crate::node::MeshNode;
    use crate::transport::MemoryTransport;
    use agentmesh_types::MeshConfig;

    fn router() -> Arc<Router> {
        let node = MeshNode::with_backend(
            MeshConfig::default(),
            Keypair::generate(),
            "solo",
            Arc::new(MemoryTransport::new()),
            Arc::new(MemoryDht::new()),
        )
        .unwrap();
        Arc::new(Router::new(node))
    }

    #[tokio::test]
    async fn test_jobs_stop_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let maintenance = Maintenance::spawn(router(), rx);
        assert_eq!(maintenance.len(), 7);
        tx.send(true).unwrap();
        let failed = tokio::time::timeout(Duration::from_secs(5), maintenance.join())
            .await
            .unwrap();
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn test_job_runs_on_interval() {
        let (tx, rx) = watch::channel(false);
        let (ran_tx, mut ran_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = periodic("probe", Duration::from_millis(10), rx, move || {
            let ran_tx = ran_tx.clone();
            async move {
                let _ = ran_tx.send(());
            }
        });
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), ran_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_jobs() {
        let (tx, rx) = watch::channel(false);
        let maintenance = Maintenance::spawn(router(), rx);
        drop(tx);
        let failed = tokio::time::timeout(Duration::from_secs(5), maintenance.join())
            .await
            .unwrap();
        assert_eq!(failed, 0);
    }
}
