use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::HcConfig;
use crate::container_runtime::ContainerRuntime;
use crate::election::{BullyElection, PeerTransport};
use crate::peer_registry::PeerRegistry;
use crate::worker_registry::WorkerRegistry;

/// Spec §4.G revival loop: every `check_interval`, persists the worker
/// registry, and — only if this replica is the current leader — restarts
/// any worker or sibling HC that has gone silent past its timeout.
pub struct RevivalLoop<T: PeerTransport, R: ContainerRuntime> {
    check_interval: Duration,
    worker_timeout_ms: u64,
    peer_timeout_ms: u64,
    worker_registry: Arc<WorkerRegistry>,
    peer_registry: Arc<PeerRegistry>,
    election: Arc<BullyElection<T>>,
    runtime: Arc<R>,
}

impl<T: PeerTransport + 'static, R: ContainerRuntime + 'static> RevivalLoop<T, R> {
    pub fn new(
        check_interval: Duration,
        worker_timeout_ms: u64,
        peer_timeout_ms: u64,
        worker_registry: Arc<WorkerRegistry>,
        peer_registry: Arc<PeerRegistry>,
        election: Arc<BullyElection<T>>,
        runtime: Arc<R>,
    ) -> Self {
        Self {
            check_interval,
            worker_timeout_ms,
            peer_timeout_ms,
            worker_registry,
            peer_registry,
            election,
            runtime,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        if let Err(e) = self.worker_registry.persist().await {
            tracing::warn!(error = %e, "failed to persist worker registry");
        }

        if !self.election.am_i_leader().await {
            return;
        }

        let now = common::now_ms();
        for worker in self.worker_registry.get_dead(self.worker_timeout_ms, now).await {
            self.revive(&worker).await;
        }

        for peer_id in self.peer_registry.get_dead_ids(self.peer_timeout_ms, now).await {
            self.revive(&HcConfig::peer_container_name(peer_id)).await;
            self.peer_registry.remove(peer_id).await;
        }
    }

    async fn revive(&self, name: &str) {
        tracing::warn!(container = name, "reviving container");
        match self.runtime.start(name).await {
            Ok(()) => tracing::info!(container = name, "revival succeeded"),
            Err(e) => tracing::error!(container = name, error = %e, "revival failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::HealthCheckError;
    use crate::election::PeerTransport;

    struct NoopTransport;

    #[async_trait]
    impl PeerTransport for NoopTransport {
        async fn send_election(&self, _peer_id: u32) {}
        async fn send_ok(&self, _peer_id: u32) {}
        async fn send_coordinator(&self) {}
    }

    struct RecordingRuntime {
        started: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn start(&self, name: &str) -> Result<(), HealthCheckError> {
            self.started.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn only_leader_revives_dead_workers() {
        let dir = tempfile::tempdir().unwrap();
        let worker_registry = Arc::new(WorkerRegistry::new(dir.path().join("registry.json")));
        worker_registry.update("worker_filter_0", 0).await;

        let peer_registry = Arc::new(PeerRegistry::new(0));
        let election = BullyElection::new(0, 1, Duration::from_millis(10), Duration::from_millis(10), Arc::new(NoopTransport));
        let runtime = Arc::new(RecordingRuntime {
            started: StdMutex::new(Vec::new()),
        });

        let revival = RevivalLoop::new(
            Duration::from_millis(10),
            0,
            1_000,
            worker_registry,
            peer_registry,
            Arc::clone(&election),
            Arc::clone(&runtime),
        );

        revival.tick().await;
        assert!(runtime.started.lock().unwrap().is_empty());

        election.start_election();
        tokio::time::sleep(Duration::from_millis(20)).await;
        revival.tick().await;

        assert_eq!(runtime.started.lock().unwrap().as_slice(), ["worker_filter_0"]);
    }
}
