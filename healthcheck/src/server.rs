use std::sync::Arc;
use std::time::Duration;

use runtime::Shutdown;

use crate::HealthCheckError;
use crate::config::HcConfig;
use crate::container_runtime::{ContainerRuntime, DockerRuntime};
use crate::election::BullyElection;
use crate::peer_client::PeerClient;
use crate::peer_registry::PeerRegistry;
use crate::peer_server::PeerServer;
use crate::revival::RevivalLoop;
use crate::worker_listener::WorkerListener;
use crate::worker_registry::WorkerRegistry;

/// Wires together one health-checker replica's UDP worker listener, TCP
/// peer mesh, Bully election, and revival loop (spec §4.G). Generic over
/// `ContainerRuntime` so the whole thing runs under a fake in tests.
pub struct HealthChecker<R: ContainerRuntime = DockerRuntime> {
    config: HcConfig,
    worker_registry: Arc<WorkerRegistry>,
    peer_registry: Arc<PeerRegistry>,
    peer_client: Arc<PeerClient>,
    election: Arc<BullyElection<PeerClient>>,
    container_runtime: Arc<R>,
}

impl HealthChecker<DockerRuntime> {
    pub async fn new(config: HcConfig) -> Result<Self, HealthCheckError> {
        Self::with_runtime(config, Arc::new(DockerRuntime)).await
    }
}

impl<R: ContainerRuntime + 'static> HealthChecker<R> {
    pub async fn with_runtime(config: HcConfig, container_runtime: Arc<R>) -> Result<Self, HealthCheckError> {
        let worker_registry = Arc::new(WorkerRegistry::new(&config.registry_path));
        worker_registry.load().await?;

        let peer_registry = Arc::new(PeerRegistry::new(config.replica_id));
        let peer_client = PeerClient::new(config.replica_id, config.replicas, config.peer_port);
        let election = BullyElection::new(
            config.replica_id,
            config.replicas,
            Duration::from_secs(config.election_timeout_secs),
            Duration::from_secs(config.coordinator_timeout_secs),
            Arc::clone(&peer_client),
        );

        Ok(Self {
            config,
            worker_registry,
            peer_registry,
            peer_client,
            election,
            container_runtime,
        })
    }

    pub async fn run(self, shutdown: Shutdown) -> Result<(), HealthCheckError> {
        let worker_listener = WorkerListener::bind(self.config.worker_port, Arc::clone(&self.worker_registry)).await?;
        let peer_server = PeerServer::new(
            self.config.peer_port,
            Arc::clone(&self.peer_registry),
            Arc::clone(&self.election),
            Arc::clone(&self.peer_client),
        );
        let revival = RevivalLoop::new(
            Duration::from_secs(self.config.check_interval_secs),
            self.config.worker_timeout_secs * 1_000,
            self.config.peer_timeout_secs * 1_000,
            Arc::clone(&self.worker_registry),
            Arc::clone(&self.peer_registry),
            Arc::clone(&self.election),
            Arc::clone(&self.container_runtime),
        );

        self.peer_client.spawn_heartbeat_loop(
            Duration::from_secs(self.config.peer_heartbeat_interval_secs),
            shutdown.subscribe(),
        );

        let worker_listener_task = tokio::spawn(worker_listener.run(shutdown.subscribe()));
        let peer_server_task = tokio::spawn(peer_server.run(shutdown.subscribe()));
        let revival_task = tokio::spawn(revival.run(shutdown.subscribe()));
        let monitor_task = tokio::spawn(leader_monitor_loop(
            Arc::clone(&self.election),
            Arc::clone(&self.peer_registry),
            self.config.peer_timeout_secs * 1_000,
            self.config.replica_id,
            shutdown.subscribe(),
        ));

        self.election.start_election();

        shutdown.listen().await;

        let _ = worker_listener_task.await;
        let _ = peer_server_task.await;
        revival_task.await.ok();
        monitor_task.await.ok();

        self.worker_registry.persist().await?;
        Ok(())
    }
}

/// Spec §4.G: "on loss of leader heartbeat beyond `peer_timeout`" triggers a
/// fresh election (mirrors the original's leader-monitor thread).
async fn leader_monitor_loop(
    election: Arc<BullyElection<PeerClient>>,
    peer_registry: Arc<PeerRegistry>,
    peer_timeout_ms: u64,
    my_id: u32,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(peer_timeout_ms.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(leader) = election.get_current_leader().await else { continue };
                if leader == my_id {
                    continue;
                }
                let now = common::now_ms();
                let dead = peer_registry.get_dead_ids(peer_timeout_ms, now).await;
                if dead.contains(&leader) {
                    tracing::warn!(leader, "leader appears dead, starting election");
                    election.start_election();
                }
            }
        }
    }
}
