use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wire::entities::{HcCoordinator, HcElection, HcHeartbeat, HcOk};
use wire::packet::{PacketType, RawPacket};

use crate::HealthCheckError;
use crate::election::{BullyElection, PeerTransport};
use crate::peer_client::PeerClient;
use crate::peer_registry::PeerRegistry;

/// TCP server accepting connections from sibling health-checkers and
/// dispatching `HcHeartbeat`/`HcElection`/`HcOk`/`HcCoordinator` packets
/// (spec §4.G peer server).
pub struct PeerServer<T: PeerTransport> {
    port: u16,
    peer_registry: Arc<PeerRegistry>,
    election: Arc<BullyElection<T>>,
    peer_client: Arc<PeerClient>,
}

impl<T: PeerTransport + 'static> PeerServer<T> {
    pub fn new(
        port: u16,
        peer_registry: Arc<PeerRegistry>,
        election: Arc<BullyElection<T>>,
        peer_client: Arc<PeerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            port,
            peer_registry,
            election,
            peer_client,
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), HealthCheckError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        tracing::info!(port = self.port, "peer server listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move { this.handle_connection(stream).await; });
                        }
                        Err(e) => tracing::warn!(error = %e, "peer accept failed"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        loop {
            match RawPacket::read_from(&mut stream).await {
                Ok(packet) => self.dispatch(packet).await,
                Err(_) => break,
            }
        }
    }

    async fn dispatch(&self, packet: RawPacket) {
        let now = common::now_ms();
        match packet.packet_type {
            PacketType::HcHeartbeat => {
                if let Ok(hb) = serde_json::from_slice::<HcHeartbeat>(&packet.payload) {
                    self.peer_registry.update(hb.hc_id, now).await;
                }
            }
            PacketType::HcElection => {
                if let Ok(el) = serde_json::from_slice::<HcElection>(&packet.payload) {
                    self.peer_client.clear_connection(el.hc_id).await;
                    self.election.handle_election(el.hc_id);
                }
            }
            PacketType::HcOk => {
                if let Ok(ok) = serde_json::from_slice::<HcOk>(&packet.payload) {
                    self.election.handle_ok(ok.hc_id).await;
                }
            }
            PacketType::HcCoordinator => {
                if let Ok(coord) = serde_json::from_slice::<HcCoordinator>(&packet.payload) {
                    self.peer_registry.update(coord.hc_id, now).await;
                    self.election.handle_coordinator(coord.hc_id).await;
                }
            }
            other => tracing::debug!(?other, "unexpected packet on peer connection"),
        }
    }
}
