use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use wire::entities::{HcCoordinator, HcElection, HcHeartbeat, HcOk};
use wire::packet::{PacketType, RawPacket};

use crate::election::PeerTransport;

/// TCP client side of the peer mesh: one persistent connection per sibling,
/// dialed lazily and dropped on the first failed send (spec §4.G peer
/// client). Connection hostnames follow the conventional container name
/// `health_checker_<id>`.
pub struct PeerClient {
    my_id: u32,
    replicas: u32,
    peer_port: u16,
    connections: Mutex<HashMap<u32, TcpStream>>,
}

impl PeerClient {
    pub fn new(my_id: u32, replicas: u32, peer_port: u16) -> Arc<Self> {
        Arc::new(Self {
            my_id,
            replicas,
            peer_port,
            connections: Mutex::new(HashMap::new()),
        })
    }

    async fn dial(&self, peer_id: u32) -> std::io::Result<TcpStream> {
        let addr = format!("health_checker_{peer_id}:{}", self.peer_port);
        tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "peer connect timed out"))?
    }

    async fn send_to_peer(&self, peer_id: u32, packet_type: PacketType, payload: Vec<u8>) {
        let mut guard = self.connections.lock().await;
        if !guard.contains_key(&peer_id) {
            match self.dial(peer_id).await {
                Ok(stream) => {
                    guard.insert(peer_id, stream);
                }
                Err(e) => {
                    tracing::debug!(peer_id, error = %e, "peer unreachable");
                    return;
                }
            }
        }

        let raw = RawPacket::new(packet_type, payload);
        let Some(stream) = guard.get_mut(&peer_id) else {
            return;
        };
        if let Err(e) = raw.write_to(stream).await {
            tracing::debug!(peer_id, error = %e, "send failed, dropping connection");
            guard.remove(&peer_id);
        }
    }

    /// Forces the next send to this peer to redial (spec §4.G: a peer that
    /// sent us `Election` may be the one we thought was alive on a stale
    /// connection, so drop it and let the next heartbeat reconnect).
    pub async fn clear_connection(&self, peer_id: u32) {
        self.connections.lock().await.remove(&peer_id);
    }

    pub async fn send_heartbeats(&self) {
        let packet = HcHeartbeat {
            hc_id: self.my_id,
            timestamp_ms: common::now_ms(),
        };
        let Ok(payload) = serde_json::to_vec(&packet) else {
            return;
        };
        for peer_id in 0..self.replicas {
            if peer_id == self.my_id {
                continue;
            }
            self.send_to_peer(peer_id, PacketType::HcHeartbeat, payload.clone()).await;
        }
    }

    pub fn spawn_heartbeat_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.replicas <= 1 {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => this.send_heartbeats().await,
                }
            }
        });
    }
}

#[async_trait]
impl PeerTransport for PeerClient {
    async fn send_election(&self, peer_id: u32) {
        let packet = HcElection { hc_id: self.my_id };
        if let Ok(payload) = serde_json::to_vec(&packet) {
            self.send_to_peer(peer_id, PacketType::HcElection, payload).await;
        }
    }

    async fn send_ok(&self, peer_id: u32) {
        let packet = HcOk { hc_id: self.my_id };
        if let Ok(payload) = serde_json::to_vec(&packet) {
            self.send_to_peer(peer_id, PacketType::HcOk, payload).await;
        }
    }

    async fn send_coordinator(&self) {
        let packet = HcCoordinator { hc_id: self.my_id };
        let Ok(payload) = serde_json::to_vec(&packet) else {
            return;
        };
        for peer_id in 0..self.replicas {
            if peer_id == self.my_id {
                continue;
            }
            self.send_to_peer(peer_id, PacketType::HcCoordinator, payload.clone()).await;
        }
    }
}
