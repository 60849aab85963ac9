use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use wire::entities::Heartbeat;

use crate::HealthCheckError;
use crate::worker_registry::WorkerRegistry;

const UDP_BUFFER_SIZE: usize = 1024;

/// UDP listener for worker heartbeats (spec §4.G). One datagram, one
/// `Heartbeat` — there is no framing header since UDP already preserves
/// message boundaries.
pub struct WorkerListener {
    socket: UdpSocket,
    registry: Arc<WorkerRegistry>,
}

impl WorkerListener {
    pub async fn bind(port: u16, registry: Arc<WorkerRegistry>) -> Result<Self, HealthCheckError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, "worker heartbeat listener bound");
        Ok(Self { socket, registry })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                recvd = self.socket.recv_from(&mut buf) => {
                    match recvd {
                        Ok((len, _addr)) => self.handle_datagram(&buf[..len]).await,
                        Err(e) => tracing::warn!(error = %e, "udp recv failed"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8]) {
        match serde_json::from_slice::<Heartbeat>(bytes) {
            Ok(hb) => {
                let is_new = self.registry.update(hb.container_name.clone(), hb.timestamp).await;
                if is_new {
                    tracing::info!(container = %hb.container_name, "worker registered");
                }
            }
            Err(e) => tracing::warn!(error = %e, "malformed worker heartbeat"),
        }
    }
}
