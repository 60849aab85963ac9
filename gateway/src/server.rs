use std::sync::Arc;

use tokio::net::TcpListener;

use broker::BrokerClient;
use runtime::Shutdown;

use crate::GatewayError;
use crate::config::GatewayConfig;
use crate::handler::ClientHandler;

/// Accepts one TCP client at a time and runs its session to completion
/// before accepting the next (spec §4.H: multi-client is a non-goal).
pub struct GatewayServer {
    config: GatewayConfig,
    client: BrokerClient,
    shutdown: Shutdown,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, client: BrokerClient, shutdown: Shutdown) -> Self {
        Self { config, client, shutdown }
    }

    /// Declares every raw-route exchange and its downstream partition queues
    /// up front, mirroring `OutputFanout::declare` — the gateway is the sole
    /// producer onto these exchanges and must bind them before any client
    /// data can be routed.
    async fn declare_routes(&self) {
        for route in self.config.raw_routes.values() {
            self.client.declare_direct_exchange(&route.exchange).await;
            for k in 0..route.downstream_workers.max(1) {
                let queue = format!("{}_{k}", route.downstream_stage);
                self.client.declare_queue(&queue, 512).await;
                let _ = self.client.bind(&route.exchange, Some(&queue), &queue).await;
            }
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        self.declare_routes().await;

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        tracing::info!(port = self.config.port, "gateway listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (mut stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::info!(%addr, "client connected");
                    let handler = ClientHandler::new(self.client.clone(), self.config.clone());
                    handler.handle_session(&mut stream).await;
                    tracing::info!(%addr, "client disconnected");
                }
            }
        }

        tracing::info!("gateway shutting down");
        Ok(())
    }
}
