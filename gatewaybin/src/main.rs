use std::sync::Arc;
use std::time::Duration;

use broker::{BrokerClient, BrokerHub};
use gateway::{GatewayConfig, GatewayServer};
use runtime::Shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env()?;
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    common::init_tracing("gateway", is_production);

    let client = BrokerClient::new(BrokerHub::new(), Duration::from_secs(config.heartbeat_interval_secs));
    let shutdown = Shutdown::new();

    let server = Arc::new(GatewayServer::new(config, client, shutdown.clone()));

    let listen_task = tokio::spawn(server.run());
    shutdown.listen().await;
    listen_task.await??;

    tracing::info!("gateway exited cleanly");
    Ok(())
}
