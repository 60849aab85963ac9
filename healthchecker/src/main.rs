use healthcheck::{HcConfig, HealthChecker};
use runtime::Shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HcConfig::from_env()?;
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    common::init_tracing("health_checker", is_production);

    tracing::info!(replica_id = config.replica_id, replicas = config.replicas, "starting health checker");

    let shutdown = Shutdown::new();
    let checker = HealthChecker::new(config).await?;
    checker.run(shutdown).await?;

    tracing::info!("health checker exited cleanly");
    Ok(())
}
