use std::path::PathBuf;

use common::error::{ConfigError, env_or};

/// Everything one health-checker replica reads from its environment (spec
/// §4.G/§6). Mirrors the shape of `runtime::WorkerConfig` but for the
/// cluster-management side of the fleet rather than a stage worker.
#[derive(Debug, Clone)]
pub struct HcConfig {
    pub replica_id: u32,
    pub replicas: u32,
    pub worker_port: u16,
    pub peer_port: u16,
    pub check_interval_secs: u64,
    pub worker_timeout_secs: u64,
    pub peer_heartbeat_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub election_timeout_secs: u64,
    pub coordinator_timeout_secs: u64,
    pub registry_path: PathBuf,
}

impl HcConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            replica_id: env_or("REPLICA_ID", 0)?,
            replicas: env_or("REPLICAS", 1)?,
            worker_port: env_or("WORKER_PORT", 9001)?,
            peer_port: env_or("PEER_PORT", 9101)?,
            check_interval_secs: env_or("CHECK_INTERVAL_SECS", 5)?,
            worker_timeout_secs: env_or("WORKER_TIMEOUT_SECS", 15)?,
            peer_heartbeat_interval_secs: env_or("PEER_HEARTBEAT_INTERVAL_SECS", 3)?,
            peer_timeout_secs: env_or("PEER_TIMEOUT_SECS", 10)?,
            election_timeout_secs: env_or("ELECTION_TIMEOUT_SECS", 5)?,
            coordinator_timeout_secs: env_or("COORDINATOR_TIMEOUT_SECS", 5)?,
            registry_path: PathBuf::from(env_or(
                "REGISTRY_PATH",
                format!("/state/registry_{}.json", env_or::<u32>("REPLICA_ID", 0)?),
            )?),
        })
    }

    /// Conventional container name for a sibling health-checker (spec §4.G).
    pub fn peer_container_name(peer_id: u32) -> String {
        format!("health_checker_{peer_id}")
    }
}
