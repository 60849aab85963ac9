pub mod config;
pub mod container_runtime;
pub mod election;
pub mod peer_client;
pub mod peer_registry;
pub mod peer_server;
pub mod revival;
pub mod server;
pub mod worker_listener;
pub mod worker_registry;

use thiserror::Error;

pub use config::HcConfig;
pub use container_runtime::{ContainerRuntime, DockerRuntime};
pub use server::HealthChecker;

#[derive(Error, Debug)]
pub enum HealthCheckError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] wire::CodecError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] common::error::ConfigError),
}
