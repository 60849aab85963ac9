pub mod config;
pub mod output;
pub mod shutdown;
pub mod worker;

use thiserror::Error;

pub use config::{OutputSpec, RoutingFn, WorkerConfig};
pub use output::OutputFanout;
pub use shutdown::Shutdown;
pub use worker::StageWorker;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("broker error: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] wire::CodecError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] common::error::ConfigError),

    #[error("malformed message: {0}")]
    Malformed(String),
}
