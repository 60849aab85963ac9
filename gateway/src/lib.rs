pub mod config;
pub mod handler;
pub mod results;
pub mod server;
pub mod session;

use thiserror::Error;

pub use config::GatewayConfig;
pub use server::GatewayServer;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("codec error: {0}")]
    Codec(#[from] wire::CodecError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] common::error::ConfigError),

    #[error("client sent {0:?}, expected {1:?}")]
    UnexpectedPacket(wire::PacketType, wire::PacketType),

    #[error("client closed connection")]
    ClientClosed,

    #[error("result channel for query {0} closed unexpectedly")]
    ResultChannelClosed(String),
}
