pub mod client;
pub mod hub;

use thiserror::Error;

pub use client::{BrokerClient, Consumer, Envelope};
pub use hub::BrokerHub;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker disconnected: {0}")]
    Disconnected(String),

    #[error("broker protocol error: {0}")]
    Message(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
}
