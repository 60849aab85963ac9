pub mod codec;
pub mod entities;
pub mod headers;
pub mod packet;

use thiserror::Error;

pub use codec::{Batch, EntityKind};
pub use headers::{MESSAGE_ID, SESSION_ID};
pub use packet::{ErrorPacket, Header, PacketType, RawPacket};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("invalid header or malformed control payload")]
    InvalidHeader,
}
