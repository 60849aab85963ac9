use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CodecError;
use crate::packet::{PacketType, RawPacket};

/// Body of every typed batch packet (spec §4.B): a list of JSON rows plus an
/// `eof` marker. `eof: true` with empty `rows` is the common EOF shape;
/// readers must not assume rows is empty whenever eof is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch<T> {
    pub rows: Vec<T>,
    pub eof: bool,
}

impl<T> Batch<T> {
    pub fn rows(rows: Vec<T>) -> Self {
        Self { rows, eof: false }
    }

    pub fn eof() -> Self {
        Self {
            rows: Vec::new(),
            eof: true,
        }
    }
}

impl<T: Serialize> Batch<T> {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_raw(&self, packet_type: PacketType) -> Result<RawPacket, CodecError> {
        Ok(RawPacket::new(packet_type, self.encode()?))
    }
}

impl<T: DeserializeOwned> Batch<T> {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn from_raw(raw: &RawPacket) -> Result<Self, CodecError> {
        Self::decode(&raw.payload)
    }
}

/// Entity kind carried by a typed batch; used to dispatch deserialization
/// without the runtime needing to know concrete entity types (spec §9
/// design note: "avoid generics on the base that leak through every
/// operator").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Store,
    User,
    MenuItem,
    Transaction,
    TransactionItem,
}

impl EntityKind {
    pub fn packet_type(self) -> PacketType {
        match self {
            EntityKind::Store => PacketType::StoreBatch,
            EntityKind::User => PacketType::UsersBatch,
            EntityKind::MenuItem => PacketType::MenuItemsBatch,
            EntityKind::Transaction => PacketType::TransactionsBatch,
            EntityKind::TransactionItem => PacketType::TransactionItemsBatch,
        }
    }
}
