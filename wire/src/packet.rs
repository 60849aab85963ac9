use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::CodecError;

/// Stable wire type codes (spec §6). Values are part of the protocol and
/// must never be renumbered once a deployment depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    StoreBatch = 1,
    UsersBatch = 2,
    TransactionsBatch = 3,
    TransactionItemsBatch = 4,
    MenuItemsBatch = 5,
    FileSendStart = 6,
    FileSendEnd = 7,
    SessionId = 8,
    Result = 9,
    Heartbeat = 10,
    HcHeartbeat = 11,
    HcElection = 12,
    HcOk = 13,
    HcCoordinator = 14,
    Ack = 20,
    Error = 21,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        use PacketType::*;
        Ok(match v {
            1 => StoreBatch,
            2 => UsersBatch,
            3 => TransactionsBatch,
            4 => TransactionItemsBatch,
            5 => MenuItemsBatch,
            6 => FileSendStart,
            7 => FileSendEnd,
            8 => SessionId,
            9 => Result,
            10 => Heartbeat,
            11 => HcHeartbeat,
            12 => HcElection,
            13 => HcOk,
            14 => HcCoordinator,
            20 => Ack,
            21 => Error,
            other => return Err(CodecError::UnknownPacketType(other)),
        })
    }
}

/// Packet header: 1-byte type + 4-byte big-endian payload length (spec §6,
/// bit-exact). `SIZE` is the on-wire size of the header itself.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: PacketType,
    pub payload_len: u32,
}

impl Header {
    pub const SIZE: usize = 5;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.packet_type as u8;
        buf[1..5].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != Self::SIZE {
            return Err(CodecError::InvalidHeader);
        }
        let packet_type = PacketType::from_u8(buf[0])?;
        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(Self {
            packet_type,
            payload_len,
        })
    }
}

/// A raw, framed packet: a type plus its opaque payload bytes. Higher layers
/// (`codec`) interpret the payload according to `packet_type`.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CodecError> {
        let header = Header {
            packet_type: self.packet_type,
            payload_len: self.payload.len() as u32,
        };
        w.write_all(&header.serialize()).await?;
        w.write_all(&self.payload).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CodecError> {
        let mut header_buf = [0u8; Header::SIZE];
        r.read_exact(&mut header_buf).await?;
        let header = Header::deserialize(&header_buf)?;

        let mut payload = vec![0u8; header.payload_len as usize];
        r.read_exact(&mut payload).await?;

        Ok(Self {
            packet_type: header.packet_type,
            payload,
        })
    }
}

/// `ErrorPacket` payload shape (spec §6): `u32 code | u32 msg_len | utf8 message`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPacket {
    pub code: u32,
    pub message: String,
}

impl ErrorPacket {
    pub fn encode(&self) -> Vec<u8> {
        let msg = self.message.as_bytes();
        let mut out = Vec::with_capacity(8 + msg.len());
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&(msg.len() as u32).to_be_bytes());
        out.extend_from_slice(msg);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::InvalidHeader);
        }
        let code = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let msg_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        let body = buf.get(8..8 + msg_len).ok_or(CodecError::InvalidHeader)?;
        let message = String::from_utf8(body.to_vec()).map_err(|_| CodecError::InvalidHeader)?;
        Ok(Self { code, message })
    }

    pub fn to_raw(&self) -> RawPacket {
        RawPacket::new(PacketType::Error, self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_packet_survives_the_wire() {
        let sent = RawPacket::new(PacketType::TransactionsBatch, b"hello".to_vec());
        let mut buf = Vec::new();
        sent.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let recv = RawPacket::read_from(&mut cursor).await.unwrap();

        assert_eq!(recv.packet_type, PacketType::TransactionsBatch);
        assert_eq!(recv.payload, b"hello");
    }

    #[test]
    fn error_packet_rejects_truncated_payload() {
        let err = ErrorPacket {
            code: 7,
            message: "session not found".into(),
        };
        let encoded = err.encode();
        let decoded = ErrorPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, err);

        assert!(ErrorPacket::decode(&encoded[..4]).is_err());
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        assert!(matches!(
            PacketType::from_u8(99),
            Err(CodecError::UnknownPacketType(99))
        ));
    }
}
