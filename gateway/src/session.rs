use std::collections::{HashMap, HashSet};

use uuid::Uuid;
use wire::PacketType;

/// Per-client-connection bookkeeping (spec §4.H). The gateway serves one
/// client at a time, so unlike `sessions::SessionManager` this tracks a
/// single in-flight session rather than a concurrent map.
pub struct GatewaySession {
    pub session_id: Uuid,
    batches_sent: HashMap<PacketType, u64>,
    eof_seen: HashSet<PacketType>,
}

impl GatewaySession {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            batches_sent: HashMap::new(),
            eof_seen: HashSet::new(),
        }
    }

    pub fn record_batch(&mut self, packet_type: PacketType, is_eof: bool) {
        *self.batches_sent.entry(packet_type).or_insert(0) += 1;
        if is_eof {
            self.eof_seen.insert(packet_type);
        }
    }

    pub fn batches_sent(&self, packet_type: PacketType) -> u64 {
        self.batches_sent.get(&packet_type).copied().unwrap_or(0)
    }

    pub fn eof_received(&self, packet_type: PacketType) -> bool {
        self.eof_seen.contains(&packet_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_batches_and_tracks_eof_per_entity() {
        let mut session = GatewaySession::new(Uuid::new_v4());
        assert_eq!(session.batches_sent(PacketType::StoreBatch), 0);
        assert!(!session.eof_received(PacketType::StoreBatch));

        session.record_batch(PacketType::StoreBatch, false);
        session.record_batch(PacketType::StoreBatch, false);
        assert_eq!(session.batches_sent(PacketType::StoreBatch), 2);
        assert!(!session.eof_received(PacketType::StoreBatch));

        session.record_batch(PacketType::StoreBatch, true);
        assert_eq!(session.batches_sent(PacketType::StoreBatch), 3);
        assert!(session.eof_received(PacketType::StoreBatch));

        // Other entity types remain untouched.
        assert_eq!(session.batches_sent(PacketType::UsersBatch), 0);
        assert!(!session.eof_received(PacketType::UsersBatch));
    }
}
