use std::collections::HashMap;

use tokio::sync::Mutex;

/// In-memory last-seen tracking for sibling health-checkers. Unlike
/// `WorkerRegistry` this is never persisted — a restarted HC relearns its
/// peers' liveness from the next heartbeat round (spec §4.G).
pub struct PeerRegistry {
    my_id: u32,
    peers: Mutex<HashMap<u32, u64>>,
}

impl PeerRegistry {
    pub fn new(my_id: u32) -> Self {
        Self {
            my_id,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn update(&self, peer_id: u32, now_ms: u64) {
        if peer_id == self.my_id {
            return;
        }
        self.peers.lock().await.insert(peer_id, now_ms);
    }

    pub async fn remove(&self, peer_id: u32) {
        self.peers.lock().await.remove(&peer_id);
    }

    pub async fn get_alive_ids(&self, timeout_ms: u64, now_ms: u64) -> Vec<u32> {
        self.peers
            .lock()
            .await
            .iter()
            .filter(|&(_, &last_seen)| now_ms.saturating_sub(last_seen) <= timeout_ms)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn get_dead_ids(&self, timeout_ms: u64, now_ms: u64) -> Vec<u32> {
        self.peers
            .lock()
            .await
            .iter()
            .filter(|&(_, &last_seen)| now_ms.saturating_sub(last_seen) > timeout_ms)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ignores_self_and_splits_alive_from_dead() {
        let registry = PeerRegistry::new(1);
        registry.update(1, 10_000).await;
        registry.update(2, 9_500).await;
        registry.update(3, 0).await;

        assert_eq!(registry.get_alive_ids(1_000, 10_000).await, vec![2]);
        assert_eq!(registry.get_dead_ids(1_000, 10_000).await, vec![3]);
    }
}
