use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

/// Sends the three Bully control messages to peers. Implemented by
/// `peer_client::PeerClient`; kept as a trait so `BullyElection` never
/// touches TCP directly (spec §4.G core wiring).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_election(&self, peer_id: u32);
    async fn send_ok(&self, peer_id: u32);
    async fn send_coordinator(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Electing,
    Leader,
}

struct Inner {
    state: ElectionState,
    current_leader: Option<u32>,
    epoch: u64,
    ok_received_epoch: Option<u64>,
}

/// Bully leader election among `replicas` health-checker replicas numbered
/// `0..replicas` (spec §4.G). The highest-numbered replica still reachable
/// wins; a replica that just restarted has no special claim and simply
/// joins whichever election is already in flight.
pub struct BullyElection<T: PeerTransport> {
    my_id: u32,
    replicas: u32,
    election_timeout: Duration,
    coordinator_timeout: Duration,
    transport: Arc<T>,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl<T: PeerTransport + 'static> BullyElection<T> {
    pub fn new(
        my_id: u32,
        replicas: u32,
        election_timeout: Duration,
        coordinator_timeout: Duration,
        transport: Arc<T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            my_id,
            replicas,
            election_timeout,
            coordinator_timeout,
            transport,
            inner: Mutex::new(Inner {
                state: ElectionState::Follower,
                current_leader: None,
                epoch: 0,
                ok_received_epoch: None,
            }),
            notify: Notify::new(),
        })
    }

    pub async fn get_current_leader(&self) -> Option<u32> {
        self.inner.lock().await.current_leader
    }

    pub async fn am_i_leader(&self) -> bool {
        self.inner.lock().await.state == ElectionState::Leader
    }

    pub async fn state(&self) -> ElectionState {
        self.inner.lock().await.state
    }

    /// Starts (or restarts) an election. Sends `Election` to every
    /// higher-numbered replica; if none answer `Ok` within
    /// `election_timeout`, this replica declares itself leader.
    pub fn start_election(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_election().await;
        });
    }

    async fn run_election(self: Arc<Self>) {
        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.state = ElectionState::Electing;
            inner.ok_received_epoch = None;
            inner.epoch
        };
        tracing::info!(my_id = self.my_id, epoch, "starting election");

        let higher: Vec<u32> = ((self.my_id + 1)..self.replicas).collect();
        if higher.is_empty() {
            self.become_leader(epoch).await;
            return;
        }
        for peer_id in higher {
            self.transport.send_election(peer_id).await;
        }

        let got_ok = tokio::time::timeout(self.election_timeout, self.wait_for_ok(epoch))
            .await
            .is_ok();
        if !got_ok {
            self.become_leader(epoch).await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.state = ElectionState::Follower;
        }
        tracing::debug!(my_id = self.my_id, "received ok, awaiting coordinator");

        let got_coordinator = tokio::time::timeout(self.coordinator_timeout, self.wait_for_coordinator(epoch))
            .await
            .is_ok();
        if !got_coordinator {
            tracing::warn!(my_id = self.my_id, "no coordinator after ok, restarting election");
            self.start_election();
        }
    }

    async fn wait_for_ok(&self, epoch: u64) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch || inner.ok_received_epoch == Some(epoch) {
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn wait_for_coordinator(&self, epoch: u64) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch || inner.current_leader.is_some() {
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn become_leader(&self, epoch: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.state = ElectionState::Leader;
            inner.current_leader = Some(self.my_id);
        }
        tracing::info!(my_id = self.my_id, "elected leader");
        self.transport.send_coordinator().await;
    }

    /// Spec §4.G: "On Election{from id<me}: respond Ok, start own election."
    pub fn handle_election(self: &Arc<Self>, from_id: u32) {
        if from_id >= self.my_id {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.transport.send_ok(from_id).await;
        });
        self.start_election();
    }

    pub async fn handle_ok(&self, _from_id: u32) {
        let mut inner = self.inner.lock().await;
        inner.ok_received_epoch = Some(inner.epoch);
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn handle_coordinator(&self, from_id: u32) {
        let mut inner = self.inner.lock().await;
        inner.current_leader = Some(from_id);
        inner.state = ElectionState::Follower;
        drop(inner);
        tracing::info!(my_id = self.my_id, leader = from_id, "new coordinator");
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingTransport {
        coordinator_sent: AtomicBool,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send_election(&self, _peer_id: u32) {}
        async fn send_ok(&self, _peer_id: u32) {}
        async fn send_coordinator(&self) {
            self.coordinator_sent.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn highest_id_with_no_peers_becomes_leader_immediately() {
        let transport = Arc::new(RecordingTransport {
            coordinator_sent: AtomicBool::new(false),
        });
        let election = BullyElection::new(
            2,
            3,
            Duration::from_millis(50),
            Duration::from_millis(50),
            transport.clone(),
        );

        election.start_election();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(election.am_i_leader().await);
        assert!(transport.coordinator_sent.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn receives_ok_then_times_out_waiting_for_coordinator_and_retries() {
        let transport = Arc::new(RecordingTransport {
            coordinator_sent: AtomicBool::new(false),
        });
        let election = BullyElection::new(
            0,
            3,
            Duration::from_millis(20),
            Duration::from_millis(20),
            transport.clone(),
        );

        election.start_election();
        tokio::time::sleep(Duration::from_millis(5)).await;
        election.handle_ok(1).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(election.state().await, ElectionState::Follower);

        // No coordinator arrives; the election restarts and this replica
        // (with no higher peers responding) eventually claims leadership.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(election.am_i_leader().await);
    }

    #[tokio::test]
    async fn coordinator_message_sets_leader() {
        let transport = Arc::new(RecordingTransport {
            coordinator_sent: AtomicBool::new(false),
        });
        let election = BullyElection::new(1, 3, Duration::from_millis(50), Duration::from_millis(50), transport);

        election.handle_coordinator(2).await;
        assert_eq!(election.get_current_leader().await, Some(2));
        assert_eq!(election.state().await, ElectionState::Follower);
    }
}
