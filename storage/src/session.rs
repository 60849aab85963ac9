use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ops::Op;

/// Per-(stage replica, session_id) durable state (spec §3). `S` is the
/// operator's accumulator type (e.g. the running per-period item totals);
/// `D` is the operator's WAL delta type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize, D: Serialize",
    deserialize = "S: Deserialize<'de>, D: Deserialize<'de>"
))]
pub struct Session<S, D> {
    pub session_id: Uuid,
    pub eof_collected: HashSet<String>,
    pub msgs_received: HashSet<Uuid>,
    pub storage: S,

    /// Compaction generation, bumped each time `WalStore::compact` writes a
    /// new snapshot. Persisted as part of the snapshot so replay can fence
    /// out WAL batches the snapshot already absorbed.
    #[serde(default)]
    pub epoch: u64,

    /// Ops applied since the last WAL flush; never part of a snapshot.
    #[serde(skip)]
    pub pending_ops: Vec<Op<D>>,
}

impl<S: Default, D> Session<S, D> {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            eof_collected: HashSet::new(),
            msgs_received: HashSet::new(),
            storage: S::default(),
            epoch: 0,
            pending_ops: Vec::new(),
        }
    }
}

impl<S, D> Session<S, D> {
    /// Spec §3 invariant 2: dedup is checked before the operator ever sees
    /// a message.
    pub fn is_duplicate(&self, msg_id: Uuid) -> bool {
        self.msgs_received.contains(&msg_id)
    }

    pub fn record_msg(&mut self, msg_id: Uuid) {
        self.msgs_received.insert(msg_id);
        self.pending_ops.push(Op::SysMsg {
            msg_id: msg_id.simple().to_string(),
        });
    }

    pub fn record_eof(&mut self, worker_id: &str) {
        self.eof_collected.insert(worker_id.to_string());
        self.pending_ops.push(Op::SysEof {
            worker_id: worker_id.to_string(),
        });
    }

    pub fn record_delta(&mut self, delta: D) {
        self.pending_ops.push(Op::Delta(delta));
    }

    /// Flushable when `eof_collected` covers every expected upstream:
    /// `instance_count` for the leader replica (spec §4.D), 1 for a
    /// follower relaying its own fan-in marker onward.
    pub fn is_flushable(&self, required: usize) -> bool {
        self.eof_collected.len() >= required.max(1)
    }

    /// Applies a single op's effect on in-memory state. System ops mutate
    /// `eof_collected`/`msgs_received` directly; deltas go through the
    /// operator-provided reducer. Used both live (runtime) and during WAL
    /// replay (storage).
    pub fn apply(&mut self, op: &Op<D>, reduce: &(impl Fn(&mut S, &D) + ?Sized)) {
        match op {
            Op::SysMsg { msg_id } => {
                if let Ok(id) = Uuid::parse_str(msg_id) {
                    self.msgs_received.insert(id);
                }
            }
            Op::SysEof { worker_id } => {
                self.eof_collected.insert(worker_id.clone());
            }
            Op::SysCommit { .. } => {}
            Op::Delta(d) => reduce(&mut self.storage, d),
        }
    }
}
