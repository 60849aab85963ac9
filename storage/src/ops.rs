use serde::{Deserialize, Serialize};

/// One WAL entry. System ops (spec §4.C) are recorded by the runtime around
/// every batch; `Delta` carries an operator-specific mutation, generic so
/// each operator family (aggregator, merger, ...) can define its own delta
/// shape without `storage` knowing about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Op<D> {
    #[serde(rename = "__sys_msg")]
    SysMsg { msg_id: String },

    #[serde(rename = "__sys_eof")]
    SysEof { worker_id: String },

    #[serde(rename = "__sys_commit")]
    SysCommit {
        batch_id: String,
        /// The session's compaction epoch at the time this batch was
        /// committed. Lets replay tell a WAL batch already folded into the
        /// loaded snapshot (`epoch < snapshot.epoch`) apart from one that
        /// still needs applying, even if the WAL wasn't truncated after the
        /// snapshot that absorbed it was written.
        #[serde(default)]
        epoch: u64,
    },

    #[serde(rename = "delta")]
    Delta(D),
}

impl<D> Op<D> {
    pub fn is_commit(&self) -> bool {
        matches!(self, Op::SysCommit { .. })
    }

    pub fn commit_epoch(&self) -> Option<u64> {
        match self {
            Op::SysCommit { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }
}
