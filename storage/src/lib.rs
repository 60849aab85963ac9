pub mod ops;
pub mod session;
pub mod wal;

use thiserror::Error;

pub use ops::Op;
pub use session::Session;
pub use wal::WalStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        total: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Add(u64);

    fn reduce(s: &mut Counter, d: &Add) {
        s.total += d.0;
    }

    #[tokio::test]
    async fn commit_then_reload_reconstructs_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Counter, Add>::new(dir.path(), 100, reduce)
            .await
            .unwrap();

        let session_id = Uuid::new_v4();
        let mut session = Session::new(session_id);
        session.record_msg(Uuid::new_v4());
        session.record_delta(Add(3));
        session.record_delta(Add(4));
        store.commit_batch(&mut session, Uuid::new_v4()).await.unwrap();

        let reloaded = store.load(session_id).await.unwrap();
        assert_eq!(reloaded.storage.total, 7);
        assert_eq!(reloaded.msgs_received.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_of_same_message_id_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Counter, Add>::new(dir.path(), 100, reduce)
            .await
            .unwrap();
        let session_id = Uuid::new_v4();
        let msg_id = Uuid::new_v4();

        let mut session = Session::new(session_id);
        session.record_msg(msg_id);
        session.record_delta(Add(5));
        store.commit_batch(&mut session, Uuid::new_v4()).await.unwrap();

        let mut reloaded = store.load(session_id).await.unwrap();
        assert!(reloaded.is_duplicate(msg_id));
        // Runtime would skip re-applying the operator here; nothing to commit.
        assert_eq!(reloaded.storage.total, 5);
        store.commit_batch(&mut reloaded, Uuid::new_v4()).await.unwrap();

        let again = store.load(session_id).await.unwrap();
        assert_eq!(again.storage.total, 5);
    }

    #[tokio::test]
    async fn trailing_uncommitted_batch_is_discarded_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Counter, Add>::new(dir.path(), 100, reduce)
            .await
            .unwrap();
        let session_id = Uuid::new_v4();

        let mut session = Session::new(session_id);
        session.record_delta(Add(10));
        store.commit_batch(&mut session, Uuid::new_v4()).await.unwrap();

        // Simulate a crash mid-batch: ops applied in memory and appended to
        // the WAL, but no trailing __sys_commit marker was ever written.
        let wal_path = dir.path().join(format!("{}.wal", session_id.simple()));
        let uncommitted = serde_json::to_string(&Op::Delta(Add(999))).unwrap();
        tokio::fs::write(
            &wal_path,
            format!(
                "{}\n",
                [
                    tokio::fs::read_to_string(&wal_path).await.unwrap(),
                    uncommitted,
                ]
                .join("")
            ),
        )
        .await
        .unwrap();

        let recovered = store.load(session_id).await.unwrap();
        assert_eq!(recovered.storage.total, 10);
    }

    #[tokio::test]
    async fn compaction_preserves_equivalent_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Counter, Add>::new(dir.path(), 2, reduce)
            .await
            .unwrap();
        let session_id = Uuid::new_v4();

        let mut session = Session::new(session_id);
        for _ in 0..2 {
            session.record_delta(Add(1));
            store.commit_batch(&mut session, Uuid::new_v4()).await.unwrap();
        }

        // Second commit crossed snapshot_threshold=2, so the WAL should be
        // truncated and a snapshot should now exist.
        let wal_path = dir.path().join(format!("{}.wal", session_id.simple()));
        let wal_len = tokio::fs::metadata(&wal_path).await.unwrap().len();
        assert_eq!(wal_len, 0);

        let reloaded = store.load(session_id).await.unwrap();
        assert_eq!(reloaded.storage.total, 2);
    }

    #[tokio::test]
    async fn compaction_survives_a_crash_before_wal_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Counter, Add>::new(dir.path(), 1, reduce)
            .await
            .unwrap();
        let session_id = Uuid::new_v4();

        let mut session = Session::new(session_id);
        session.record_delta(Add(5));
        // snapshot_threshold=1, so this commit also compacts: the snapshot
        // now holds total=5 at epoch 1, and the WAL was truncated.
        store.commit_batch(&mut session, Uuid::new_v4()).await.unwrap();

        // Simulate a crash between the snapshot rename and the WAL
        // truncation: the pre-compaction batch (epoch 0) is still sitting
        // in the WAL alongside the snapshot that already absorbed it.
        let wal_path = dir.path().join(format!("{}.wal", session_id.simple()));
        let stale_batch = format!(
            "{}\n{}\n",
            serde_json::to_string(&Op::Delta(Add(5))).unwrap(),
            serde_json::to_string(&Op::<Add>::SysCommit {
                batch_id: Uuid::new_v4().simple().to_string(),
                epoch: 0,
            })
            .unwrap()
        );
        tokio::fs::write(&wal_path, stale_batch).await.unwrap();

        let recovered = store.load(session_id).await.unwrap();
        assert_eq!(recovered.storage.total, 5, "stale pre-compaction batch must not be re-applied");
    }

    #[tokio::test]
    async fn delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Counter, Add>::new(dir.path(), 100, reduce)
            .await
            .unwrap();
        let session_id = Uuid::new_v4();
        let mut session = Session::new(session_id);
        session.record_delta(Add(1));
        store.commit_batch(&mut session, Uuid::new_v4()).await.unwrap();
        store.compact(&mut session).await.unwrap();

        store.delete(session_id).await.unwrap();

        assert!(!dir.path().join(format!("{}.snapshot.json", session_id.simple())).exists());
        assert!(!dir.path().join(format!("{}.wal", session_id.simple())).exists());
    }
}
