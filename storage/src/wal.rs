use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StorageError;
use crate::ops::Op;
use crate::session::Session;

/// Write-ahead-logged, snapshot-compacted session storage (spec §4.C).
///
/// File layout per session, under `dir`:
///   `<session_id>.snapshot.json` — full state as of the last compaction.
///   `<session_id>.wal`           — JSON-Lines ops appended since then.
///
/// `reduce` is the operator's fold function, applied both live and on
/// WAL replay so the two paths can never diverge.
pub struct WalStore<S, D> {
    dir: PathBuf,
    reduce: Arc<dyn Fn(&mut S, &D) + Send + Sync>,
    snapshot_threshold: usize,
    batches_since_snapshot: Mutex<HashMap<Uuid, usize>>,
}

impl<S, D> WalStore<S, D>
where
    S: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    D: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn new(
        dir: impl Into<PathBuf>,
        snapshot_threshold: usize,
        reduce: impl Fn(&mut S, &D) + Send + Sync + 'static,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            reduce: Arc::new(reduce),
            snapshot_threshold: snapshot_threshold.max(1),
            batches_since_snapshot: Mutex::new(HashMap::new()),
        })
    }

    fn snapshot_path(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.snapshot.json", session_id.simple()))
    }

    fn wal_path(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.wal", session_id.simple()))
    }

    fn tmp_snapshot_path(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.snapshot.json.tmp", session_id.simple()))
    }

    /// Loads a session: empty state if neither file exists, otherwise
    /// `snapshot ⊕ replay(WAL)` (spec §3 invariant 4).
    pub async fn load(&self, session_id: Uuid) -> Result<Session<S, D>, StorageError> {
        let mut session = match fs::read(self.snapshot_path(session_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Session::new(session_id),
            Err(e) => return Err(e.into()),
        };

        self.replay_wal(&mut session).await?;
        Ok(session)
    }

    async fn replay_wal(&self, session: &mut Session<S, D>) -> Result<(), StorageError> {
        let path = self.wal_path(session.session_id);
        let text = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // A crash between the snapshot rename and the WAL truncation in
        // `compact` can leave batches on disk that the loaded snapshot
        // already reflects. Those batches' `__sys_commit` markers were
        // stamped with the epoch in effect when they were written, which is
        // always strictly less than the snapshot's own epoch, so skipping
        // anything below it reapplies exactly the ops the snapshot is
        // missing and nothing more.
        let snapshot_epoch = session.epoch;

        let mut pending_batch: Vec<Op<D>> = Vec::new();
        let mut applied = 0usize;
        let mut skipped = 0usize;

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Op<D>>(line) {
                Ok(op) => {
                    let commit_epoch = op.commit_epoch();
                    pending_batch.push(op);
                    if let Some(epoch) = commit_epoch {
                        if epoch < snapshot_epoch {
                            tracing::debug!(
                                session_id = %session.session_id,
                                epoch,
                                snapshot_epoch,
                                ops = pending_batch.len(),
                                "skipping WAL batch already folded into snapshot"
                            );
                            pending_batch.clear();
                        } else {
                            for op in pending_batch.drain(..) {
                                session.apply(&op, self.reduce.as_ref());
                                applied += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        line = line_no + 1,
                        session_id = %session.session_id,
                        error = %e,
                        "skipping corrupt WAL line"
                    );
                    skipped += 1;
                }
            }
        }

        if !pending_batch.is_empty() {
            tracing::warn!(
                session_id = %session.session_id,
                uncommitted_ops = pending_batch.len(),
                "discarding trailing uncommitted WAL batch"
            );
        }

        if skipped > 0 {
            tracing::warn!(
                session_id = %session.session_id,
                ops_applied = applied,
                ops_skipped = skipped,
                "WAL replay completed with errors"
            );
        }

        session.pending_ops.clear();
        Ok(())
    }

    /// Enumerates every session with on-disk state and loads each.
    pub async fn load_all(&self) -> Result<Vec<Session<S, D>>, StorageError> {
        let mut ids: HashSet<Uuid> = HashSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stem = name
                .strip_suffix(".snapshot.json")
                .or_else(|| name.strip_suffix(".wal"));
            if let Some(stem) = stem {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.insert(id);
                }
            }
        }

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id).await {
                Ok(s) => sessions.push(s),
                Err(e) => tracing::error!(session_id = %id, error = %e, "failed to recover session"),
            }
        }
        Ok(sessions)
    }

    /// Appends `session.pending_ops` plus a trailing commit marker, fsyncs,
    /// then clears the in-memory pending list (spec §4.C write protocol).
    /// A no-op if there is nothing pending, so callers can call this
    /// unconditionally after every processed batch.
    pub async fn commit_batch(
        &self,
        session: &mut Session<S, D>,
        batch_id: Uuid,
    ) -> Result<(), StorageError> {
        if session.pending_ops.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for op in &session.pending_ops {
            buf.push_str(&serde_json::to_string(op)?);
            buf.push('\n');
        }
        let commit: Op<D> = Op::SysCommit {
            batch_id: batch_id.simple().to_string(),
            epoch: session.epoch,
        };
        buf.push_str(&serde_json::to_string(&commit)?);
        buf.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.wal_path(session.session_id))
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;

        session.pending_ops.clear();

        let should_compact = {
            let mut counts = self.batches_since_snapshot.lock().await;
            let count = counts.entry(session.session_id).or_insert(0);
            *count += 1;
            *count >= self.snapshot_threshold
        };

        if should_compact {
            self.compact(session).await?;
        }

        Ok(())
    }

    /// Serializes current state to a new snapshot (atomic write-temp +
    /// fsync + rename) and truncates the WAL (spec §4.C compaction).
    ///
    /// The epoch bump happens before the snapshot is serialized, so it is
    /// part of the same atomic rename as the state it fences: a crash after
    /// the rename but before the WAL truncation below leaves stale
    /// already-compacted batches on disk, but their `__sys_commit` markers
    /// carry the pre-bump epoch, so `replay_wal` skips them instead of
    /// re-applying them on top of a snapshot that already has their effect.
    pub async fn compact(&self, session: &mut Session<S, D>) -> Result<(), StorageError> {
        session.epoch += 1;

        let tmp_path = self.tmp_snapshot_path(session.session_id);
        let bytes = serde_json::to_vec(&*session)?;

        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, self.snapshot_path(session.session_id)).await?;

        let wal = fs::File::create(self.wal_path(session.session_id)).await?;
        wal.sync_all().await?;

        self.batches_since_snapshot
            .lock()
            .await
            .insert(session.session_id, 0);

        Ok(())
    }

    /// Removes both files for a session (spec §3 invariant: nothing remains
    /// on disk for a flushed session) and forgets its batch counter.
    pub async fn delete(&self, session_id: Uuid) -> Result<(), StorageError> {
        for path in [self.snapshot_path(session_id), self.wal_path(session_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.batches_since_snapshot.lock().await.remove(&session_id);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Applies the operator's fold function directly, for callers that need
    /// to update live in-memory state immediately rather than waiting for a
    /// reload to replay the WAL.
    pub fn reduce(&self, storage: &mut S, delta: &D) {
        (self.reduce)(storage, delta)
    }
}
