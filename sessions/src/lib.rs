use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use storage::{Session, StorageError, WalStore};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Owns the in-memory live set of sessions for one (stage, replica) and
/// delegates durability to a `WalStore` (spec §4.D).
///
/// `SessionManager` intentionally knows nothing about operator semantics —
/// `start_of_session`/`end_of_session` hooks are the caller's (runtime's)
/// responsibility; this type only answers "is this session new?" and "is
/// this session flushable?".
pub struct SessionManager<S, D> {
    store: WalStore<S, D>,
    sessions: Mutex<HashMap<Uuid, Session<S, D>>>,
}

impl<S, D> SessionManager<S, D>
where
    S: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    D: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Constructs a manager and rehydrates every session the store has
    /// durable state for (spec §4.D `load_sessions`, run before consuming).
    pub async fn new(store: WalStore<S, D>) -> Result<Self, StorageError> {
        let manager = Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        };
        manager.load_sessions().await?;
        Ok(manager)
    }

    pub async fn load_sessions(&self) -> Result<(), StorageError> {
        let all = self.store.load_all().await?;
        let mut guard = self.sessions.lock().await;
        for session in all {
            guard.insert(session.session_id, session);
        }
        Ok(())
    }

    /// Creates the session if this is the first message seen for it.
    /// Returns `true` when a new session was created, so the caller knows
    /// to invoke the operator's `start_of_session` hook.
    pub async fn get_or_initialize(&self, session_id: Uuid) -> bool {
        let mut guard = self.sessions.lock().await;
        if guard.contains_key(&session_id) {
            false
        } else {
            guard.insert(session_id, Session::new(session_id));
            true
        }
    }

    /// Runs `f` against the live session, if present. Used for dedup
    /// checks, recording ops, and mutating the operator accumulator.
    pub async fn with_session<R>(
        &self,
        session_id: Uuid,
        f: impl FnOnce(&mut Session<S, D>) -> R,
    ) -> Option<R> {
        let mut guard = self.sessions.lock().await;
        guard.get_mut(&session_id).map(f)
    }

    /// Folds `delta` into the session's live accumulator immediately (so
    /// later entities in the same batch observe it) and queues it for the
    /// next `commit`. Splitting this from `with_session` keeps the reducer
    /// call out of `storage`, which has no operator-specific fold logic of
    /// its own.
    pub async fn apply_delta(&self, session_id: Uuid, delta: D) {
        let mut guard = self.sessions.lock().await;
        if let Some(session) = guard.get_mut(&session_id) {
            self.store.reduce(&mut session.storage, &delta);
            session.record_delta(delta);
        }
    }

    /// Appends the session's pending ops plus a commit marker to its WAL
    /// (spec §4.C write protocol step 2), fsyncing before the caller acks
    /// the upstream message.
    pub async fn commit(&self, session_id: Uuid, batch_id: Uuid) -> Result<(), StorageError> {
        let mut guard = self.sessions.lock().await;
        if let Some(session) = guard.get_mut(&session_id) {
            self.store.commit_batch(session, batch_id).await?;
        }
        Ok(())
    }

    /// If `session_id`'s `eof_collected` set now satisfies `required`
    /// (spec §3 invariant 3 / §4.D flushability predicate), removes it
    /// from the live set and deletes its durable state, returning the
    /// final session for the caller to run `end_of_session` against.
    ///
    /// Returning the session *before* deleting nothing more is written to
    /// it — the caller's `end_of_session` must not mutate and expect it to
    /// persist.
    pub async fn try_to_flush(
        &self,
        session_id: Uuid,
        required: usize,
    ) -> Result<Option<Session<S, D>>, StorageError> {
        let removed = {
            let mut guard = self.sessions.lock().await;
            match guard.get(&session_id) {
                Some(session) if session.is_flushable(required) => guard.remove(&session_id),
                _ => None,
            }
        };

        if let Some(session) = removed {
            self.store.delete(session_id).await?;
            tracing::info!(session_id = %session_id, "session flushed and storage removed");
            Ok(Some(session))
        } else {
            Ok(None)
        }
    }

    /// Persists every still-active session. Used on graceful shutdown
    /// (spec §4.D, §5 cancellation) so in-flight progress survives a
    /// restart.
    pub async fn save_sessions(&self) -> Result<(), StorageError> {
        let mut guard = self.sessions.lock().await;
        for session in guard.values_mut() {
            self.store.commit_batch(session, Uuid::new_v4()).await?;
        }
        Ok(())
    }

    pub async fn active_session_ids(&self) -> Vec<Uuid> {
        self.sessions.lock().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Acc {
        n: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Inc;

    fn reduce(s: &mut Acc, _d: &Inc) {
        s.n += 1;
    }

    #[tokio::test]
    async fn session_created_once_and_flushes_after_required_eofs() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalStore::<Acc, Inc>::new(dir.path(), 100, reduce).await.unwrap();
        let manager = SessionManager::new(store).await.unwrap();

        let sid = Uuid::new_v4();
        assert!(manager.get_or_initialize(sid).await);
        assert!(!manager.get_or_initialize(sid).await);

        manager.apply_delta(sid, Inc).await;
        manager.commit(sid, Uuid::new_v4()).await.unwrap();

        assert!(manager.try_to_flush(sid, 2).await.unwrap().is_none());

        manager.with_session(sid, |s| s.record_eof("w0")).await;
        manager.with_session(sid, |s| s.record_eof("w1")).await;
        manager.commit(sid, Uuid::new_v4()).await.unwrap();

        let flushed = manager.try_to_flush(sid, 2).await.unwrap().unwrap();
        assert_eq!(flushed.storage.n, 1);
        assert!(manager.active_session_ids().await.is_empty());
    }
}
