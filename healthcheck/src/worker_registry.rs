use std::collections::HashMap;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::HealthCheckError;

/// Tracks last-seen timestamps for worker containers, fsynced to disk so a
/// restarted health-checker does not forget about workers it can no longer
/// see heartbeats for until the next one arrives (spec §4.G durability).
pub struct WorkerRegistry {
    path: PathBuf,
    workers: Mutex<HashMap<String, u64>>,
}

impl WorkerRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the persisted registry, if any. A missing file just means a
    /// fresh fleet; it is not an error.
    pub async fn load(&self) -> Result<(), HealthCheckError> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let loaded: HashMap<String, u64> = serde_json::from_slice(&bytes)?;
        *self.workers.lock().await = loaded;
        Ok(())
    }

    /// Records a heartbeat. Returns `true` the first time this container is
    /// seen, so the caller can log a `worker_registered` event.
    pub async fn update(&self, container_name: impl Into<String>, now_ms: u64) -> bool {
        let name = container_name.into();
        let mut guard = self.workers.lock().await;
        let is_new = !guard.contains_key(&name);
        guard.insert(name, now_ms);
        is_new
    }

    pub async fn get_dead(&self, timeout_ms: u64, now_ms: u64) -> Vec<String> {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|&(_, &last_seen)| now_ms.saturating_sub(last_seen) > timeout_ms)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn all(&self) -> Vec<(String, u64)> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|(name, ts)| (name.clone(), *ts))
            .collect()
    }

    /// Atomically (write-temp + fsync + rename) persists the registry so a
    /// crash mid-write never leaves a truncated file behind.
    pub async fn persist(&self) -> Result<(), HealthCheckError> {
        let snapshot = self.workers.lock().await.clone();
        let bytes = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_reports_first_sighting_and_persists_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = WorkerRegistry::new(&path);

        assert!(registry.update("worker_filter_0", 1_000).await);
        assert!(!registry.update("worker_filter_0", 2_000).await);

        registry.persist().await.unwrap();

        let reloaded = WorkerRegistry::new(&path);
        reloaded.load().await.unwrap();
        let all = reloaded.all().await;
        assert_eq!(all, vec![("worker_filter_0".to_string(), 2_000)]);
    }

    #[tokio::test]
    async fn get_dead_filters_by_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("registry.json"));
        registry.update("fresh", 9_000).await;
        registry.update("stale", 0).await;

        let dead = registry.get_dead(1_000, 10_000).await;
        assert_eq!(dead, vec!["stale".to_string()]);
    }
}
