//! Key-value stores for session snapshots.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid store key: {0}")]
    InvalidKey(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Persists snapshot JSON under a session key.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, key: &str, json: &str) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing is stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, key: &str, json: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), json.to_string());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }
}

/// One `<key>.json` file per session inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn save(&self, key: &str, json: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        // Readers only ever see a complete file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = ?path, bytes = json.len(), "Snapshot written");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Where a snapshot ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored,
    /// The backing store failed; the snapshot is held in the fallback cache.
    CachedLocally { reason: String },
}

impl SaveOutcome {
    pub fn cached_locally(&self) -> bool {
        matches!(self, SaveOutcome::CachedLocally { .. })
    }
}

/// Bounds every call to a backing store and keeps snapshots it rejected.
///
/// One instance is shared by every session of a process, so a snapshot
/// cached by a destroyed session is still found by the next session with
/// the same id. Cached entries are newer than the store's copy and are
/// dropped once a save for the same key succeeds.
pub struct FallbackStore {
    inner: Arc<dyn SessionStore>,
    timeout: Duration,
    pending: RwLock<HashMap<String, String>>,
}

impl FallbackStore {
    pub fn new(inner: Arc<dyn SessionStore>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(inner: Arc<dyn SessionStore>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(inner, timeout))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.timeout)))
    }

    pub async fn save(&self, key: &str, json: &str) -> SaveOutcome {
        match self.bounded(self.inner.save(key, json)).await {
            Ok(()) => {
                self.pending.write().await.remove(key);
                SaveOutcome::Stored
            }
            Err(e) => {
                warn!(%key, error = %e, "Snapshot store unavailable, caching locally");
                self.pending
                    .write()
                    .await
                    .insert(key.to_string(), json.to_string());
                SaveOutcome::CachedLocally {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(json) = self.pending.read().await.get(key) {
            return Ok(Some(json.clone()));
        }
        self.bounded(self.inner.load(key)).await
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Retry cached snapshots against the backing store. Returns how many
    /// were written.
    pub async fn flush(&self) -> usize {
        let pending: Vec<(String, String)> = self
            .pending
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut written = 0;
        for (key, json) in pending {
            if self.bounded(self.inner.save(&key, &json)).await.is_err() {
                continue;
            }
            let mut cache = self.pending.write().await;
            // A newer snapshot may have been cached while this one was written.
            if cache.get(&key) == Some(&json) {
                cache.remove(&key);
            }
            written += 1;
        }
        if written > 0 {
            info!(written, "Flushed cached snapshots");
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fails every call while `down` is set.
    #[derive(Default)]
    struct FlakyStore {
        down: AtomicBool,
        inner: MemoryStore,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn save(&self, key: &str, json: &str) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("backend down")));
            }
            self.inner.save(key, json).await
        }

        async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("backend down")));
            }
            self.inner.load(key).await
        }
    }

    struct HangingStore;

    #[async_trait]
    impl SessionStore for HangingStore {
        async fn save(&self, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn load(&self, _: &str) -> Result<Option<String>, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn fallback_caches_while_store_is_down_and_flushes_later() {
        let backing = Arc::new(FlakyStore::default());
        backing.down.store(true, Ordering::SeqCst);
        let store = FallbackStore::new(backing.clone(), Duration::from_secs(1));

        assert!(store.save("k", "{\"v\":1}").await.cached_locally());
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some("{\"v\":1}"));
        assert_eq!(store.flush().await, 0);

        backing.down.store(false, Ordering::SeqCst);
        assert_eq!(store.flush().await, 1);
        assert_eq!(store.pending_len().await, 0);
        assert_eq!(backing.inner.load("k").await.unwrap().as_deref(), Some("{\"v\":1}"));
    }

    #[tokio::test]
    async fn successful_save_clears_cached_copy() {
        let backing = Arc::new(FlakyStore::default());
        let store = FallbackStore::new(backing.clone(), Duration::from_secs(1));
        backing.down.store(true, Ordering::SeqCst);
        store.save("k", "old").await;
        backing.down.store(false, Ordering::SeqCst);
        assert_eq!(store.save("k", "new").await, SaveOutcome::Stored);
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn hanging_store_times_out() {
        let store = FallbackStore::new(Arc::new(HangingStore), Duration::from_millis(20));
        assert!(store.save("k", "{}").await.cached_locally());
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some("{}"));
        assert!(matches!(
            store.load("other").await,
            Err(StoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert_eq!(store.load("k").await.unwrap(), None);
        store.save("k", "{}").await.unwrap();
        assert_eq!(store.load("k").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn file_store_creates_directory_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("snapshots"));
        assert_eq!(store.load("lab_state_a").await.unwrap(), None);
        store.save("lab_state_a", "{\"v\":1}").await.unwrap();
        store.save("lab_state_a", "{\"v\":2}").await.unwrap();
        assert_eq!(
            store.load("lab_state_a").await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.save("../escape", "{}").await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
