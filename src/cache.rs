//! Two-tier TTL cache.
//!
//! The fast layer is an in-process moka cache. Every write is mirrored,
//! best effort, to a [`DurableStore`] so a restarted process can rehydrate
//! entries that have not expired yet. Reads never fail: a missing, expired,
//! corrupt or undeserializable entry is simply a miss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::cache_validator::{key_digest, ValidatedCacheEntry};
use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            data,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Durable backing store. Values are opaque strings owned by the cache manager.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set(&self, key: &str, value: String) -> Result<(), AppError>;
    async fn remove(&self, key: &str) -> Result<(), AppError>;
    async fn clear(&self) -> Result<(), AppError>;
    async fn entries(&self) -> Result<Vec<(String, String)>, AppError>;
}

/// Process-local store, mostly for tests and single-run tools.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), AppError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), AppError> {
        self.values.write().await.clear();
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>, AppError> {
        Ok(self
            .values
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Session directory with one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    value: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key_digest(key)))
    }

    async fn read_record(path: &std::path::Path) -> Result<Option<FileRecord>, AppError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let record = Self::read_record(&self.path_for(key)).await?;
        Ok(record.filter(|r| r.key == key).map(|r| r.value))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::Storage(format!("failed to create cache dir: {}", e)))?;

        let record = serde_json::to_string(&FileRecord {
            key: key.to_string(),
            value,
        })
        .map_err(|e| AppError::Storage(e.to_string()))?;

        // Unique per writer so concurrent sets of one key never share a temp file.
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, record)
            .await
            .map_err(|e| AppError::Storage(format!("failed to write cache file: {}", e)))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::Storage(format!("failed to move cache file: {}", e)));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("failed to remove cache file: {}", e))),
        }
    }

    async fn clear(&self) -> Result<(), AppError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("failed to clear cache dir: {}", e))),
        }
    }

    async fn entries(&self) -> Result<Vec<(String, String)>, AppError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Storage(format!("failed to list cache dir: {}", e))),
        };

        let mut entries = Vec::new();
        while let Some(file) = dir
            .next_entry()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?
        {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                entries.push((record.key, record.value));
            }
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_capacity: u64,
    /// Upper bound on how long the fast layer keeps anything, whatever the entry TTL.
    pub max_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            max_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct CacheManager {
    fast: Cache<String, CacheEntry<Value>>,
    durable: Arc<dyn DurableStore>,
    /// Serializes mutations so an expiry sweep can never drop a newer write.
    writes: Mutex<()>,
    /// Durable entries created at or before this instant were cleared and are never served.
    cleared_at: std::sync::RwLock<DateTime<Utc>>,
}

impl CacheManager {
    pub fn new(durable: Arc<dyn DurableStore>, settings: CacheSettings) -> Self {
        let fast = Cache::builder()
            .max_capacity(settings.max_capacity)
            .time_to_live(settings.max_ttl)
            .build();
        Self {
            fast,
            durable,
            writes: Mutex::new(()),
            cleared_at: std::sync::RwLock::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Cache backed by a [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), CacheSettings::default())
    }

    /// Returns the cached value if present and unexpired.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = match self.fast.get(key).await {
            Some(entry) => entry,
            None => self.load_durable(key).await?,
        };

        if entry.is_expired() {
            tracing::debug!(key, "Cache entry expired");
            self.expire(key, &entry).await;
            return None;
        }

        match serde_json::from_value(entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, "Cached value has unexpected shape, ignoring: {}", e);
                None
            }
        }
    }

    /// Writes the fast layer and mirrors to the durable layer. Durable failures are logged only.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(key, "Value is not cacheable: {}", e);
                return;
            }
        };

        let _guard = self.writes.lock().await;
        let entry = CacheEntry::new(data, ttl);
        self.fast.insert(key.to_string(), entry.clone()).await;
        self.mirror(key, &entry).await;
    }

    pub async fn remove(&self, key: &str) {
        let _guard = self.writes.lock().await;
        self.fast.invalidate(key).await;
        if let Err(e) = self.durable.remove(key).await {
            tracing::warn!(key, "Failed to remove durable cache entry: {}", e);
        }
    }

    /// Drops every entry from both layers.
    ///
    /// If the durable store cannot be cleared, its keys are removed one by one, and
    /// anything that still survives is older than the clear and will not be served.
    pub async fn clear(&self) {
        let _guard = self.writes.lock().await;
        *self
            .cleared_at
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Utc::now();
        self.fast.invalidate_all();

        if let Err(e) = self.durable.clear().await {
            tracing::warn!("Failed to clear durable cache, removing keys individually: {}", e);
            match self.durable.entries().await {
                Ok(entries) => {
                    for (key, _) in entries {
                        if let Err(e) = self.durable.remove(&key).await {
                            tracing::warn!(key, "Failed to remove durable cache entry: {}", e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to list durable cache: {}", e),
            }
        }
        tracing::info!("Cache cleared");
    }

    /// Loads every unexpired durable entry into the fast layer. Returns how many were restored.
    pub async fn rehydrate(&self) -> usize {
        let entries = match self.durable.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Durable cache unavailable, starting cold: {}", e);
                return 0;
            }
        };

        let mut restored = 0;
        for (key, raw) in entries {
            match Self::decode(&raw) {
                Some(entry) if !entry.is_expired() && !self.predates_clear(&entry) => {
                    self.fast.insert(key, entry).await;
                    restored += 1;
                }
                _ => {
                    if let Err(e) = self.durable.remove(&key).await {
                        tracing::warn!(key, "Failed to drop stale durable entry: {}", e);
                    }
                }
            }
        }

        tracing::info!(restored, "Cache rehydrated from durable store");
        restored
    }

    async fn mirror(&self, key: &str, entry: &CacheEntry<Value>) {
        let serialized = match serde_json::to_string(entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::warn!(key, "Failed to serialize cache entry: {}", e);
                return;
            }
        };

        let envelope = ValidatedCacheEntry::new(serialized).serialize();
        if let Err(e) = self.durable.set(key, envelope).await {
            tracing::warn!(key, "Durable cache write failed: {}", e);
        }
    }

    async fn load_durable(&self, key: &str) -> Option<CacheEntry<Value>> {
        let raw = match self.durable.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(key, "Cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(key, "Durable cache read failed: {}", e);
                return None;
            }
        };

        let Some(entry) = Self::decode(&raw) else {
            self.drop_corrupt(key, &raw).await;
            return None;
        };

        if self.predates_clear(&entry) {
            tracing::debug!(key, "Ignoring durable entry written before the last clear");
            return None;
        }

        if entry.is_expired() {
            return Some(entry);
        }

        // A concurrent set may already have filled the fast layer; keep the newer value.
        tracing::debug!(key, "Rehydrated cache entry from durable store");
        let current = self
            .fast
            .entry(key.to_string())
            .or_insert(entry)
            .await
            .into_value();
        Some(current)
    }

    /// Drops `stale` from both layers, but only where it is still the stored entry.
    async fn expire(&self, key: &str, stale: &CacheEntry<Value>) {
        let _guard = self.writes.lock().await;

        if let Some(current) = self.fast.get(key).await {
            if current.created_at != stale.created_at {
                return;
            }
            self.fast.invalidate(key).await;
        }

        let durable_is_stale = match self.durable.get(key).await {
            Ok(Some(raw)) => Self::decode(&raw)
                .map(|current| current.created_at == stale.created_at)
                .unwrap_or(true),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(key, "Durable cache read failed during expiry: {}", e);
                false
            }
        };
        if durable_is_stale {
            if let Err(e) = self.durable.remove(key).await {
                tracing::warn!(key, "Failed to remove expired durable entry: {}", e);
            }
        }
    }

    async fn drop_corrupt(&self, key: &str, raw: &str) {
        let _guard = self.writes.lock().await;
        if let Ok(Some(current)) = self.durable.get(key).await {
            if current != raw {
                return;
            }
        }
        if let Err(e) = self.durable.remove(key).await {
            tracing::warn!(key, "Failed to drop corrupt durable entry: {}", e);
        }
    }

    fn predates_clear(&self, entry: &CacheEntry<Value>) -> bool {
        let cleared_at = *self
            .cleared_at
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entry.created_at <= cleared_at
    }

    fn decode(raw: &str) -> Option<CacheEntry<Value>> {
        let data = ValidatedCacheEntry::deserialize_and_validate(raw)?;
        serde_json::from_str(&data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Durable store whose writes always fail.
    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
            Err(AppError::Storage("disk gone".into()))
        }
        async fn set(&self, _key: &str, _value: String) -> Result<(), AppError> {
            Err(AppError::Storage("disk gone".into()))
        }
        async fn remove(&self, _key: &str) -> Result<(), AppError> {
            Err(AppError::Storage("disk gone".into()))
        }
        async fn clear(&self) -> Result<(), AppError> {
            Err(AppError::Storage("disk gone".into()))
        }
        async fn entries(&self) -> Result<Vec<(String, String)>, AppError> {
            Err(AppError::Storage("disk gone".into()))
        }
    }

    /// Memory store with slow reads, to widen the window between a read and its follow-up.
    struct SlowReadStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl DurableStore for SlowReadStore {
        async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
            let value = self.inner.get(key).await;
            tokio::time::sleep(self.delay).await;
            value
        }
        async fn set(&self, key: &str, value: String) -> Result<(), AppError> {
            self.inner.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<(), AppError> {
            self.inner.remove(key).await
        }
        async fn clear(&self) -> Result<(), AppError> {
            self.inner.clear().await
        }
        async fn entries(&self) -> Result<Vec<(String, String)>, AppError> {
            self.inner.entries().await
        }
    }

    /// Memory store that reads fine but can neither clear nor delete.
    #[derive(Default)]
    struct StickyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DurableStore for StickyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> Result<(), AppError> {
            self.inner.set(key, value).await
        }
        async fn remove(&self, _key: &str) -> Result<(), AppError> {
            Err(AppError::Storage("read-only volume".into()))
        }
        async fn clear(&self) -> Result<(), AppError> {
            Err(AppError::Storage("read-only volume".into()))
        }
        async fn entries(&self) -> Result<Vec<(String, String)>, AppError> {
            self.inner.entries().await
        }
    }

    #[tokio::test]
    async fn test_get_after_set_then_expiry() {
        let cache = CacheManager::in_memory();
        cache.set("k", &json!({"v": 1}), Duration::from_millis(100)).await;

        assert_eq!(cache.get::<Value>("k").await, Some(json!({"v": 1})));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let cache = CacheManager::in_memory();
        assert_eq!(cache.get::<String>("absent").await, None);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = CacheManager::in_memory();
        cache.set("k", &"first", Duration::from_secs(60)).await;
        cache.set("k", &"second", Duration::from_secs(60)).await;

        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_durable_failures_are_swallowed() {
        let cache = CacheManager::new(Arc::new(BrokenStore), CacheSettings::default());
        cache.set("k", &42u32, Duration::from_secs(60)).await;

        assert_eq!(cache.get::<u32>("k").await, Some(42));
        cache.clear().await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn test_clear_holds_when_durable_store_cannot_delete() {
        let store = Arc::new(StickyStore::default());
        let cache = CacheManager::new(store.clone(), CacheSettings::default());
        cache
            .set("campaigns:enriched", &"pre-write data", Duration::from_secs(60))
            .await;

        cache.clear().await;

        assert!(store.get("campaigns:enriched").await.unwrap().is_some());
        assert_eq!(cache.get::<String>("campaigns:enriched").await, None);

        cache
            .set("campaigns:enriched", &"post-write data", Duration::from_secs(60))
            .await;
        assert_eq!(
            cache.get::<String>("campaigns:enriched").await.as_deref(),
            Some("post-write data")
        );
    }

    #[tokio::test]
    async fn test_clear_falls_back_to_per_key_removal() {
        struct NoBulkClear(MemoryStore);

        #[async_trait]
        impl DurableStore for NoBulkClear {
            async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
                self.0.get(key).await
            }
            async fn set(&self, key: &str, value: String) -> Result<(), AppError> {
                self.0.set(key, value).await
            }
            async fn remove(&self, key: &str) -> Result<(), AppError> {
                self.0.remove(key).await
            }
            async fn clear(&self) -> Result<(), AppError> {
                Err(AppError::Storage("bulk delete unsupported".into()))
            }
            async fn entries(&self) -> Result<Vec<(String, String)>, AppError> {
                self.0.entries().await
            }
        }

        let store = Arc::new(NoBulkClear(MemoryStore::new()));
        let cache = CacheManager::new(store.clone(), CacheSettings::default());
        cache.set("a", &1, Duration::from_secs(60)).await;
        cache.set("b", &2, Duration::from_secs(60)).await;

        cache.clear().await;

        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_read_does_not_drop_concurrent_write() {
        let inner = MemoryStore::new();
        let stale = CacheEntry::new(json!("stale"), Duration::from_millis(1));
        let envelope =
            ValidatedCacheEntry::new(serde_json::to_string(&stale).unwrap()).serialize();
        inner.set("k", envelope).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cache = Arc::new(CacheManager::new(
            Arc::new(SlowReadStore {
                inner,
                delay: Duration::from_millis(100),
            }),
            CacheSettings::default(),
        ));

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get::<String>("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set("k", &"fresh", Duration::from_secs(60)).await;

        assert_eq!(reader.await.unwrap(), None);
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_rehydrates_unexpired_entries_only() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());

        let first = CacheManager::new(store.clone(), CacheSettings::default());
        first.set("fresh", &"kept", Duration::from_secs(60)).await;
        first.set("stale", &"dropped", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let restarted = CacheManager::new(store.clone(), CacheSettings::default());
        assert_eq!(restarted.rehydrate().await, 1);
        assert_eq!(restarted.get::<String>("fresh").await.as_deref(), Some("kept"));
        assert_eq!(restarted.get::<String>("stale").await, None);
        assert!(store.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_durable_entry_is_a_miss() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let cache = CacheManager::new(store.clone(), CacheSettings::default());
        cache.set("k", &"original", Duration::from_secs(60)).await;

        let raw = store.get("k").await.unwrap().unwrap();
        store
            .set("k", raw.replace("original", "poisoned"))
            .await
            .unwrap();

        let restarted = CacheManager::new(store.clone(), CacheSettings::default());
        assert_eq!(restarted.get::<String>("k").await, None);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_empties_both_layers() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let cache = CacheManager::new(store.clone(), CacheSettings::default());
        cache.set("a", &1, Duration::from_secs(60)).await;
        cache.set("b", &2, Duration::from_secs(60)).await;

        cache.clear().await;

        assert_eq!(cache.get::<i32>("a").await, None);
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(dir.path().join("session")));

        let cache = CacheManager::new(store.clone(), CacheSettings::default());
        cache.set("campaigns:enriched", &vec![1, 2, 3], Duration::from_secs(60)).await;

        let restarted = CacheManager::new(
            Arc::new(FileStore::new(dir.path().join("session"))),
            CacheSettings::default(),
        );
        assert_eq!(restarted.rehydrate().await, 1);
        assert_eq!(
            restarted.get::<Vec<i32>>("campaigns:enriched").await,
            Some(vec![1, 2, 3])
        );

        restarted.clear().await;
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_concurrent_writes_to_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("session")));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.set("k", format!("value-{}", i)).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let value = store.get("k").await.unwrap().unwrap();
        assert!(value.starts_with("value-"));
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }
}
