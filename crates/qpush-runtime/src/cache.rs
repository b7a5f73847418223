//! Key/value cache used to memoize backend resource handles.
//!
//! Providers resolve handles in three tiers: the value already known in
//! memory, then the [`Cache`], then the backend itself. A cache miss only
//! means "not known yet"; it never implies the resource is absent.

use crate::error::{QueueError, SerializationError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;

/// Narrow key/value store for resource handles
#[async_trait]
pub trait Cache: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool, QueueError>;

    async fn fetch(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn save(&self, key: &str, value: &str) -> Result<(), QueueError>;

    async fn delete(&self, key: &str) -> Result<(), QueueError>;
}

// ============================================================================
// In-memory cache
// ============================================================================

/// Process-local cache
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn contains(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn fetch(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// ============================================================================
// Filesystem cache
// ============================================================================

/// Cache persisted as a single JSON document, so handles survive between
/// short-lived processes such as CLI invocations.
#[derive(Debug)]
pub struct FilesystemCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FilesystemCache {
    /// Open the cache file, starting empty when it does not exist yet
    pub async fn open(path: PathBuf) -> Result<Self, QueueError> {
        let entries = match fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json).map_err(SerializationError::from)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(entries).map_err(SerializationError::from)?;

        // Write to temporary file first, then rename over the old document
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn contains(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.entries.lock().await.contains_key(key))
    }

    async fn fetch(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Handle resolution
// ============================================================================

/// Where a resolved handle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleSource {
    Memory,
    Cache,
    Backend,
}

/// Resolve a resource handle: memory, then cache, then a backend probe.
///
/// `known` is the caller's in-memory value. The probe is only invoked when
/// both the memory and cache tiers miss; a handle found by the probe is
/// written through to the cache. `Ok(None)` means the backend reports the
/// resource as absent.
///
/// # Example
///
/// ```rust
/// use qpush_runtime::cache::{resolve_handle, Cache, HandleSource, InMemoryCache};
///
/// # tokio_test::block_on(async {
/// let cache = InMemoryCache::new();
///
/// let first = resolve_handle(None, &cache, "qpush_orders_url", || async {
///     Ok(Some("https://queue.example/orders".to_string()))
/// })
/// .await
/// .unwrap();
/// assert_eq!(first.unwrap().1, HandleSource::Backend);
///
/// let second = resolve_handle(None, &cache, "qpush_orders_url", || async { Ok(None) })
///     .await
///     .unwrap();
/// assert_eq!(second.unwrap().1, HandleSource::Cache);
/// assert!(cache.contains("qpush_orders_url").await.unwrap());
/// # });
/// ```
pub async fn resolve_handle<F, Fut>(
    known: Option<String>,
    cache: &dyn Cache,
    key: &str,
    probe: F,
) -> Result<Option<(String, HandleSource)>, QueueError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<String>, QueueError>>,
{
    if let Some(handle) = known {
        return Ok(Some((handle, HandleSource::Memory)));
    }

    if let Some(handle) = cache.fetch(key).await? {
        debug!(key, "resource handle resolved from cache");
        return Ok(Some((handle, HandleSource::Cache)));
    }

    match probe().await? {
        Some(handle) => {
            debug!(key, "resource handle resolved from backend");
            cache.save(key, &handle).await?;
            Ok(Some((handle, HandleSource::Backend)))
        }
        None => Ok(None),
    }
}
