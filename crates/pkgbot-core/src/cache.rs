//! Expiring store of resolved artifacts whose evictions delete the backing
//! files.
//!
//! Entries carry their own TTL (moka `Expiry`), so a delivered entry can be
//! kept longer than a freshly resolved one. Several keys may point at the
//! same file; the file is only handed to the [`EvictionListener`] once the
//! last entry referencing it is gone. Moka runs expiry housekeeping lazily,
//! which is why the server drives [`ResultCache::spawn_janitor`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::normalize::collapse_whitespace;
use crate::tasks::{spawn_periodic, TaskHandle};
use crate::util::{bytes_to_mb, human_size};

/// A resolved artifact as remembered by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub display_name: String,
    pub package_id: String,
    pub version: String,
    pub size_bytes: u64,
    pub rating: Option<String>,
    pub icon_url: Option<String>,
    pub filename: Option<String>,
    pub is_multi_part: bool,
    pub backing_path: Option<PathBuf>,
    pub remote_url: Option<String>,
}

impl CacheEntry {
    pub fn human_size(&self) -> String {
        human_size(self.size_bytes)
    }

    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.size_bytes)
    }

    /// Only entries backed by a materialised file are cacheable.
    pub fn has_local_file(&self) -> bool {
        self.filename.is_some() && self.backing_path.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    Expired,
    Explicit,
    Replaced,
    Capacity,
}

impl EvictionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionCause::Expired => "expired",
            EvictionCause::Explicit => "invalidated",
            EvictionCause::Replaced => "replaced",
            EvictionCause::Capacity => "capacity",
        }
    }
}

/// Hook the cache calls when an entry's backing file stops being referenced.
/// Implementations must not block; deferred work belongs on a task.
pub trait EvictionListener: Send + Sync {
    /// A file became referenced by a new cache entry.
    fn on_store(&self, _entry: &CacheEntry) {}

    fn on_evict(&self, key: &str, entry: &CacheEntry, cause: EvictionCause);
}

/// Deletes evicted artifact files after a grace delay so an in-progress send
/// of the same file can finish. A path stored again during the grace window
/// keeps its file.
#[derive(Clone, Default)]
pub struct FileReaper {
    grace: Duration,
    generations: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl FileReaper {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn generation(&self, path: &Path) -> u64 {
        self.generations
            .lock()
            .ok()
            .and_then(|map| map.get(path).copied())
            .unwrap_or(0)
    }

    /// Cancels deletions scheduled for `path` so far.
    pub fn protect(&self, path: &Path) {
        if let Ok(mut map) = self.generations.lock() {
            *map.entry(path.to_path_buf()).or_insert(0) += 1;
        }
    }

    pub fn schedule(&self, path: PathBuf, reason: &'static str) {
        let scheduled_generation = self.generation(&path);
        let reaper = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(reaper.grace).await;
            if reaper.generation(&path) != scheduled_generation {
                debug!(path = %path.display(), reason, "artifact stored again during grace; keeping file");
                return;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(target: "pkgbot::cache", path = %path.display(), reason, "artifact file removed")
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), reason, "artifact file already gone")
                }
                Err(err) => {
                    warn!(path = %path.display(), reason, error = %err, "failed to remove artifact file")
                }
            }
        });
    }
}

impl EvictionListener for FileReaper {
    fn on_store(&self, entry: &CacheEntry) {
        if let Some(path) = entry.backing_path.as_deref() {
            self.protect(path);
        }
    }

    fn on_evict(&self, key: &str, entry: &CacheEntry, cause: EvictionCause) {
        if let Some(path) = entry.backing_path.clone() {
            debug!(key, path = %path.display(), cause = cause.as_str(), "scheduling artifact removal");
            self.schedule(path, cause.as_str());
        }
    }
}

#[derive(Clone)]
struct CachedArtifact {
    entry: Arc<CacheEntry>,
    ttl: Duration,
}

struct ArtifactExpiry;

impl Expiry<String, CachedArtifact> for ArtifactExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedArtifact,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedArtifact,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

type PathRefs = Arc<Mutex<HashMap<PathBuf, u64>>>;

fn acquire_path(refs: &PathRefs, path: &Path) {
    if let Ok(mut map) = refs.lock() {
        *map.entry(path.to_path_buf()).or_insert(0) += 1;
    }
}

/// Returns true when no entry references `path` any more.
fn release_path(refs: &PathRefs, path: &Path) -> bool {
    let Ok(mut map) = refs.lock() else {
        return true;
    };
    match map.get_mut(path) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            map.remove(path);
            true
        }
        None => {
            tracing::trace!(path = %path.display(), "cache eviction missing path ref");
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct ResultCache {
    inner: Cache<String, CachedArtifact>,
    base_ttl: Duration,
    listener: Arc<dyn EvictionListener>,
    path_refs: PathRefs,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Lower-cased, whitespace-collapsed form under which entries are stored.
pub fn canonical_key(key: &str) -> String {
    collapse_whitespace(&key.to_lowercase())
}

impl ResultCache {
    pub fn new(base_ttl: Duration, listener: Arc<dyn EvictionListener>) -> Self {
        let path_refs: PathRefs = Arc::new(Mutex::new(HashMap::new()));
        let eviction_refs = Arc::clone(&path_refs);
        let eviction_listener = Arc::clone(&listener);
        let inner = Cache::builder()
            .expire_after(ArtifactExpiry)
            .async_eviction_listener(move |key: Arc<String>, value: CachedArtifact, cause| {
                let refs = Arc::clone(&eviction_refs);
                let listener = Arc::clone(&eviction_listener);
                Box::pin(async move {
                    // Every stored value holds one ref on its path, replaced ones included.
                    let cause = match cause {
                        RemovalCause::Replaced => EvictionCause::Replaced,
                        RemovalCause::Expired => EvictionCause::Expired,
                        RemovalCause::Explicit => EvictionCause::Explicit,
                        RemovalCause::Size => EvictionCause::Capacity,
                    };
                    let Some(path) = value.entry.backing_path.as_deref() else {
                        return;
                    };
                    if release_path(&refs, path) {
                        listener.on_evict(&key, &value.entry, cause);
                    } else {
                        debug!(key = %key, path = %path.display(), "artifact still referenced");
                    }
                })
            })
            .build();
        Self {
            inner,
            base_ttl,
            listener,
            path_refs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn base_ttl(&self) -> Duration {
        self.base_ttl
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        match self.inner.get(&canonical_key(key)).await {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `entry` with the base TTL.
    pub async fn set(&self, key: &str, entry: CacheEntry) -> Arc<CacheEntry> {
        self.set_with_ttl(key, entry, self.base_ttl).await
    }

    pub async fn set_with_ttl(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Arc<CacheEntry> {
        let key = canonical_key(key);
        let entry = Arc::new(entry);
        if let Some(path) = entry.backing_path.as_deref() {
            acquire_path(&self.path_refs, path);
            self.listener.on_store(&entry);
        }
        self.inner
            .insert(
                key,
                CachedArtifact {
                    entry: Arc::clone(&entry),
                    ttl,
                },
            )
            .await;
        entry
    }

    /// Resets the remaining lifetime of `key` to `ttl`; false if absent.
    pub async fn extend_ttl(&self, key: &str, ttl: Duration) -> bool {
        let key = canonical_key(key);
        let Some(current) = self.inner.get(&key).await else {
            return false;
        };
        if let Some(path) = current.entry.backing_path.as_deref() {
            acquire_path(&self.path_refs, path);
        }
        self.inner
            .insert(
                key,
                CachedArtifact {
                    entry: current.entry,
                    ttl,
                },
            )
            .await;
        true
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(&canonical_key(key)).await;
    }

    /// Applies pending expirations so their eviction side effects run.
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> TaskHandle {
        let cache = Arc::clone(self);
        spawn_periodic("cache.janitor", interval, move || {
            let cache = Arc::clone(&cache);
            async move { cache.run_pending_tasks().await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry_for(path: &Path) -> CacheEntry {
        CacheEntry {
            key: "free fire".into(),
            display_name: "Free Fire".into(),
            package_id: "com.dts.freefireth".into(),
            version: "1.0".into(),
            size_bytes: 4,
            rating: None,
            icon_url: None,
            filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            is_multi_part: false,
            backing_path: Some(path.to_path_buf()),
            remote_url: None,
        }
    }

    fn artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"apk!").unwrap();
        path
    }

    async fn wait_until_removed(cache: &ResultCache, path: &Path, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            cache.run_pending_tasks().await;
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn cache_with_grace(ttl: Duration, grace: Duration) -> ResultCache {
        ResultCache::new(ttl, Arc::new(FileReaper::new(grace)))
    }

    #[tokio::test]
    async fn get_counts_hits_and_misses_under_canonical_key() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_secs(60), Duration::ZERO);
        let path = artifact(tmp.path(), "ff.apk");
        assert!(cache.get("free fire").await.is_none());
        cache.set("Free   Fire", entry_for(&path)).await;
        let hit = cache.get("free fire").await.expect("cache hit");
        assert_eq!(hit.backing_path.as_deref(), Some(path.as_path()));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn expiry_deletes_file_after_ttl_not_before() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_millis(300), Duration::from_millis(50));
        let path = artifact(tmp.path(), "ff.apk");
        cache.set("free fire", entry_for(&path)).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.run_pending_tasks().await;
        assert!(path.exists(), "file must survive until its ttl elapses");

        assert!(
            wait_until_removed(&cache, &path, Duration::from_secs(5)).await,
            "expired entry should remove its backing file"
        );
        assert!(cache.get("free fire").await.is_none());
    }

    #[tokio::test]
    async fn extend_ttl_postpones_deletion() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_millis(300), Duration::from_millis(20));
        let path = artifact(tmp.path(), "ff.apk");
        cache.set("free fire", entry_for(&path)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.extend_ttl("free fire", Duration::from_secs(30)).await);
        assert!(!cache.extend_ttl("missing", Duration::from_secs(30)).await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        cache.run_pending_tasks().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("free fire").await.is_some());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn invalidate_removes_file_after_grace() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_secs(60), Duration::from_millis(200));
        let path = artifact(tmp.path(), "ff.apk");
        cache.set("free fire", entry_for(&path)).await;

        cache.invalidate("free fire").await;
        cache.run_pending_tasks().await;
        assert!(path.exists(), "deletion waits for the grace delay");
        assert!(wait_until_removed(&cache, &path, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn replacing_value_only_deletes_the_old_file() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_secs(60), Duration::from_millis(10));
        let old = artifact(tmp.path(), "old.apk");
        let new = artifact(tmp.path(), "new.apk");
        cache.set("free fire", entry_for(&old)).await;
        cache.set("free fire", entry_for(&new)).await;
        cache.set("free fire", entry_for(&new)).await;

        assert!(wait_until_removed(&cache, &old, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(new.exists());
    }

    #[tokio::test]
    async fn restoring_over_unswept_expired_entry_still_deletes_file() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_millis(100), Duration::from_millis(20));
        let path = artifact(tmp.path(), "ff.apk");
        cache.set("free fire", entry_for(&path)).await;

        // Expired, but housekeeping has not run yet.
        tokio::time::sleep(Duration::from_millis(200)).await;
        cache.set("free fire", entry_for(&path)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(path.exists());

        assert!(
            wait_until_removed(&cache, &path, Duration::from_secs(3)).await,
            "second expiry must release the file"
        );
    }

    #[tokio::test]
    async fn replacing_unswept_expired_entry_deletes_the_old_file() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_millis(100), Duration::from_millis(20));
        let old = artifact(tmp.path(), "old.apk");
        let new = artifact(tmp.path(), "new.apk");
        cache.set("free fire", entry_for(&old)).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        cache
            .set_with_ttl("free fire", entry_for(&new), Duration::from_secs(60))
            .await;

        assert!(wait_until_removed(&cache, &old, Duration::from_secs(3)).await);
        assert!(new.exists());
        assert!(cache.get("free fire").await.is_some());
    }

    #[tokio::test]
    async fn shared_file_survives_until_last_key_goes() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_secs(60), Duration::from_millis(10));
        let path = artifact(tmp.path(), "wa.apk");
        cache.set("whatsapp", entry_for(&path)).await;
        cache.set("whatsapp messenger", entry_for(&path)).await;

        cache.invalidate("whatsapp").await;
        cache.run_pending_tasks().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(path.exists());

        cache.invalidate("whatsapp messenger").await;
        assert!(wait_until_removed(&cache, &path, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn restoring_a_path_during_grace_keeps_the_file() {
        let tmp = tempdir().unwrap();
        let cache = cache_with_grace(Duration::from_secs(60), Duration::from_millis(200));
        let path = artifact(tmp.path(), "ff.apk");
        cache.set("free fire", entry_for(&path)).await;
        cache.invalidate("free fire").await;
        cache.run_pending_tasks().await;
        cache.set("free fire", entry_for(&path)).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(path.exists());
        assert!(cache.get("free fire").await.is_some());
    }
}
