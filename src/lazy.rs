//! Per-view-session thumbnail cache: least-recently-used plus max-age
//! eviction, populated on demand as files scroll into view. Sits on top of
//! the `MemoryManager`, which stays the sole owner of every handle.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, select, tick};
use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::error::ThumbnailError;
use crate::memory::MemoryManager;
use crate::tracker::{CleanupToken, DisplayHandle};
use crate::{Fingerprint, SourceFile};

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
}

struct Entry {
    handle: DisplayHandle,
    last_used: Instant,
    // Monotonic access counter; breaks ties when Instants collide.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: FxHashMap<Fingerprint, Entry>,
    next_seq: u64,
}

struct Sweeper {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

pub struct LazyThumbnailCache {
    inner: Arc<Mutex<Inner>>,
    manager: Arc<MemoryManager>,
    capacity: usize,
    max_age: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
    cleanup_token: CleanupToken,
}

impl LazyThumbnailCache {
    pub fn new(manager: Arc<MemoryManager>, config: &Config) -> Self {
        let inner: Arc<Mutex<Inner>> = Arc::new(Mutex::new(Inner::default()));

        // During emergencies the manager asks every session to shed the
        // oldest half of its entries. Weak refs keep the hook from pinning
        // either side alive.
        let weak_inner = Arc::downgrade(&inner);
        let weak_manager = Arc::downgrade(&manager);
        let cleanup_token = manager.tracker().register_cleanup(move || {
            if let (Some(inner), Some(manager)) = (weak_inner.upgrade(), weak_manager.upgrade()) {
                let mut guard = inner.lock().unwrap();
                let half = guard.entries.len().div_ceil(2);
                evict_lru(&mut guard, half, &manager);
            }
        });

        Self {
            inner,
            manager,
            capacity: config.lazy_cache_capacity.max(1),
            max_age: Duration::from_secs(config.entry_max_age_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            sweeper: Mutex::new(None),
            cleanup_token,
        }
    }

    /// Displayable handle for `file`. A resident entry is refreshed and
    /// returned as-is; a miss creates one, through the manager's bounded
    /// thumbnail pipeline when memory is under pressure, otherwise directly
    /// from the file bytes at full resolution.
    pub fn thumbnail_handle(&self, file: &SourceFile) -> Result<DisplayHandle, ThumbnailError> {
        let fingerprint = file.fingerprint();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let mut stale = false;
            if let Some(entry) = inner.entries.get_mut(&fingerprint) {
                // An emergency trim may have revoked the handle out from
                // under us; treat that as a miss instead of serving a dud.
                if self.manager.tracker().resolve(entry.handle).is_some() {
                    entry.last_used = Instant::now();
                    entry.seq = seq;
                    return Ok(entry.handle);
                }
                stale = true;
            }
            if stale {
                inner.entries.remove(&fingerprint);
            }
        }

        self.ensure_sweeper();

        let handle = if self.manager.is_under_pressure() {
            self.manager.thumbnail_handle(file)?
        } else {
            let bytes = file.read_bytes().map_err(|source| ThumbnailError::Read {
                name: file.name.clone(),
                source,
            })?;
            self.manager.tracker().create(bytes.into())
        };

        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        // Another thread may have raced us through the same miss. Keep the
        // winner's entry and discard our handle, so exactly one tracked
        // handle per resident file survives.
        if let Some(entry) = inner.entries.get_mut(&fingerprint)
            && self.manager.tracker().resolve(entry.handle).is_some()
        {
            self.manager.tracker().revoke(handle);
            entry.last_used = Instant::now();
            entry.seq = seq;
            return Ok(entry.handle);
        }
        if let Some(old) =
            inner.entries.insert(fingerprint, Entry { handle, last_used: Instant::now(), seq })
        {
            self.manager.tracker().revoke(old.handle);
        }
        Ok(handle)
    }

    /// Warm the cache for up to `max_count` files that are not yet resident.
    /// Failures are logged and skipped; preloading is best-effort.
    pub fn preload(&self, files: &[SourceFile], max_count: usize) {
        let mut loaded = 0;
        for file in files {
            if loaded >= max_count {
                break;
            }
            let resident = {
                let inner = self.inner.lock().unwrap();
                inner.entries.contains_key(&file.fingerprint())
            };
            if resident {
                continue;
            }
            match self.thumbnail_handle(file) {
                Ok(_) => loaded += 1,
                Err(e) => log::debug!("preload skipped {}: {}", file.name, e),
            }
        }
    }

    /// Remove and revoke one entry. Unknown files are a no-op.
    pub fn revoke(&self, file: &SourceFile) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.remove(&file.fingerprint())
        };
        if let Some(entry) = removed {
            self.manager.tracker().revoke(entry.handle);
        }
    }

    /// Clear the whole session: revoke every entry and stop the sweeper.
    pub fn revoke_all(&self) {
        self.stop_sweeper();
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            self.manager.tracker().revoke(entry.handle);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { len: self.inner.lock().unwrap().entries.len(), capacity: self.capacity }
    }

    /// One eviction pass, on demand. The sweeper thread runs this on its own
    /// interval; both rules apply every pass, not just when over capacity.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        sweep_entries(&mut inner, self.capacity, self.max_age, now, &self.manager);
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_manager = Arc::downgrade(&self.manager);
        let capacity = self.capacity;
        let max_age = self.max_age;
        let interval = self.sweep_interval;
        let join = std::thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let (Some(inner), Some(manager)) =
                            (weak_inner.upgrade(), weak_manager.upgrade())
                        else {
                            break;
                        };
                        let mut guard = inner.lock().unwrap();
                        sweep_entries(&mut guard, capacity, max_age, Instant::now(), &manager);
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        *sweeper = Some(Sweeper { stop_tx, join });
    }

    fn stop_sweeper(&self) {
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(s) = sweeper {
            let _ = s.stop_tx.send(());
            let _ = s.join.join();
        }
    }
}

impl Drop for LazyThumbnailCache {
    fn drop(&mut self) {
        self.revoke_all();
        self.manager.tracker().unregister_cleanup(self.cleanup_token);
    }
}

/// Evict the `n` least-recently-used entries, revoking their handles.
fn evict_lru(inner: &mut Inner, n: usize, manager: &MemoryManager) {
    if n == 0 {
        return;
    }
    let mut by_use: Vec<(Fingerprint, u64)> =
        inner.entries.iter().map(|(k, e)| (k.clone(), e.seq)).collect();
    by_use.sort_by_key(|(_, seq)| *seq);
    for (key, _) in by_use.into_iter().take(n) {
        if let Some(entry) = inner.entries.remove(&key) {
            manager.tracker().revoke(entry.handle);
        }
    }
}

fn sweep_entries(
    inner: &mut Inner,
    capacity: usize,
    max_age: Duration,
    now: Instant,
    manager: &MemoryManager,
) {
    // Rule (a): LRU-prune down to capacity.
    if inner.entries.len() > capacity {
        let excess = inner.entries.len() - capacity;
        evict_lru(inner, excess, manager);
    }

    // Rule (b): drop anything idle past max_age, regardless of count.
    let stale: Vec<Fingerprint> = inner
        .entries
        .iter()
        .filter(|(_, e)| {
            now.checked_duration_since(e.last_used).unwrap_or_default() > max_age
        })
        .map(|(k, _)| k.clone())
        .collect();
    for key in stale {
        if let Some(entry) = inner.entries.remove(&key) {
            manager.tracker().revoke(entry.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeapSample, HeapSampler};
    use std::io::Write;
    use std::path::Path;

    struct FixedSampler(HeapSample);

    impl HeapSampler for FixedSampler {
        fn sample(&self) -> Option<HeapSample> {
            Some(self.0)
        }
    }

    fn quiet_manager() -> Arc<MemoryManager> {
        Arc::new(MemoryManager::new(&Config::default(), None))
    }

    fn pressured_manager() -> Arc<MemoryManager> {
        let sample = HeapSample { used: 95, total: 100, limit: 100 };
        Arc::new(MemoryManager::new(&Config::default(), Some(Box::new(FixedSampler(sample)))))
    }

    fn write_test_image(dir: &Path, name: &str) -> SourceFile {
        let img = image::RgbImage::from_pixel(32, 24, image::Rgb([1, 2, 3]));
        let path = dir.join(name);
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        std::fs::File::create(&path).unwrap().write_all(&out.into_inner()).unwrap();
        SourceFile::from_path(&path).unwrap()
    }

    #[test]
    fn test_hit_returns_same_handle_without_new_resource() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let cache = LazyThumbnailCache::new(manager.clone(), &Config::default());
        let file = write_test_image(dir.path(), "a.png");

        let h1 = cache.thumbnail_handle(&file).unwrap();
        let before = manager.tracker().len();
        let h2 = cache.thumbnail_handle(&file).unwrap();

        assert_eq!(h1, h2);
        assert_eq!(manager.tracker().len(), before);
    }

    #[test]
    fn test_pressure_routes_through_bounded_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let manager = pressured_manager();
        let cache = LazyThumbnailCache::new(manager.clone(), &Config::default());
        let file = write_test_image(dir.path(), "a.png");

        cache.thumbnail_handle(&file).unwrap();
        // Under pressure the miss lands in the manager's bitmap cache.
        assert_eq!(manager.memory_stats().bitmap_cache_len, 1);
    }

    #[test]
    fn test_sweep_prunes_lru_over_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let mut config = Config::default();
        config.lazy_cache_capacity = 50;
        let cache = LazyThumbnailCache::new(manager.clone(), &config);

        let files: Vec<SourceFile> =
            (0..55).map(|i| write_test_image(dir.path(), &format!("f{i:02}.png"))).collect();
        cache.preload(&files, 55);
        assert_eq!(cache.stats().len, 55);
        let handles: Vec<DisplayHandle> =
            files.iter().map(|f| cache.thumbnail_handle(f).unwrap()).collect();

        cache.sweep();
        assert!(cache.stats().len <= 50);
        // The five least-recently-used entries are gone and revoked.
        for h in &handles[..5] {
            assert!(manager.tracker().resolve(*h).is_none());
        }
        for h in &handles[5..] {
            assert!(manager.tracker().resolve(*h).is_some());
        }
    }

    #[test]
    fn test_sweep_purges_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let cache = LazyThumbnailCache::new(manager.clone(), &Config::default());
        let file = write_test_image(dir.path(), "a.png");
        let handle = cache.thumbnail_handle(&file).unwrap();

        // Well under capacity, but six minutes idle beats the five-minute cap.
        cache.sweep_at(Instant::now() + Duration::from_secs(6 * 60));
        assert_eq!(cache.stats().len, 0);
        assert!(manager.tracker().resolve(handle).is_none());
    }

    #[test]
    fn test_preload_skips_resident_and_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let cache = LazyThumbnailCache::new(manager.clone(), &Config::default());
        let files: Vec<SourceFile> =
            (0..15).map(|i| write_test_image(dir.path(), &format!("f{i:02}.png"))).collect();

        cache.thumbnail_handle(&files[0]).unwrap();
        cache.preload(&files, 10);
        // 1 resident + 10 newly loaded.
        assert_eq!(cache.stats().len, 11);
    }

    #[test]
    fn test_revoke_single_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let cache = LazyThumbnailCache::new(manager.clone(), &Config::default());
        let a = write_test_image(dir.path(), "a.png");
        let b = write_test_image(dir.path(), "b.png");

        let ha = cache.thumbnail_handle(&a).unwrap();
        let hb = cache.thumbnail_handle(&b).unwrap();

        cache.revoke(&a);
        assert!(manager.tracker().resolve(ha).is_none());
        assert!(manager.tracker().resolve(hb).is_some());
        assert_eq!(cache.stats().len, 1);

        cache.revoke_all();
        assert!(manager.tracker().resolve(hb).is_none());
        assert_eq!(cache.stats().len, 0);
    }

    #[test]
    fn test_racing_misses_leave_no_stray_handles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let cache = Arc::new(LazyThumbnailCache::new(manager.clone(), &Config::default()));
        let files: Arc<Vec<SourceFile>> = Arc::new(
            (0..20).map(|i| write_test_image(dir.path(), &format!("f{i:02}.png"))).collect(),
        );

        // Fan several threads onto the same uncached files so they all take
        // the miss path at once.
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let files = files.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    files
                        .iter()
                        .map(|f| cache.thumbnail_handle(f).unwrap())
                        .collect::<Vec<DisplayHandle>>()
                })
            })
            .collect();
        let issued: Vec<DisplayHandle> =
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

        cache.revoke_all();
        // Every handle handed out during the race must be dead now; a loser
        // that leaked its duplicate would still resolve here.
        assert!(manager.tracker().is_empty());
        for h in issued {
            assert!(manager.tracker().resolve(h).is_none());
        }
    }

    #[test]
    fn test_emergency_callback_sheds_half() {
        let dir = tempfile::tempdir().unwrap();
        let manager = quiet_manager();
        let cache = LazyThumbnailCache::new(manager.clone(), &Config::default());
        for i in 0..6 {
            let file = write_test_image(dir.path(), &format!("f{i}.png"));
            cache.thumbnail_handle(&file).unwrap();
        }
        assert_eq!(cache.stats().len, 6);

        manager.emergency_cleanup();
        assert!(cache.stats().len <= 3);
    }
}
