//! Single memory authority: owns the handle tracker and the bitmap cache,
//! samples heap usage, and reclaims when the host runs hot. Constructed once
//! at the composition root and shared by `Arc`.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded, select, tick};
use rayon::prelude::*;

use crate::cache::BoundedCanvasCache;
use crate::codec;
use crate::config::Config;
use crate::error::ThumbnailError;
use crate::tracker::{DisplayHandle, ResourceTracker};
use crate::SourceFile;

/// Raw heap numbers from the host, all in bytes.
#[derive(Debug, Clone, Copy)]
pub struct HeapSample {
    pub used: u64,
    pub total: u64,
    pub limit: u64,
}

/// Injected host capability. Returns None on hosts where heap introspection
/// is unavailable; the manager then monitors counts only.
pub trait HeapSampler: Send + Sync {
    fn sample(&self) -> Option<HeapSample>;
}

/// Production sampler backed by sysinfo. The limit is the cgroup memory
/// ceiling when one applies, otherwise physical total.
pub struct SysinfoSampler {
    system: Mutex<sysinfo::System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self { system: Mutex::new(sysinfo::System::new()) }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapSampler for SysinfoSampler {
    fn sample(&self) -> Option<HeapSample> {
        let mut sys = self.system.lock().ok()?;
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        let limit = sys
            .cgroup_limits()
            .map(|l| l.total_memory)
            .filter(|l| *l > 0)
            .unwrap_or(total);
        Some(HeapSample { used: sys.used_memory(), total, limit })
    }
}

/// One sampling tick's view of the world. Ephemeral, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
    /// used / limit * 100; None when the host exposes no heap numbers.
    pub utilization_percent: Option<f32>,
    pub handle_count: usize,
    pub bitmap_cache_len: usize,
}

struct Monitor {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

pub struct MemoryManager {
    tracker: ResourceTracker,
    bitmaps: Mutex<BoundedCanvasCache>,
    sampler: Option<Box<dyn HeapSampler>>,
    thumbnail_px: u32,
    jpeg_quality: u8,
    pressure_threshold: f32,
    handles_kept_on_trim: usize,
    monitor: Mutex<Option<Monitor>>,
}

impl MemoryManager {
    pub fn new(config: &Config, sampler: Option<Box<dyn HeapSampler>>) -> Self {
        Self {
            tracker: ResourceTracker::new(),
            bitmaps: Mutex::new(BoundedCanvasCache::new(config.bitmap_cache_capacity)),
            sampler,
            thumbnail_px: config.thumbnail_px,
            jpeg_quality: config.jpeg_quality,
            pressure_threshold: config.pressure_threshold,
            handles_kept_on_trim: config.handles_kept_on_trim,
            monitor: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Thumbnail handle for `file`. A fingerprint hit re-derives a fresh
    /// handle from the cached bitmap (a revoked handle is never resurrected);
    /// a miss runs the codec and stores the bitmap for next time.
    pub fn thumbnail_handle(&self, file: &SourceFile) -> Result<DisplayHandle, ThumbnailError> {
        if let Some(handle) = self.cached_handle(file) {
            return Ok(handle);
        }
        let bytes = file.read_bytes().map_err(|source| ThumbnailError::Read {
            name: file.name.clone(),
            source,
        })?;
        self.thumbnail_handle_from_bytes(file, &bytes)
    }

    /// Same as [`thumbnail_handle`](Self::thumbnail_handle) for callers that
    /// already hold the file bytes (the batch pipeline reads each file once).
    pub fn thumbnail_handle_from_bytes(
        &self,
        file: &SourceFile,
        bytes: &[u8],
    ) -> Result<DisplayHandle, ThumbnailError> {
        if let Some(handle) = self.cached_handle(file) {
            return Ok(handle);
        }
        let bitmap =
            codec::create_thumbnail(&file.name, bytes, self.thumbnail_px, self.jpeg_quality)?;
        let handle = self.tracker.create(bitmap.data.clone());
        self.bitmaps.lock().unwrap().put(file.fingerprint(), bitmap);
        Ok(handle)
    }

    fn cached_handle(&self, file: &SourceFile) -> Option<DisplayHandle> {
        let bitmaps = self.bitmaps.lock().unwrap();
        bitmaps.get(&file.fingerprint()).map(|hit| self.tracker.create(hit.data.clone()))
    }

    /// Run `op` over `items` in fixed-size batches: items inside a batch fan
    /// out in parallel, batches themselves run strictly in sequence. Peak
    /// concurrent work stays bounded by the batch size; per-item failures are
    /// returned in place and never abort the rest.
    pub fn process_batch<T, R, E, F>(&self, items: &[T], batch_size: usize, op: F) -> Vec<Result<R, E>>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> Result<R, E> + Sync,
    {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(items.len());
        for chunk in items.chunks(batch_size) {
            let mut batch: Vec<Result<R, E>> = chunk.par_iter().map(&op).collect();
            results.append(&mut batch);
        }
        results
    }

    pub fn memory_stats(&self) -> MemorySample {
        let heap = self.sampler.as_ref().and_then(|s| s.sample());
        let (used, total, limit) = heap.map(|h| (h.used, h.total, h.limit)).unwrap_or((0, 0, 0));
        let utilization = heap
            .filter(|h| h.limit > 0)
            .map(|h| (h.used as f64 / h.limit as f64 * 100.0) as f32);
        MemorySample {
            used_bytes: used,
            total_bytes: total,
            limit_bytes: limit,
            utilization_percent: utilization,
            handle_count: self.tracker.len(),
            bitmap_cache_len: self.bitmaps.lock().unwrap().len(),
        }
    }

    pub fn is_under_pressure(&self) -> bool {
        self.memory_stats()
            .utilization_percent
            .map(|pct| pct > self.pressure_threshold)
            .unwrap_or(false)
    }

    /// Start the periodic sampling loop. Idempotent: a second call while the
    /// monitor is running does nothing.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let manager = Arc::clone(self);
        let join = std::thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let stats = manager.memory_stats();
                        if let Some(pct) = stats.utilization_percent
                            && pct > manager.pressure_threshold
                        {
                            log::warn!(
                                "memory pressure {:.1}% (threshold {:.1}%), reclaiming",
                                pct, manager.pressure_threshold
                            );
                            manager.emergency_cleanup();
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        *monitor = Some(Monitor { stop_tx, join });
    }

    pub fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().unwrap().take();
        if let Some(m) = monitor {
            let _ = m.stop_tx.send(());
            let _ = m.join.join();
        }
    }

    /// Best-effort reclamation: drop the oldest half of the bitmap cache,
    /// trim tracked handles to the newest few, then let registered
    /// subsystems shed their own weight. Never fails.
    pub fn emergency_cleanup(&self) {
        let evicted = {
            let mut bitmaps = self.bitmaps.lock().unwrap();
            let half = bitmaps.len().div_ceil(2);
            bitmaps.evict_oldest(half)
        };
        let revoked = self.tracker.trim_to_newest(self.handles_kept_on_trim);
        self.tracker.run_cleanup_callbacks();
        log::info!("emergency cleanup: evicted {} bitmaps, revoked {} handles", evicted, revoked);
    }

    /// Full teardown. Idempotent; safe to call more than once.
    pub fn cleanup(&self) {
        self.stop_monitoring();
        self.tracker.revoke_all();
        self.bitmaps.lock().unwrap().clear();
        self.tracker.run_cleanup_callbacks();
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    struct FixedSampler(HeapSample);

    impl HeapSampler for FixedSampler {
        fn sample(&self) -> Option<HeapSample> {
            Some(self.0)
        }
    }

    fn manager_with_utilization(pct: u64) -> Arc<MemoryManager> {
        let sample = HeapSample { used: pct, total: 100, limit: 100 };
        Arc::new(MemoryManager::new(&Config::default(), Some(Box::new(FixedSampler(sample)))))
    }

    fn write_test_image(dir: &Path, name: &str, w: u32, h: u32) -> SourceFile {
        let img = image::RgbImage::from_pixel(w, h, image::Rgb([10, 20, 30]));
        let path = dir.join(name);
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        std::fs::File::create(&path).unwrap().write_all(&out.into_inner()).unwrap();
        SourceFile::from_path(&path).unwrap()
    }

    #[test]
    fn test_process_batch_preserves_order_and_errors() {
        let manager = Arc::new(MemoryManager::new(&Config::default(), None));
        let items: Vec<u32> = (0..13).collect();
        let results = manager.process_batch(&items, 5, |n| {
            if n % 4 == 3 { Err(format!("bad {n}")) } else { Ok(n * 2) }
        });

        assert_eq!(results.len(), 13);
        for (i, r) in results.iter().enumerate() {
            if i % 4 == 3 {
                assert!(r.is_err());
            } else {
                assert_eq!(*r.as_ref().unwrap(), (i as u32) * 2);
            }
        }
    }

    #[test]
    fn test_thumbnail_cache_hit_shares_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_test_image(dir.path(), "a.png", 400, 300);
        let manager = Arc::new(MemoryManager::new(&Config::default(), None));

        let h1 = manager.thumbnail_handle(&file).unwrap();
        let h2 = manager.thumbnail_handle(&file).unwrap();
        // Fresh handle per call, but the underlying buffer is the cached one.
        assert_ne!(h1, h2);
        let b1 = manager.tracker().resolve(h1).unwrap();
        let b2 = manager.tracker().resolve(h2).unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(manager.memory_stats().bitmap_cache_len, 1);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let manager = MemoryManager::new(&Config::default(), None);
        let file = SourceFile {
            path: "/nonexistent/zz.png".into(),
            name: "zz.png".to_string(),
            size: 0,
            modified: chrono::Utc::now(),
        };
        assert!(matches!(
            manager.thumbnail_handle(&file),
            Err(ThumbnailError::Read { .. })
        ));
    }

    #[test]
    fn test_utilization_and_pressure() {
        let manager = manager_with_utilization(85);
        let stats = manager.memory_stats();
        assert!((stats.utilization_percent.unwrap() - 85.0).abs() < 0.01);
        assert!(manager.is_under_pressure());

        let calm = manager_with_utilization(40);
        assert!(!calm.is_under_pressure());

        let blind = Arc::new(MemoryManager::new(&Config::default(), None));
        assert!(blind.memory_stats().utilization_percent.is_none());
        assert!(!blind.is_under_pressure());
    }

    #[test]
    fn test_emergency_cleanup_halves_cache_and_trims_handles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(MemoryManager::new(&Config::default(), None));

        for i in 0..6 {
            let file = write_test_image(dir.path(), &format!("f{i}.png"), 64 + i, 64);
            manager.thumbnail_handle(&file).unwrap();
        }
        for _ in 0..30 {
            manager.tracker().create(vec![0u8; 4].into());
        }
        let before = manager.memory_stats();
        assert_eq!(before.bitmap_cache_len, 6);
        assert_eq!(before.handle_count, 36);

        manager.emergency_cleanup();
        let after = manager.memory_stats();
        assert!(after.bitmap_cache_len <= 3);
        assert!(after.handle_count <= 20);
    }

    #[test]
    fn test_cleanup_is_idempotent_and_revokes_all() {
        let manager = Arc::new(MemoryManager::new(&Config::default(), None));
        let handles: Vec<_> = (0..5).map(|_| manager.tracker().create(vec![1u8; 4].into())).collect();

        manager.cleanup();
        assert_eq!(manager.memory_stats().handle_count, 0);
        for h in &handles {
            assert!(manager.tracker().resolve(*h).is_none());
            manager.tracker().revoke(*h); // no-op after teardown
        }
        manager.cleanup();
        assert_eq!(manager.memory_stats().handle_count, 0);
    }

    #[test]
    fn test_monitor_triggers_emergency_under_pressure() {
        let manager = manager_with_utilization(95);
        for _ in 0..40 {
            manager.tracker().create(vec![0u8; 4].into());
        }
        manager.start_monitoring(Duration::from_millis(10));
        // Idempotent second start.
        manager.start_monitoring(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(120));
        manager.stop_monitoring();

        assert!(manager.memory_stats().handle_count <= 20);
    }
}
