use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables for the whole pipeline. Loaded from `snapsort/config.toml` in the
/// user config directory when present, otherwise defaults apply. Every field
/// can also be overridden from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Longest thumbnail side in pixels.
    pub thumbnail_px: u32,
    /// JPEG re-encode quality (0-100).
    pub jpeg_quality: u8,
    /// Capacity of the FIFO bitmap cache.
    pub bitmap_cache_capacity: usize,
    /// Capacity of the per-session lazy thumbnail cache.
    pub lazy_cache_capacity: usize,
    /// Lazy cache entries idle longer than this are swept (seconds).
    pub entry_max_age_secs: u64,
    /// Sweep interval for the lazy cache (seconds).
    pub sweep_interval_secs: u64,
    /// Heap utilization (percent) above which emergency cleanup fires.
    pub pressure_threshold: f32,
    /// Files processed concurrently per batch.
    pub batch_size: usize,
    /// Files larger than this are skipped outright (bytes).
    pub max_file_size: u64,
    /// Tracked handles kept after an emergency trim.
    pub handles_kept_on_trim: usize,
    /// Memory sampling interval (seconds).
    pub monitor_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thumbnail_px: 200,
            jpeg_quality: 80,
            bitmap_cache_capacity: 50,
            lazy_cache_capacity: 50,
            entry_max_age_secs: 300,
            sweep_interval_secs: 30,
            pressure_threshold: 80.0,
            batch_size: 6,
            max_file_size: 100 * 1024 * 1024,
            handles_kept_on_trim: 20,
            monitor_interval_secs: 5,
        }
    }
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("snapsort").join("config.toml"))
    }

    /// Load the user config, falling back to defaults if the file is absent
    /// or unparseable (a broken config should not brick the tool).
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("ignoring invalid config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.thumbnail_px, 200);
        assert_eq!(config.bitmap_cache_capacity, 50);
        assert_eq!(config.lazy_cache_capacity, 50);
        assert_eq!(config.entry_max_age_secs, 300);
        assert!((config.pressure_threshold - 80.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("batch_size = 8\nthumbnail_px = 256\n").unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.thumbnail_px, 256);
        assert_eq!(config.lazy_cache_capacity, 50);
    }
}
