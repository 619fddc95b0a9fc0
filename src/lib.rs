//! Core engine for grouping a dropped photo tree into date-sorted folders:
//! a bounded thumbnail/handle cache plus a batched EXIF+thumbnail pipeline.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod exif_date;
pub mod lazy;
pub mod memory;
pub mod processor;
pub mod tracker;

pub use crate::config::Config;
pub use crate::error::{ProcessError, ThumbnailError};
pub use crate::lazy::LazyThumbnailCache;
pub use crate::memory::{MemoryManager, MemorySample};
pub use crate::processor::{BatchFolderProcessor, FolderGroup, PipelineEvent, ProcessorState, RunStats};
pub use crate::tracker::{DisplayHandle, ResourceTracker};

/// Handle to a raw image file. Owned by the caller; caches refer to it only
/// through its [`Fingerprint`].
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl SourceFile {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        Ok(Self { path: path.to_path_buf(), name, size: metadata.len(), modified })
    }

    /// Stable cache identity: (name, size, mtime). Not cryptographic; two
    /// distinct files colliding on all three is not a case we defend against.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            size: self.size,
            modified_ms: self.modified.timestamp_millis(),
        }
    }

    pub fn read_bytes(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub name: String,
    pub size: u64,
    pub modified_ms: i64,
}

/// Which photo date names the folder: the earliest or the latest valid one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DateLogic {
    Earliest,
    Latest,
}

#[derive(Debug, Clone)]
pub struct PhotoRecord {
    pub id: u64,
    pub captured: Option<DateTime<Utc>>,
    pub thumbnail: DisplayHandle,
    pub source: SourceFile,
}

#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub id: u64,
    pub original_name: String,
    pub photos: Vec<PhotoRecord>,
    pub representative_date: Option<DateTime<Utc>>,
    pub assigned_name: Option<String>,
    pub renamed: bool,
}

impl FolderRecord {
    /// The user-assigned name if one was set, otherwise the original one.
    pub fn display_name(&self) -> &str {
        self.assigned_name.as_deref().unwrap_or(&self.original_name)
    }

    pub fn assign_name(&mut self, name: impl Into<String>) {
        self.assigned_name = Some(name.into());
        self.renamed = true;
    }

    /// Date-derived starting name ("YYYY-MM-DD"), None for undatable folders.
    pub fn default_name(&self) -> Option<String> {
        self.representative_date.map(|d| d.format("%Y-%m-%d").to_string())
    }
}
