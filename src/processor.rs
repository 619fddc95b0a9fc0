//! Folder pipeline: walks groups of files, extracts capture dates and
//! thumbnails in bounded batches, and emits date-sorted folder records.
//! Groups run strictly in sequence; files inside a batch fan out in
//! parallel, which keeps peak concurrent decodes bounded by the batch size.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use rayon::prelude::*;

use crate::config::Config;
use crate::error::ProcessError;
use crate::exif_date::{CaptureDateSource, ExifDateSource};
use crate::memory::MemoryManager;
use crate::{DateLogic, FolderRecord, PhotoRecord, SourceFile};

/// One input group: a folder name and the image files found under it.
#[derive(Debug, Clone)]
pub struct FolderGroup {
    pub name: String,
    pub files: Vec<SourceFile>,
}

/// Messages a run emits toward the orchestrating side. Sends are
/// fire-and-forget; a slow or dropped consumer never stalls the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Start { total_folders: usize, total_files: usize },
    FolderProgress { done: usize, total: usize },
    FileProgress { done: usize, total: usize },
    Done { folders: Vec<FolderRecord>, stats: RunStats },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub files_seen: usize,
    pub files_skipped_oversize: usize,
    pub photos_kept: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Processing,
    Done,
    Error,
}

pub struct BatchFolderProcessor {
    manager: Arc<MemoryManager>,
    dates: Arc<dyn CaptureDateSource>,
    state: Mutex<ProcessorState>,
    batch_size: usize,
    max_file_size: u64,
    next_id: AtomicU64,
    last_stats: Mutex<RunStats>,
}

impl BatchFolderProcessor {
    pub fn new(manager: Arc<MemoryManager>, config: &Config) -> Self {
        Self::with_date_source(manager, config, Arc::new(ExifDateSource))
    }

    pub fn with_date_source(
        manager: Arc<MemoryManager>,
        config: &Config,
        dates: Arc<dyn CaptureDateSource>,
    ) -> Self {
        Self {
            manager,
            dates,
            state: Mutex::new(ProcessorState::Idle),
            batch_size: config.batch_size.max(1),
            max_file_size: config.max_file_size,
            next_id: AtomicU64::new(0),
            last_stats: Mutex::new(RunStats::default()),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock().unwrap()
    }

    pub fn last_run_stats(&self) -> RunStats {
        *self.last_stats.lock().unwrap()
    }

    /// Return to `Idle` from `Done` or `Error`. The only way out of a
    /// finished run; in-flight work from an abandoned run is simply
    /// discarded, no partial results surface afterwards.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = ProcessorState::Idle;
    }

    /// Run the pipeline over `groups`. Only valid from `Idle`; finishes in
    /// `Done` with the sorted folder records or in `Error` with one
    /// user-facing condition.
    pub fn process_groups(
        &self,
        groups: &[FolderGroup],
        date_logic: DateLogic,
        events: Option<&Sender<PipelineEvent>>,
    ) -> Result<Vec<FolderRecord>, ProcessError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ProcessorState::Idle {
                return Err(ProcessError::Busy);
            }
            *state = ProcessorState::Processing;
        }

        match self.run(groups, date_logic, events) {
            Ok((folders, stats)) => {
                *self.last_stats.lock().unwrap() = stats;
                *self.state.lock().unwrap() = ProcessorState::Done;
                send(events, PipelineEvent::Done { folders: folders.clone(), stats });
                Ok(folders)
            }
            Err(e) => {
                *self.state.lock().unwrap() = ProcessorState::Error;
                send(events, PipelineEvent::Error { message: e.to_string() });
                Err(e)
            }
        }
    }

    /// Worker-style offload: run on a dedicated thread, consume everything
    /// (including the final records) through the returned event channel.
    pub fn process_groups_background(
        self: Arc<Self>,
        groups: Vec<FolderGroup>,
        date_logic: DateLogic,
    ) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        std::thread::spawn(move || {
            let _ = self.process_groups(&groups, date_logic, Some(&tx));
        });
        rx
    }

    fn run(
        &self,
        groups: &[FolderGroup],
        date_logic: DateLogic,
        events: Option<&Sender<PipelineEvent>>,
    ) -> Result<(Vec<FolderRecord>, RunStats), ProcessError> {
        if groups.is_empty() {
            return Err(ProcessError::NoSubFolders);
        }

        let total_files: usize = groups.iter().map(|g| g.files.len()).sum();
        send(events, PipelineEvent::Start { total_folders: groups.len(), total_files });

        let mut stats = RunStats { files_seen: total_files, ..RunStats::default() };
        let file_counter = AtomicUsize::new(0);
        let mut folders = Vec::new();

        for (group_idx, group) in groups.iter().enumerate() {
            let (eligible, oversized): (Vec<&SourceFile>, Vec<&SourceFile>) =
                group.files.iter().partition(|f| f.size <= self.max_file_size);
            stats.files_skipped_oversize += oversized.len();
            // Oversized files still count toward progress totals.
            file_counter.fetch_add(oversized.len(), Ordering::Relaxed);

            let mut photos = Vec::new();
            for chunk in eligible.chunks(self.batch_size) {
                let batch = catch_unwind(AssertUnwindSafe(|| {
                    chunk
                        .par_iter()
                        .map(|file| {
                            let photo = self.process_file(file);
                            let done = file_counter.fetch_add(1, Ordering::Relaxed) + 1;
                            send(events, PipelineEvent::FileProgress { done, total: total_files });
                            photo
                        })
                        .collect::<Vec<Option<PhotoRecord>>>()
                }))
                .map_err(|_| ProcessError::Batch(format!("batch panicked in '{}'", group.name)))?;

                photos.extend(batch.into_iter().flatten());
            }

            if !photos.is_empty() {
                stats.photos_kept += photos.len();
                let representative = representative_date(&photos, date_logic);
                folders.push(FolderRecord {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    original_name: group.name.clone(),
                    photos,
                    representative_date: representative,
                    assigned_name: None,
                    renamed: false,
                });
            }

            send(
                events,
                PipelineEvent::FolderProgress { done: group_idx + 1, total: groups.len() },
            );
        }

        if folders.is_empty() {
            return Err(ProcessError::NoImages);
        }

        sort_folders(&mut folders);
        Ok((folders, stats))
    }

    /// One file: date failure leaves the photo undated, thumbnail failure
    /// drops it entirely. Neither ever aborts the batch.
    fn process_file(&self, file: &SourceFile) -> Option<PhotoRecord> {
        let bytes = match file.read_bytes() {
            Ok(b) => b,
            Err(e) => {
                log::debug!("skipping unreadable {}: {}", file.name, e);
                return None;
            }
        };

        let captured = self.dates.capture_date(file, &bytes);

        let thumbnail = match self.manager.thumbnail_handle_from_bytes(file, &bytes) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("skipping {}: {}", file.name, e);
                return None;
            }
        };

        Some(PhotoRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            captured,
            thumbnail,
            source: file.clone(),
        })
    }
}

fn send(events: Option<&Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Min or max of the photos' valid dates per the active logic; None when no
/// photo in the folder is datable.
pub fn representative_date(photos: &[PhotoRecord], logic: DateLogic) -> Option<DateTime<Utc>> {
    let dates = photos.iter().filter_map(|p| p.captured);
    match logic {
        DateLogic::Earliest => dates.min(),
        DateLogic::Latest => dates.max(),
    }
}

/// Ascending by representative date, undated folders last. The sort is
/// stable, so folders with equal or missing dates keep their group order.
fn sort_folders(folders: &mut [FolderRecord]) {
    folders.sort_by(|a, b| match (a.representative_date, b.representative_date) {
        (Some(da), Some(db)) => da.cmp(&db),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
