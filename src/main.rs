use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use walkdir::WalkDir;

use snapsort::memory::SysinfoSampler;
use snapsort::{
    BatchFolderProcessor, Config, DateLogic, FolderGroup, FolderRecord, MemoryManager,
    PipelineEvent, RunStats, SourceFile,
};

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

#[derive(Parser, Debug)]
#[command(name = "snapsort", version, about = "Group a photo tree into folders by capture date")]
struct Args {
    /// Root directory containing the photo folders to organize
    root: PathBuf,

    /// Which photo date names a folder
    #[arg(long, value_enum, default_value_t = DateLogic::Earliest)]
    date_logic: DateLogic,

    /// Files processed concurrently per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Longest thumbnail side in pixels
    #[arg(long)]
    thumb_size: Option<u32>,

    /// Skip files larger than this many bytes
    #[arg(long)]
    max_file_size: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let mut config = Config::load();
    if let Some(n) = args.batch_size {
        config.batch_size = n;
    }
    if let Some(px) = args.thumb_size {
        config.thumbnail_px = px;
    }
    if let Some(bytes) = args.max_file_size {
        config.max_file_size = bytes;
    }

    if !args.root.is_dir() {
        bail!("not a directory: {}", args.root.display());
    }

    let groups = collect_groups(&args.root);
    log::info!(
        "found {} folder(s), {} file(s) under {}",
        groups.len(),
        groups.iter().map(|g| g.files.len()).sum::<usize>(),
        args.root.display()
    );

    let manager = Arc::new(MemoryManager::new(
        &config,
        Some(Box::new(SysinfoSampler::new())),
    ));
    manager.start_monitoring(Duration::from_secs(config.monitor_interval_secs));

    let processor = Arc::new(BatchFolderProcessor::new(manager.clone(), &config));
    let rx = processor.process_groups_background(groups, args.date_logic);

    let mut outcome: Option<(Vec<FolderRecord>, RunStats)> = None;
    let mut failure: Option<String> = None;
    for event in rx {
        match event {
            PipelineEvent::Start { total_folders, total_files } => {
                log::info!("processing {} folders / {} files", total_folders, total_files);
            }
            PipelineEvent::FileProgress { done, total } => {
                print!("\r{}/{} files", done, total);
                let _ = io::stdout().flush();
            }
            PipelineEvent::FolderProgress { done, total } => {
                log::debug!("folder {}/{} complete", done, total);
            }
            PipelineEvent::Done { folders, stats } => outcome = Some((folders, stats)),
            PipelineEvent::Error { message } => failure = Some(message),
        }
    }
    println!();

    manager.cleanup();

    match (outcome, failure) {
        (Some((folders, stats)), _) => {
            print_summary(&folders, &stats);
            Ok(())
        }
        (None, Some(message)) => bail!(message),
        (None, None) => bail!("pipeline ended without a result"),
    }
}

/// Walk the tree and bucket image files by their containing directory.
/// Files directly under the root form their own group.
fn collect_groups(root: &Path) -> Vec<FolderGroup> {
    let mut buckets: BTreeMap<String, Vec<SourceFile>> = BTreeMap::new();

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_image_ext(entry.path()) {
            continue;
        }
        let parent = entry.path().parent().unwrap_or(root);
        let name = match parent.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
            _ => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string()),
        };
        match SourceFile::from_path(entry.path()) {
            Ok(file) => buckets.entry(name).or_default().push(file),
            Err(e) => log::debug!("skipping {}: {}", entry.path().display(), e),
        }
    }

    buckets.into_iter().map(|(name, files)| FolderGroup { name, files }).collect()
}

fn is_image_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn print_summary(folders: &[FolderRecord], stats: &RunStats) {
    println!("{:<32} {:>7}  {:<12}", "Folder", "Photos", "Date");
    for folder in folders {
        println!(
            "{:<32} {:>7}  {:<12}",
            folder.display_name(),
            folder.photos.len(),
            folder.default_name().unwrap_or_else(|| "-".to_string()),
        );
    }
    println!(
        "\n{} folders, {} photos ({} files seen, {} skipped as oversized)",
        folders.len(),
        stats.photos_kept,
        stats.files_seen,
        stats.files_skipped_oversize
    );
}
