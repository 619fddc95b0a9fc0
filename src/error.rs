use thiserror::Error;

/// Per-file thumbnail failures. Non-fatal to a run: the photo is dropped.
#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("failed to decode image '{name}': {reason}")]
    Decode { name: String, reason: String },

    #[error("failed to acquire render surface for '{name}': {reason}")]
    Context { name: String, reason: String },

    #[error("failed to read '{name}': {source}")]
    Read {
        name: String,
        source: std::io::Error,
    },
}

/// Run-level failures from the folder pipeline.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no sub-folders found in input")]
    NoSubFolders,

    #[error("no images found in input")]
    NoImages,

    #[error("a processing run is already in progress")]
    Busy,

    #[error("batch processing failed: {0}")]
    Batch(String),
}
