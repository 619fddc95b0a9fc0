//! EXIF capture-date extraction. Failures here are never fatal: a photo
//! without a readable date simply sorts as undated.

use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use exif::{In, Tag, Value};

use crate::SourceFile;

/// Seam for the metadata collaborator: the pipeline only needs "a date or
/// nothing" per file, so tests can stub this without crafting EXIF blobs.
pub trait CaptureDateSource: Send + Sync {
    fn capture_date(&self, file: &SourceFile, bytes: &[u8]) -> Option<DateTime<Utc>>;
}

/// Production implementation backed by kamadak-exif.
#[derive(Debug, Default)]
pub struct ExifDateSource;

impl CaptureDateSource for ExifDateSource {
    fn capture_date(&self, file: &SourceFile, bytes: &[u8]) -> Option<DateTime<Utc>> {
        extract_capture_date(&file.path, Some(bytes))
    }
}

/// Read EXIF data from a file path or preloaded bytes
pub fn read_exif_data(path: &Path, preloaded_bytes: Option<&[u8]>) -> Option<exif::Exif> {
    trait BufReadSeek: std::io::BufRead + std::io::Seek {}
    impl<T: std::io::BufRead + std::io::Seek> BufReadSeek for T {}

    let mut reader: Box<dyn BufReadSeek> = match preloaded_bytes {
        Some(bytes) => Box::new(std::io::Cursor::new(bytes)),
        None => {
            let file = std::fs::File::open(path).ok()?;
            Box::new(std::io::BufReader::new(file))
        }
    };

    exif::Reader::new().read_from_container(&mut reader).ok()
}

/// Capture date with the usual fallback chain: DateTimeOriginal, then
/// DateTimeDigitized. Returns None when neither parses.
pub fn extract_capture_date(path: &Path, preloaded_bytes: Option<&[u8]>) -> Option<DateTime<Utc>> {
    let exif = read_exif_data(path, preloaded_bytes)?;
    parse_exif_datetime_tag(&exif, Tag::DateTimeOriginal)
        .or_else(|| parse_exif_datetime_tag(&exif, Tag::DateTimeDigitized))
}

/// Parse an EXIF DateTime tag ("YYYY:MM:DD HH:MM:SS") to a UTC timestamp.
fn parse_exif_datetime_tag(exif: &exif::Exif, tag: Tag) -> Option<DateTime<Utc>> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    if let Value::Ascii(ref vec) = field.value
        && !vec.is_empty()
        && let Ok(dt) = exif::DateTime::from_ascii(&vec[0])
    {
        let date = NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?;
        let time = NaiveTime::from_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32)?;
        return Some(NaiveDateTime::new(date, time).and_utc());
    }
    None
}
