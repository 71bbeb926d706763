//! Segment file naming.
//!
//! Finalized segments are named `<stream>_<YYMMDD>_<HHMMSS>.<ext>`, where
//! the timestamp is the local wall-clock time the segment was opened.
//! While a segment is being written its name carries the
//! [`PROVISIONAL_PREFIX`]; removing the prefix by `rename` is the hand-off
//! signal to the relocation service.

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Result, TestbedError};

/// Marks a file that is still being written.
pub const PROVISIONAL_PREFIX: &str = "temp_";

/// Extension of caption files.
pub const CAPTION_EXTENSION: &str = "srt";

/// Replace everything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_stream_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether a file name carries the provisional marker.
pub fn is_provisional(file_name: &str) -> bool {
    file_name.starts_with(PROVISIONAL_PREFIX)
}

/// Components of a segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub stream: String,
    pub started: NaiveDateTime,
    pub extension: String,
}

impl SegmentName {
    pub fn new(stream: &str, started: NaiveDateTime, extension: &str) -> Self {
        Self {
            stream: sanitize_stream_name(stream),
            started,
            extension: extension.to_string(),
        }
    }

    /// Final (non-provisional) file name.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            self.stream,
            self.started.format("%y%m%d_%H%M%S"),
            self.extension
        )
    }

    pub fn provisional_file_name(&self) -> String {
        format!("{PROVISIONAL_PREFIX}{}", self.file_name())
    }

    /// Same stream and time with another extension (e.g. the caption).
    pub fn with_extension(&self, extension: &str) -> Self {
        Self {
            extension: extension.to_string(),
            ..self.clone()
        }
    }

    /// Parse a final file name. Provisional names are rejected.
    pub fn parse(file_name: &str) -> Result<Self> {
        let unrecognized = || TestbedError::UnrecognizedName(file_name.to_string());

        if is_provisional(file_name) {
            return Err(unrecognized());
        }
        let (stem, extension) = file_name.rsplit_once('.').ok_or_else(unrecognized)?;
        let mut parts = stem.rsplitn(3, '_');
        let time = parts.next().ok_or_else(unrecognized)?;
        let date = parts.next().ok_or_else(unrecognized)?;
        let stream = parts.next().filter(|s| !s.is_empty()).ok_or_else(unrecognized)?;

        let started = parse_timestamp(date, time).ok_or_else(unrecognized)?;
        if extension.is_empty() {
            return Err(unrecognized());
        }

        Ok(Self {
            stream: stream.to_string(),
            started,
            extension: extension.to_string(),
        })
    }

    /// Archive subdirectory `YYYY/MM/DD/HH` of this segment.
    pub fn dated_dir(&self) -> PathBuf {
        let t = self.started;
        PathBuf::from(format!("{:04}", t.year()))
            .join(format!("{:02}", t.month()))
            .join(format!("{:02}", t.day()))
            .join(format!("{:02}", t.hour()))
    }
}

/// `YYMMDD`, `HHMMSS` → timestamp in the 2000s.
fn parse_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    if date.len() != 6 || time.len() != 6 {
        return None;
    }
    if !date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |s: &str, i: usize| s[i..i + 2].parse::<u32>().ok();
    NaiveDate::from_ymd_opt(2000 + field(date, 0)? as i32, field(date, 2)?, field(date, 4)?)?
        .and_hms_opt(field(time, 0)?, field(time, 2)?, field(time, 4)?)
}

/// Path of the final file for a provisional path (prefix removed).
pub fn final_path_of(provisional: &Path) -> Option<PathBuf> {
    let name = provisional.file_name()?.to_str()?;
    let stripped = name.strip_prefix(PROVISIONAL_PREFIX)?;
    Some(provisional.with_file_name(stripped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn name_format() {
        let name = SegmentName::new("vessel_stream01", at(2025, 3, 7, 9, 5, 1), "mp4");
        assert_eq!(name.file_name(), "vessel_stream01_250307_090501.mp4");
        assert_eq!(
            name.provisional_file_name(),
            "temp_vessel_stream01_250307_090501.mp4"
        );
        assert_eq!(
            name.with_extension("srt").file_name(),
            "vessel_stream01_250307_090501.srt"
        );
    }

    #[test]
    fn stream_name_is_sanitized() {
        let name = SegmentName::new("my ship/cam 1", at(2025, 1, 1, 0, 0, 0), "mkv");
        assert_eq!(name.stream, "my_ship_cam_1");
    }

    #[test]
    fn parse_roundtrip_and_dated_dir() {
        let parsed = SegmentName::parse("vessel_stream01_241231_235959.mp4").unwrap();
        assert_eq!(parsed.stream, "vessel_stream01");
        assert_eq!(parsed.started, at(2024, 12, 31, 23, 59, 59));
        assert_eq!(parsed.extension, "mp4");
        assert_eq!(parsed.dated_dir(), PathBuf::from("2024/12/31/23"));
    }

    #[test]
    fn parse_rejects_bad_names() {
        assert!(SegmentName::parse("temp_cam_250101_000000.mp4").is_err());
        assert!(SegmentName::parse("cam_250101.mp4").is_err());
        assert!(SegmentName::parse("cam_251301_000000.mp4").is_err());
        assert!(SegmentName::parse("cam_250101_000000").is_err());
        assert!(SegmentName::parse("_250101_000000.mp4").is_err());
        assert!(SegmentName::parse("notes.txt").is_err());
    }

    #[test]
    fn final_path_strips_prefix() {
        let p = Path::new("/tmp/out/temp_cam_250101_000000.mp4");
        assert_eq!(
            final_path_of(p),
            Some(PathBuf::from("/tmp/out/cam_250101_000000.mp4"))
        );
        assert_eq!(final_path_of(Path::new("/tmp/cam.mp4")), None);
    }
}
