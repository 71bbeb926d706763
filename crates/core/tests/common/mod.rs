#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use testbed::config::{Config, Recording, StreamConfig};
use testbed::recording::{Encoder, EncoderFactory, VideoParams};
use testbed::relocate::{MetadataSink, VideoRecord};
use testbed::{Result, TestbedError};

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;
pub const FRAME_LEN: usize = (WIDTH * HEIGHT * 3) as usize;

/// Writes raw frames straight to the output path, optionally failing after
/// `fail_after` frames like a crashed encoder.
struct RawEncoder {
    file: fs::File,
    path: PathBuf,
    written: u64,
    fail_after: Option<u64>,
}

impl Encoder for RawEncoder {
    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_after.is_some_and(|n| self.written >= n) {
            return Err(TestbedError::EncoderExited {
                path: self.path.clone(),
                detail: "broken pipe".into(),
            });
        }
        self.file.write_all(data)?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self, _timeout: Duration) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct RawEncoderFactory {
    pub fail_after: Option<u64>,
}

impl EncoderFactory for RawEncoderFactory {
    fn spawn(&self, output: &Path, _params: &VideoParams) -> Result<Box<dyn Encoder>> {
        Ok(Box::new(RawEncoder {
            file: fs::File::create(output)?,
            path: output.to_path_buf(),
            written: 0,
            fail_after: self.fail_after,
        }))
    }
}

#[derive(Clone, Default)]
pub struct CollectingSink(pub Arc<Mutex<Vec<VideoRecord>>>);

impl MetadataSink for CollectingSink {
    fn report(&self, record: &VideoRecord) -> Result<()> {
        self.0.lock().push(record.clone());
        Ok(())
    }
}

pub fn stream() -> StreamConfig {
    StreamConfig {
        fps: 2.0,
        width: WIDTH,
        height: HEIGHT,
        ..StreamConfig::new("vessel_stream01", "synthetic://bars")
    }
}

/// Two frames per second, two seconds per segment.
pub fn recording(dir: &Path) -> Recording {
    Recording {
        temp_dir: dir.to_path_buf(),
        segment_seconds: 2,
        min_segment_bytes: FRAME_LEN as u64,
        captions: true,
        ..Recording::default()
    }
}

pub fn config(source: &Path, root: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.recording = recording(source);
    config.relocation.final_root = root.to_path_buf();
    Arc::new(config)
}

pub fn noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
}

/// Every file under `dir`, recursively, sorted.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
