//! SRT caption file paired with one video segment.
//!
//! Frames are grouped into one-second buckets by their index in the
//! segment; each bucket becomes one cue carrying the text recorded with
//! its first frame. A cue is written once the next bucket starts, and the
//! last one at [`CaptionWriter::finish`], clamped to the segment duration.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

use super::naming::final_path_of;

struct PendingCue {
    bucket: u64,
    text: String,
}

pub struct CaptionWriter {
    provisional: PathBuf,
    out: BufWriter<File>,
    fps: f64,
    cues: u32,
    pending: Option<PendingCue>,
}

impl CaptionWriter {
    /// Create the provisional caption file. `path` must carry the
    /// provisional prefix.
    pub fn create(path: &Path, fps: f64) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            provisional: path.to_path_buf(),
            out: BufWriter::new(file),
            fps,
            cues: 0,
            pending: None,
        })
    }

    pub fn provisional_path(&self) -> &Path {
        &self.provisional
    }

    /// Number of cues written so far.
    pub fn cues(&self) -> u32 {
        self.cues
    }

    /// Record the caption text for frame `frame_index` of the segment.
    pub fn record(&mut self, frame_index: u64, text: &str) -> Result<()> {
        let bucket = (frame_index as f64 / self.fps).floor() as u64;
        if self.pending.as_ref().is_some_and(|p| p.bucket == bucket) {
            return Ok(());
        }
        self.flush_pending(Duration::from_secs(bucket))?;
        self.pending = Some(PendingCue {
            bucket,
            text: text.to_string(),
        });
        Ok(())
    }

    /// Write the last cue, sync and rename to the final name.
    pub fn finish(mut self, duration: Duration) -> Result<PathBuf> {
        if let Some(bucket) = self.pending.as_ref().map(|p| p.bucket) {
            let start = Duration::from_secs(bucket);
            let end = (start + Duration::from_secs(1)).min(duration).max(start);
            self.flush_pending(end)?;
        }
        self.out.flush()?;
        self.out.get_ref().sync_all()?;

        let final_path = final_path_of(&self.provisional).unwrap_or_else(|| self.provisional.clone());
        fs::rename(&self.provisional, &final_path)?;
        tracing::debug!(caption = %final_path.display(), cues = self.cues, "caption finalized");
        Ok(final_path)
    }

    /// Stop writing; the provisional file stays behind with its video.
    pub fn abandon(mut self) -> PathBuf {
        let _ = self.out.flush();
        self.provisional
    }

    fn flush_pending(&mut self, end: Duration) -> Result<()> {
        let Some(cue) = self.pending.take() else {
            return Ok(());
        };
        self.cues += 1;
        write!(
            self.out,
            "{}\n{} --> {}\n{}\n\n",
            self.cues,
            srt_time(Duration::from_secs(cue.bucket)),
            srt_time(end),
            cue.text
        )?;
        Ok(())
    }
}

/// `HH:MM:SS,mmm`
pub fn srt_time(t: Duration) -> String {
    let ms = t.as_millis();
    format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srt_timestamps() {
        assert_eq!(srt_time(Duration::ZERO), "00:00:00,000");
        assert_eq!(srt_time(Duration::from_millis(3_723_045)), "01:02:03,045");
    }

    #[test]
    fn one_cue_per_second_and_final_rename() {
        let dir = tempfile::tempdir().unwrap();
        let provisional = dir.path().join("temp_cam_250101_000000.srt");
        let mut writer = CaptionWriter::create(&provisional, 2.0).unwrap();
        for frame in 0..5u64 {
            writer.record(frame, &format!("text {frame}")).unwrap();
        }
        let final_path = writer.finish(Duration::from_millis(2500)).unwrap();

        assert_eq!(final_path, dir.path().join("cam_250101_000000.srt"));
        assert!(!provisional.exists());
        let body = fs::read_to_string(&final_path).unwrap();
        assert_eq!(
            body,
            "1\n00:00:00,000 --> 00:00:01,000\ntext 0\n\n\
             2\n00:00:01,000 --> 00:00:02,000\ntext 2\n\n\
             3\n00:00:02,000 --> 00:00:02,500\ntext 4\n\n"
        );
    }

    #[test]
    fn empty_caption_still_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let provisional = dir.path().join("temp_cam_250101_000000.srt");
        let writer = CaptionWriter::create(&provisional, 15.0).unwrap();
        let final_path = writer.finish(Duration::ZERO).unwrap();
        assert_eq!(fs::read_to_string(final_path).unwrap(), "");
    }

    #[test]
    fn abandon_keeps_provisional() {
        let dir = tempfile::tempdir().unwrap();
        let provisional = dir.path().join("temp_cam_250101_000000.srt");
        let mut writer = CaptionWriter::create(&provisional, 15.0).unwrap();
        writer.record(0, "x").unwrap();
        assert_eq!(writer.abandon(), provisional);
        assert!(provisional.exists());
    }
}
