//! Per-stream segment writer.
//!
//! Owns at most one open segment. A segment is opened lazily by the first
//! frame, grows by one frame per [`SegmentWriter::write_frame`] and is
//! closed once it holds `segment_seconds × fps` frames or the stream stops.
//! Closing is ordered so that the final name only ever appears on a
//! complete file:
//!
//! 1. encoder input closed, exit awaited (bounded)
//! 2. output size checked against `min_segment_bytes`
//! 3. video renamed provisional → final
//! 4. caption finished and renamed

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};

use crate::config::{Recording, StreamConfig};
use crate::error::{Result, TestbedError};

use super::caption::CaptionWriter;
use super::encoder::{Encoder, EncoderFactory, VideoParams};
use super::naming::{CAPTION_EXTENSION, SegmentName};

type Clock = Box<dyn Fn() -> NaiveDateTime + Send>;

/// A segment whose video (and caption) carry their final names.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedSegment {
    pub video: PathBuf,
    pub caption: Option<PathBuf>,
    /// Captions were on but the caption could not be finalized; the video
    /// has no partner.
    pub caption_failed: bool,
    pub started: NaiveDateTime,
    pub frames: u64,
    pub duration: Duration,
    pub size: u64,
}

struct OpenSegment {
    name: SegmentName,
    provisional: PathBuf,
    encoder: Box<dyn Encoder>,
    caption: Option<CaptionWriter>,
    frames: u64,
}

pub struct SegmentWriter {
    stream: String,
    dir: PathBuf,
    extension: &'static str,
    params: VideoParams,
    budget: u64,
    min_bytes: u64,
    close_timeout: Duration,
    captions: bool,
    factory: Arc<dyn EncoderFactory>,
    clock: Clock,
    current: Option<OpenSegment>,
    last_started: Option<NaiveDateTime>,
}

impl SegmentWriter {
    pub fn new(
        stream: &StreamConfig,
        recording: &Recording,
        factory: Arc<dyn EncoderFactory>,
    ) -> Result<Self> {
        stream.validate_name()?;
        fs::create_dir_all(&recording.temp_dir)?;
        Ok(Self {
            stream: stream.name.clone(),
            dir: recording.temp_dir.clone(),
            extension: recording.container.extension(),
            params: VideoParams {
                width: stream.width,
                height: stream.height,
                fps: stream.fps,
            },
            budget: stream.frames_per_segment(recording.segment_seconds),
            min_bytes: recording.min_segment_bytes,
            close_timeout: recording.close_timeout(),
            captions: recording.captions,
            factory,
            clock: Box::new(|| Local::now().naive_local()),
            current: None,
            last_started: None,
        })
    }

    /// Replace the wall clock used for segment names.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn params(&self) -> &VideoParams {
        &self.params
    }

    /// Frame budget of one segment.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Provisional path of the open segment.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.provisional.as_path())
    }

    /// Append one frame, opening a segment if none is open. Returns the
    /// finalized segment when this frame exhausted the budget.
    ///
    /// An encoder failure abandons the open segment (its provisional files
    /// stay in place) and is returned; the next call opens a fresh one.
    pub fn write_frame(
        &mut self,
        data: &[u8],
        caption: Option<&str>,
    ) -> Result<Option<FinalizedSegment>> {
        let expected = self.params.frame_len();
        if data.len() != expected {
            return Err(TestbedError::FrameSize {
                expected,
                actual: data.len(),
            });
        }

        if self.current.is_none() {
            self.open()?;
        }
        let Some(segment) = self.current.as_mut() else {
            return Ok(None);
        };

        let written = segment.encoder.write_frame(data).and_then(|()| {
            match (segment.caption.as_mut(), caption) {
                (Some(writer), Some(text)) => writer.record(segment.frames, text),
                _ => Ok(()),
            }
        });
        if let Err(e) = written {
            self.abandon(&e);
            return Err(e);
        }

        segment.frames += 1;
        if segment.frames >= self.budget {
            return self.close();
        }
        Ok(None)
    }

    /// Finalize the open segment, if any.
    pub fn close(&mut self) -> Result<Option<FinalizedSegment>> {
        let Some(mut segment) = self.current.take() else {
            return Ok(None);
        };

        if let Err(e) = segment.encoder.finish(self.close_timeout) {
            abandon_caption(segment.caption);
            tracing::warn!(stream = %self.stream, segment = %segment.provisional.display(), error = %e, "segment failed");
            return Err(e);
        }

        let size = match fs::metadata(&segment.provisional) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size < self.min_bytes {
            abandon_caption(segment.caption);
            tracing::warn!(stream = %self.stream, segment = %segment.provisional.display(), size, "segment too small, not finalized");
            return Err(TestbedError::SegmentTooSmall {
                path: segment.provisional,
                size,
            });
        }

        let video = self.dir.join(segment.name.file_name());
        fs::rename(&segment.provisional, &video)?;

        let duration = Duration::from_secs_f64(segment.frames as f64 / self.params.fps);
        let (caption, caption_failed) = match segment.caption.map(|writer| writer.finish(duration)) {
            Some(Ok(path)) => (Some(path), false),
            Some(Err(e)) => {
                tracing::warn!(stream = %self.stream, video = %video.display(), error = %e, "caption finalize failed, video unpaired");
                (None, true)
            }
            None => (None, false),
        };

        tracing::info!(
            stream = %self.stream,
            video = %video.display(),
            frames = segment.frames,
            size,
            "segment finalized"
        );

        Ok(Some(FinalizedSegment {
            video,
            caption,
            caption_failed,
            started: segment.name.started,
            frames: segment.frames,
            duration,
            size,
        }))
    }

    fn open(&mut self) -> Result<()> {
        let mut started = (self.clock)();
        if let Some(last) = self.last_started {
            if started <= last {
                started = last + TimeDelta::seconds(1);
            }
        }
        let mut name = SegmentName::new(&self.stream, started, self.extension);
        while self.dir.join(name.file_name()).exists()
            || self.dir.join(name.provisional_file_name()).exists()
        {
            name.started += TimeDelta::seconds(1);
        }

        let provisional = self.dir.join(name.provisional_file_name());
        let caption = if self.captions {
            let caption_name = name.with_extension(CAPTION_EXTENSION);
            let path = self.dir.join(caption_name.provisional_file_name());
            Some(CaptionWriter::create(&path, self.params.fps)?)
        } else {
            None
        };

        let encoder = match self.factory.spawn(&provisional, &self.params) {
            Ok(encoder) => encoder,
            Err(e) => {
                if let Some(writer) = caption {
                    let _ = fs::remove_file(writer.abandon());
                }
                return Err(e);
            }
        };

        tracing::debug!(stream = %self.stream, segment = %provisional.display(), budget = self.budget, "segment opened");
        self.last_started = Some(name.started);
        self.current = Some(OpenSegment {
            name,
            provisional,
            encoder,
            caption,
            frames: 0,
        });
        Ok(())
    }

    fn abandon(&mut self, error: &TestbedError) {
        if let Some(segment) = self.current.take() {
            tracing::warn!(
                stream = %self.stream,
                segment = %segment.provisional.display(),
                frames = segment.frames,
                error = %error,
                "segment failed, left provisional"
            );
            abandon_caption(segment.caption);
        }
    }
}

fn abandon_caption(caption: Option<CaptionWriter>) {
    if let Some(writer) = caption {
        writer.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::naming::is_provisional;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::io::Write;

    /// Writes frames straight into the output file; can be told to fail.
    struct FileEncoder {
        file: fs::File,
        fail_after: Option<u64>,
        written: u64,
        path: PathBuf,
    }

    impl Encoder for FileEncoder {
        fn write_frame(&mut self, data: &[u8]) -> Result<()> {
            if self.fail_after.is_some_and(|n| self.written >= n) {
                return Err(TestbedError::EncoderExited {
                    path: self.path.clone(),
                    detail: "exited with 1".into(),
                });
            }
            self.file.write_all(data)?;
            self.written += 1;
            Ok(())
        }

        fn finish(&mut self, _timeout: Duration) -> Result<()> {
            self.file.flush()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FileEncoderFactory {
        fail_after: Option<u64>,
        spawned: Mutex<Vec<PathBuf>>,
    }

    impl EncoderFactory for FileEncoderFactory {
        fn spawn(&self, output: &Path, _params: &VideoParams) -> Result<Box<dyn Encoder>> {
            self.spawned.lock().push(output.to_path_buf());
            Ok(Box::new(FileEncoder {
                file: fs::File::create(output)?,
                fail_after: self.fail_after,
                written: 0,
                path: output.to_path_buf(),
            }))
        }
    }

    fn stream() -> StreamConfig {
        StreamConfig {
            name: "vessel_stream01".into(),
            source: "synthetic://bars".into(),
            fps: 2.0,
            width: 4,
            height: 2,
            transform: None,
        }
    }

    fn recording(dir: &Path) -> Recording {
        Recording {
            temp_dir: dir.to_path_buf(),
            segment_seconds: 2,
            min_segment_bytes: 24,
            ..Recording::default()
        }
    }

    fn fixed_clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn budget_closes_and_finalizes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let mut writer = SegmentWriter::new(&stream(), &recording(dir.path()), factory)
            .unwrap()
            .with_clock(fixed_clock);
        assert_eq!(writer.budget(), 4);

        let frame = [7u8; 24];
        for _ in 0..3 {
            assert_eq!(writer.write_frame(&frame, Some("caption")).unwrap(), None);
        }
        assert!(writer.is_open());
        assert!(is_provisional(
            writer.current_path().unwrap().file_name().unwrap().to_str().unwrap()
        ));

        let done = writer.write_frame(&frame, Some("caption")).unwrap().unwrap();
        assert!(!writer.is_open());
        assert_eq!(done.frames, 4);
        assert_eq!(done.size, 96);
        assert_eq!(done.duration, Duration::from_secs(2));
        assert_eq!(
            names(dir.path()),
            vec![
                "vessel_stream01_250601_120000.mp4",
                "vessel_stream01_250601_120000.srt"
            ]
        );
    }

    #[test]
    fn same_second_segments_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let mut writer = SegmentWriter::new(&stream(), &recording(dir.path()), factory)
            .unwrap()
            .with_clock(fixed_clock);
        let frame = [0u8; 24];
        for _ in 0..8 {
            writer.write_frame(&frame, None).unwrap();
        }
        let videos: Vec<String> = names(dir.path())
            .into_iter()
            .filter(|n| n.ends_with(".mp4"))
            .collect();
        assert_eq!(
            videos,
            vec![
                "vessel_stream01_250601_120000.mp4",
                "vessel_stream01_250601_120001.mp4"
            ]
        );
    }

    #[test]
    fn encoder_failure_leaves_provisional_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory {
            fail_after: Some(2),
            ..Default::default()
        });
        let mut writer = SegmentWriter::new(&stream(), &recording(dir.path()), factory.clone())
            .unwrap()
            .with_clock(fixed_clock);
        let frame = [1u8; 24];
        writer.write_frame(&frame, Some("a")).unwrap();
        writer.write_frame(&frame, Some("a")).unwrap();
        assert!(matches!(
            writer.write_frame(&frame, Some("a")),
            Err(TestbedError::EncoderExited { .. })
        ));
        assert!(!writer.is_open());
        assert!(names(dir.path()).iter().all(|n| is_provisional(n)));

        writer.write_frame(&frame, Some("a")).unwrap();
        assert_eq!(factory.spawned.lock().len(), 2);
    }

    #[test]
    fn short_segment_is_not_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let mut rec = recording(dir.path());
        rec.min_segment_bytes = 1000;
        let mut writer = SegmentWriter::new(&stream(), &rec, factory)
            .unwrap()
            .with_clock(fixed_clock);
        writer.write_frame(&[0u8; 24], Some("x")).unwrap();
        assert!(matches!(
            writer.close(),
            Err(TestbedError::SegmentTooSmall { size: 24, .. })
        ));
        assert!(names(dir.path()).iter().all(|n| is_provisional(n)));
        assert_eq!(writer.close().unwrap(), None);
    }

    #[test]
    fn wrong_frame_size_is_rejected_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let mut writer = SegmentWriter::new(&stream(), &recording(dir.path()), factory).unwrap();
        assert!(matches!(
            writer.write_frame(&[0u8; 10], None),
            Err(TestbedError::FrameSize { expected: 24, actual: 10 })
        ));
        assert!(!writer.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn lost_caption_marks_segment_unpaired() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let mut writer = SegmentWriter::new(&stream(), &recording(dir.path()), factory)
            .unwrap()
            .with_clock(fixed_clock);
        writer.write_frame(&[3u8; 24], Some("x")).unwrap();
        fs::remove_file(dir.path().join("temp_vessel_stream01_250601_120000.srt")).unwrap();

        let done = writer.close().unwrap().unwrap();
        assert!(done.caption_failed);
        assert_eq!(done.caption, None);
        assert!(done.video.exists());
        assert_eq!(names(dir.path()), vec!["vessel_stream01_250601_120000.mp4"]);
    }

    #[test]
    fn provisional_stream_name_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let stream = StreamConfig {
            name: "temp_cam".into(),
            ..stream()
        };
        assert!(matches!(
            SegmentWriter::new(&stream, &recording(dir.path()), factory),
            Err(TestbedError::Config(_))
        ));
        assert!(names(dir.path()).is_empty());
    }

    #[test]
    fn captions_disabled_writes_video_only() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FileEncoderFactory::default());
        let mut rec = recording(dir.path());
        rec.captions = false;
        let mut writer = SegmentWriter::new(&stream(), &rec, factory)
            .unwrap()
            .with_clock(fixed_clock);
        writer.write_frame(&[0u8; 24], Some("x")).unwrap();
        let done = writer.close().unwrap().unwrap();
        assert_eq!(done.caption, None);
        assert!(!done.caption_failed);
        assert_eq!(names(dir.path()), vec!["vessel_stream01_250601_120000.mp4"]);
    }
}
