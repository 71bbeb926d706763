//! Segment files from first frame to the dated archive, including the
//! crash and failure paths.

mod common;

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use testbed::config::StreamConfig;
use testbed::recording::{SegmentWriter, is_provisional};
use testbed::relocate::{PollWatcher, RelocationService};
use testbed::{Relocator, StopFlag};

#[test]
fn recorded_segments_reach_the_archive_in_pairs() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let config = config(src.path(), root.path());
    let sink = CollectingSink::default();

    let relocator = Relocator::new(config.clone())
        .unwrap()
        .with_sink(Box::new(sink.clone()));
    let watcher = PollWatcher::new(src.path(), Duration::from_millis(20));
    let stop = StopFlag::new();
    let service_stop = stop.clone();
    let service = thread::spawn(move || {
        RelocationService::new(relocator, Box::new(watcher), Duration::from_secs(60))
            .run(&service_stop)
            .unwrap()
    });

    let mut writer = SegmentWriter::new(&stream(), &config.recording, Arc::new(RawEncoderFactory::default()))
        .unwrap()
        .with_clock(noon);
    let mut finalized = Vec::new();
    for i in 0..10u8 {
        let frame = [i; FRAME_LEN];
        if let Some(done) = writer.write_frame(&frame, Some("vesselTest S01")).unwrap() {
            finalized.push(done);
        }
        thread::sleep(Duration::from_millis(5));
    }
    finalized.extend(writer.close().unwrap());
    assert_eq!(finalized.len(), 3);

    let deadline = Instant::now() + Duration::from_secs(10);
    while files_under(root.path()).len() < 6 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    stop.stop();
    let stats = service.join().unwrap();

    let archived = files_under(root.path());
    let names: Vec<String> = archived.iter().map(|p| file_name(p)).collect();
    assert_eq!(
        names,
        [
            "vessel_stream01_250601_120000.mp4",
            "vessel_stream01_250601_120000.srt",
            "vessel_stream01_250601_120001.mp4",
            "vessel_stream01_250601_120001.srt",
            "vessel_stream01_250601_120002.mp4",
            "vessel_stream01_250601_120002.srt",
        ]
    );
    assert!(archived.iter().all(|p| p.starts_with(root.path().join("2025/06/01/12"))));
    assert!(files_under(src.path()).is_empty());
    assert_eq!(stats.moved, 6);
    assert_eq!(stats.failed, 0);

    // Complete frames only: the last segment got the two leftover frames.
    let sizes: Vec<u64> = archived
        .iter()
        .filter(|p| p.extension().is_some_and(|e| e == "mp4"))
        .map(|p| fs::metadata(p).unwrap().len())
        .collect();
    assert_eq!(sizes, [4 * FRAME_LEN as u64, 4 * FRAME_LEN as u64, 2 * FRAME_LEN as u64]);

    let records = sink.0.lock();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.file_ext == "mp4"));
    assert_eq!(records[0].record_start_time, "2025-06-01T12:00:00");
}

#[test]
fn every_video_has_a_caption_finalized_after_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = SegmentWriter::new(&stream(), &recording(dir.path()), Arc::new(RawEncoderFactory::default()))
        .unwrap()
        .with_clock(noon);
    let mut finalized = Vec::new();
    for i in 0..12u8 {
        let caption = format!("frame {i}");
        finalized.extend(writer.write_frame(&[i; FRAME_LEN], Some(&caption)).unwrap());
    }
    assert_eq!(finalized.len(), 3);

    for segment in &finalized {
        let caption = segment.caption.as_ref().unwrap();
        assert_eq!(caption.file_stem(), segment.video.file_stem());
        assert_eq!(caption.extension().unwrap(), "srt");
        let video_mtime = fs::metadata(&segment.video).unwrap().modified().unwrap();
        let caption_mtime = fs::metadata(caption).unwrap().modified().unwrap();
        assert!(caption_mtime >= video_mtime);

        let text = fs::read_to_string(caption).unwrap();
        assert!(text.starts_with("1\n00:00:00,000 --> 00:00:01,000\n"), "{text}");
        assert!(text.contains("00:00:01,000 --> 00:00:02,000"));
    }
    assert!(fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .all(|e| !is_provisional(&e.file_name().to_string_lossy())));
}

#[test]
fn failed_encoder_leaves_provisional_files_that_relocation_ignores() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let config = config(src.path(), root.path());
    let factory = Arc::new(RawEncoderFactory { fail_after: Some(2) });
    let mut writer = SegmentWriter::new(&stream(), &config.recording, factory)
        .unwrap()
        .with_clock(noon);

    writer.write_frame(&[1; FRAME_LEN], Some("a")).unwrap();
    writer.write_frame(&[2; FRAME_LEN], Some("b")).unwrap();
    assert!(writer.write_frame(&[3; FRAME_LEN], Some("c")).is_err());
    assert!(!writer.is_open());

    let left: Vec<String> = files_under(src.path()).iter().map(|p| file_name(p)).collect();
    assert!(!left.is_empty());
    assert!(left.iter().all(|n| is_provisional(n)), "{left:?}");

    let relocator = Relocator::new(config).unwrap();
    assert!(relocator.recover().unwrap().is_empty());
    assert!(files_under(root.path()).is_empty());
}

#[test]
fn recovery_after_restart_is_idempotent() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let relocator = Relocator::new(config(src.path(), root.path())).unwrap();

    for name in [
        "vessel_stream01_250601_120000.mp4",
        "vessel_stream01_250601_120000.srt",
        "vessel_stream02_250601_235959.mkv",
        "temp_vessel_stream01_250601_120500.mp4",
    ] {
        fs::write(src.path().join(name), name.as_bytes()).unwrap();
    }
    // A previous run moved this one already and died before anything else.
    let done = root.path().join("2025/06/01/11/vessel_stream03_250601_110000.mp4");
    fs::create_dir_all(done.parent().unwrap()).unwrap();
    fs::write(&done, b"earlier").unwrap();

    let first = relocator.recover().unwrap();
    assert_eq!(first.len(), 3);
    let after_first = files_under(root.path());

    let second = relocator.recover().unwrap();
    assert!(second.is_empty());
    assert_eq!(files_under(root.path()), after_first);

    let names: Vec<String> = after_first.iter().map(|p| file_name(p)).collect();
    assert_eq!(
        names,
        [
            "vessel_stream03_250601_110000.mp4",
            "vessel_stream01_250601_120000.mp4",
            "vessel_stream01_250601_120000.srt",
            "vessel_stream02_250601_235959.mkv",
        ]
    );
    assert_eq!(
        files_under(src.path()),
        [src.path().join("temp_vessel_stream01_250601_120500.mp4")]
    );
}

#[test]
fn stream_named_like_a_provisional_file_is_refused() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let config = config(src.path(), root.path());
    let stream = StreamConfig {
        name: "temp_cam".into(),
        ..stream()
    };

    let mut with_stream = (*config).clone();
    with_stream.streams.push(stream.clone());
    assert!(with_stream.validate().is_err());
    assert!(
        SegmentWriter::new(&stream, &config.recording, Arc::new(RawEncoderFactory::default())).is_err()
    );
    assert!(files_under(src.path()).is_empty());
}
