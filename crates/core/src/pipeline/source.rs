//! Frame sources: decoded RTSP/file input via an `ffmpeg` subprocess, or
//! a synthetic test pattern.

use std::io::{self, ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::config::StreamConfig;
use crate::error::{Result, TestbedError};
use crate::recording::VideoParams;

pub const SYNTHETIC_SCHEME: &str = "synthetic://";

/// Produces raw `bgr24` frames of a fixed geometry.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<()>;

    /// Fill `buf` with exactly one frame.
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<()>;

    fn disconnect(&mut self);
}

/// Pick the source implementation for a stream. `read_timeout` bounds
/// every wait for a decoded frame.
pub fn open_source(
    stream: &StreamConfig,
    decoder_binary: &str,
    read_timeout: Duration,
) -> Box<dyn FrameSource> {
    let params = VideoParams {
        width: stream.width,
        height: stream.height,
        fps: stream.fps,
    };
    if stream.source.to_ascii_lowercase().starts_with(SYNTHETIC_SCHEME) {
        Box::new(SyntheticSource::new(params))
    } else {
        Box::new(
            FfmpegSource::new(&stream.source, params, decoder_binary).with_read_timeout(read_timeout),
        )
    }
}

type DecodedFrame = io::Result<Vec<u8>>;

/// Decodes a URL or file with `ffmpeg`, scaled to the stream geometry.
///
/// The decoder's stdout is drained on a helper thread, so a decoder that
/// stays alive without producing frames surfaces as
/// [`TestbedError::Timeout`] after `read_timeout` instead of blocking the
/// receiver.
pub struct FfmpegSource {
    source: String,
    params: VideoParams,
    binary: String,
    read_timeout: Duration,
    child: Option<Child>,
    frames: Option<Receiver<DecodedFrame>>,
}

impl FfmpegSource {
    pub fn new(source: &str, params: VideoParams, binary: &str) -> Self {
        Self {
            source: source.to_string(),
            params,
            binary: binary.to_string(),
            read_timeout: Duration::from_secs(5),
            child: None,
            frames: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn arguments(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if self.source.to_ascii_lowercase().starts_with("rtsp://") {
            // Socket I/O timeout, in microseconds.
            args.extend([
                "-rtsp_transport".into(),
                "udp".into(),
                "-timeout".into(),
                self.read_timeout.as_micros().to_string(),
            ]);
        } else {
            // Local files loop in real time.
            args.extend(["-re".into(), "-stream_loop".into(), "-1".into()]);
        }
        args.extend([
            "-i".into(),
            self.source.clone(),
            "-an".into(),
            "-vf".into(),
            format!("scale={}:{}", self.params.width, self.params.height),
            "-r".into(),
            self.params.fps.to_string(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-".into(),
        ]);
        args
    }
}

impl FrameSource for FfmpegSource {
    fn describe(&self) -> String {
        self.source.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let mut child = Command::new(&self.binary)
            .args(self.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => TestbedError::BinaryMissing(self.binary.clone()),
                _ => TestbedError::SourceExited(format!("{}: {e}", self.source)),
            })?;
        let stdout = child.stdout.take();
        self.child = Some(child);
        let Some(stdout) = stdout else {
            self.disconnect();
            return Err(TestbedError::SourceExited(format!("{}: no decoder output", self.source)));
        };

        let (tx, rx) = bounded(2);
        let frame_len = self.params.frame_len();
        let spawned = thread::Builder::new()
            .name("decode-pipe".into())
            .spawn(move || pump_frames(stdout, frame_len, tx));
        if let Err(e) = spawned {
            self.disconnect();
            return Err(e.into());
        }
        self.frames = Some(rx);
        tracing::debug!(source = %self.source, read_timeout = ?self.read_timeout, "decoder started");
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<()> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(TestbedError::SourceExited(format!("{}: not connected", self.source)));
        };
        match frames.recv_timeout(self.read_timeout) {
            Ok(Ok(data)) if data.len() == buf.len() => {
                buf.copy_from_slice(&data);
                Ok(())
            }
            Ok(Ok(data)) => Err(TestbedError::FrameSize {
                expected: buf.len(),
                actual: data.len(),
            }),
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(TestbedError::SourceExited(
                format!("{}: end of stream", self.source),
            )),
            Ok(Err(e)) => Err(TestbedError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Err(TestbedError::Timeout("decoded frame")),
            Err(RecvTimeoutError::Disconnected) => Err(TestbedError::SourceExited(format!(
                "{}: decoder output closed",
                self.source
            ))),
        }
    }

    fn disconnect(&mut self) {
        // Killing the decoder closes the pipe, which ends the pump thread.
        self.frames = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Read whole frames until the pipe fails or nobody listens.
fn pump_frames(mut stdout: ChildStdout, frame_len: usize, frames: Sender<DecodedFrame>) {
    loop {
        let mut data = vec![0u8; frame_len];
        let result = stdout.read_exact(&mut data).map(|()| data);
        let failed = result.is_err();
        if frames.send(result).is_err() || failed {
            return;
        }
    }
}

/// Moving color bars with a sweeping bright column.
pub struct SyntheticSource {
    params: VideoParams,
    tick: u64,
    connected: bool,
}

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [0, 192, 192],
    [192, 192, 0],
    [0, 192, 0],
    [192, 0, 192],
    [0, 0, 192],
    [192, 0, 0],
];

impl SyntheticSource {
    pub fn new(params: VideoParams) -> Self {
        Self {
            params,
            tick: 0,
            connected: false,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{SYNTHETIC_SCHEME}{}x{}", self.params.width, self.params.height)
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.connected {
            return Err(TestbedError::SourceExited("synthetic source not connected".into()));
        }
        let expected = self.params.frame_len();
        if buf.len() != expected {
            return Err(TestbedError::FrameSize {
                expected,
                actual: buf.len(),
            });
        }

        let width = self.params.width.max(1) as usize;
        let sweep = (self.tick as usize * 4) % width;
        for (i, px) in buf.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            if x == sweep {
                px.copy_from_slice(&[255, 255, 255]);
            } else {
                px.copy_from_slice(&BARS[x * BARS.len() / width]);
            }
        }
        self.tick += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn params() -> VideoParams {
        VideoParams {
            width: 14,
            height: 2,
            fps: 10.0,
        }
    }

    #[test]
    fn synthetic_frames_move() {
        let mut source = SyntheticSource::new(params());
        let mut a = vec![0u8; params().frame_len()];
        let mut b = a.clone();
        assert!(source.read_frame(&mut a).is_err());
        source.connect().unwrap();
        source.read_frame(&mut a).unwrap();
        source.read_frame(&mut b).unwrap();
        assert_ne!(a, b);
        assert_eq!(&a[0..3], &[255, 255, 255]);
        assert_eq!(&b[12..15], &[255, 255, 255]);
    }

    #[test]
    fn synthetic_checks_buffer_size() {
        let mut source = SyntheticSource::new(params());
        source.connect().unwrap();
        assert!(matches!(
            source.read_frame(&mut [0u8; 3]),
            Err(TestbedError::FrameSize { .. })
        ));
    }

    #[test]
    fn decoder_arguments_by_source_kind() {
        let rtsp = FfmpegSource::new("rtsp://127.0.0.1:8554/live", params(), "ffmpeg");
        let args = rtsp.arguments().join(" ");
        assert!(args.contains("-rtsp_transport udp -timeout 5000000 -i rtsp://127.0.0.1:8554/live"));
        assert!(args.ends_with("-vf scale=14:2 -r 10 -f rawvideo -pix_fmt bgr24 -"));

        let file = FfmpegSource::new("/data/clip.mp4", params(), "ffmpeg");
        assert!(file.arguments().join(" ").contains("-re -stream_loop -1 -i /data/clip.mp4"));
        assert!(!file.arguments().contains(&"-timeout".to_string()));

        let quick = FfmpegSource::new("rtsp://h/live", params(), "ffmpeg")
            .with_read_timeout(Duration::from_millis(250));
        assert!(quick.arguments().join(" ").contains("-timeout 250000 "));
    }

    /// A decoder that starts, stays alive and never writes a byte.
    #[cfg(unix)]
    fn silent_decoder(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("silent-decoder");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn silent_decoder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let binary = silent_decoder(dir.path());
        let mut source = FfmpegSource::new("rtsp://10.255.255.1:8554/live", params(), &binary)
            .with_read_timeout(Duration::from_millis(200));
        // A just-written script can be briefly busy while another test forks.
        let mut started = false;
        for _ in 0..20 {
            if source.connect().is_ok() {
                started = true;
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(started);

        let mut buf = vec![0u8; params().frame_len()];
        let begin = Instant::now();
        assert!(matches!(source.read_frame(&mut buf), Err(TestbedError::Timeout(_))));
        assert!(begin.elapsed() < Duration::from_secs(5));
        source.disconnect();
        assert!(matches!(source.read_frame(&mut buf), Err(TestbedError::SourceExited(_))));
    }

    #[cfg(unix)]
    #[test]
    fn receiver_on_silent_decoder_honors_stop() {
        use crate::config::DropPolicy;
        use crate::pipeline::{PipelineStats, StopFlag, StreamReceiver, frame_queue};

        let dir = tempfile::tempdir().unwrap();
        let binary = silent_decoder(dir.path());
        let source = FfmpegSource::new("rtsp://10.255.255.1:8554/live", params(), &binary)
            .with_read_timeout(Duration::from_millis(200));
        let stats = Arc::new(PipelineStats::default());
        let (producer, _frames) = frame_queue(4, DropPolicy::DropOldest, Arc::default());
        let receiver = StreamReceiver::new("cam", Box::new(source), producer, params(), stats.clone())
            .with_reconnect_interval(Duration::from_millis(50));

        let stop = StopFlag::new();
        let worker_stop = stop.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            receiver.run(&worker_stop);
            let _ = done_tx.send(());
        });
        thread::sleep(Duration::from_millis(800));
        stop.stop();

        assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        assert_eq!(stats.receiver.received.load(Ordering::Relaxed), 0);
        assert!(stats.receiver.read_errors.load(Ordering::Relaxed) >= 1);
        assert!(stats.receiver.connection_attempts.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn missing_decoder_binary() {
        let mut source = FfmpegSource::new("/data/clip.mp4", params(), "no-such-decoder-binary");
        assert!(matches!(source.connect(), Err(TestbedError::BinaryMissing(_))));
    }
}
