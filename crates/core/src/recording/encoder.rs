//! External video encoder boundary.
//!
//! A segment is encoded by one subprocess that reads raw `bgr24` frames on
//! stdin and writes the container file itself. Writes block when the pipe
//! is full, which is the lossless backpressure point of the pipeline.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{Container, EncoderConfig};
use crate::error::{Result, TestbedError};

/// Lines of encoder stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 8;

/// Raw video geometry fed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VideoParams {
    /// Bytes of one `bgr24` frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// One running encoder for one output file.
pub trait Encoder: Send {
    /// Push one raw frame. Blocks while the encoder is behind.
    fn write_frame(&mut self, data: &[u8]) -> Result<()>;

    /// Close the input and wait up to `timeout` for a clean exit, killing
    /// the encoder afterwards.
    fn finish(&mut self, timeout: Duration) -> Result<()>;
}

/// Starts encoders; one call per segment.
pub trait EncoderFactory: Send + Sync {
    fn spawn(&self, output: &Path, params: &VideoParams) -> Result<Box<dyn Encoder>>;
}

/// Encoder backed by any subprocess that takes frames on stdin.
pub struct ProcessEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessEncoder {
    pub fn spawn(mut command: Command, output: &Path) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TestbedError::BinaryMissing(format!("{:?}", command.get_program()))
            } else {
                TestbedError::EncoderExited {
                    path: output.to_path_buf(),
                    detail: format!("spawn failed: {e}"),
                }
            }
        })?;

        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let path = output.display().to_string();
            thread::Builder::new()
                .name("encoder-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        let Ok(line) = line else { break };
                        tracing::debug!(output = %path, "{line}");
                        let mut tail = tail.lock();
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                })?;
        }

        tracing::debug!(output = %output.display(), pid = child.id(), "encoder started");

        Ok(Self {
            child,
            stdin,
            output: output.to_path_buf(),
            stderr_tail,
        })
    }

    fn exited(&self, detail: String) -> TestbedError {
        let tail: Vec<String> = self.stderr_tail.lock().iter().cloned().collect();
        let detail = if tail.is_empty() {
            detail
        } else {
            format!("{detail}: {}", tail.join(" | "))
        };
        TestbedError::EncoderExited {
            path: self.output.clone(),
            detail,
        }
    }
}

impl Encoder for ProcessEncoder {
    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.exited("input already closed".into()));
        };
        if let Err(e) = stdin.write_all(data) {
            self.stdin = None;
            let status = self.child.try_wait().ok().flatten();
            return Err(self.exited(match status {
                Some(status) => format!("exited with {status}"),
                None => format!("write failed: {e}"),
            }));
        }
        Ok(())
    }

    fn finish(&mut self, timeout: Duration) -> Result<()> {
        // Dropping stdin delivers EOF.
        self.stdin = None;

        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait()? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => return Err(self.exited(format!("exited with {status}"))),
                None if Instant::now() >= deadline => {
                    tracing::warn!(output = %self.output.display(), "encoder did not exit in time, killing");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    return Err(self.exited(format!("killed after {timeout:?}")));
                }
                None => thread::sleep(Duration::from_millis(20)),
            }
        }
    }
}

impl Drop for ProcessEncoder {
    fn drop(&mut self) {
        self.stdin = None;
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// `ffmpeg` encoder configured from `[recording.encoder]`.
pub struct FfmpegEncoderFactory {
    config: EncoderConfig,
    container: Container,
}

impl FfmpegEncoderFactory {
    pub fn new(config: EncoderConfig, container: Container) -> Self {
        Self { config, container }
    }

    /// Full argument vector (without the binary) for one output file.
    pub fn arguments(&self, output: &Path, params: &VideoParams) -> Vec<String> {
        let c = &self.config;
        let fps = format_fps(params.fps);
        let mut args: Vec<String> = [
            "-y",
            "-hide_banner",
            "-loglevel",
            &c.loglevel,
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-s",
            &format!("{}x{}", params.width, params.height),
            "-pix_fmt",
            "bgr24",
            "-r",
            &fps,
            "-i",
            "-",
            "-c:v",
            &c.codec,
            "-b:v",
            &c.bitrate,
            "-minrate",
            &c.min_bitrate,
            "-maxrate",
            &c.max_bitrate,
            "-bufsize",
            &c.buffer_size,
            "-r",
            &fps,
            "-preset",
            &c.preset,
            "-g",
            &c.keyframe_interval.to_string(),
            "-pix_fmt",
            &c.pixel_format,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.container == Container::Mp4 {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }
        args.extend([
            "-f".to_string(),
            muxer(self.container).to_string(),
            output.display().to_string(),
        ]);
        args
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn spawn(&self, output: &Path, params: &VideoParams) -> Result<Box<dyn Encoder>> {
        let mut command = Command::new(&self.config.binary);
        command.args(self.arguments(output, params));
        tracing::debug!(binary = %self.config.binary, args = ?command.get_args().collect::<Vec<_>>(), "spawning encoder");
        Ok(Box::new(ProcessEncoder::spawn(command, output)?))
    }
}

fn muxer(container: Container) -> &'static str {
    match container {
        Container::Mp4 => "mp4",
        Container::Mkv => "matroska",
        Container::Webm => "webm",
        Container::Avi => "avi",
    }
}

/// Integral rates print without a fraction (`15`, not `15.0`).
fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{fps:.3}")
    }
}

/// Check that `binary -version` runs; returns its first output line.
pub fn check_binary(binary: &str) -> Result<String> {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| TestbedError::BinaryMissing(format!("{binary}: {e}")))?;
    if !output.status.success() {
        return Err(TestbedError::BinaryMissing(format!(
            "{binary} -version exited with {}",
            output.status
        )));
    }
    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    tracing::info!(binary, version = %version, "encoder binary found");
    Ok(version)
}
