//! Process-wide configuration.
//!
//! Loaded once at startup from a TOML document and passed by reference to
//! every component constructor. Every field has a default, so an empty file
//! (or no file at all) is a valid configuration for the probe commands;
//! `record` additionally needs at least one `[[streams]]` entry.
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [recording]
//! temp_dir = "./output/temp"
//! segment_seconds = 300
//! container = "mp4"
//!
//! [[streams]]
//! name = "vessel_stream01"
//! source = "rtsp://10.0.0.2:8554/live/1"
//! fps = 15.0
//!
//! [relocation]
//! final_root = "/mnt/raid5"
//! watch = "auto"
//!
//! [relocation.api]
//! enabled = true
//! base_url = "http://localhost"
//!
//! [blackbox]
//! enabled = true
//! base_url = "http://localhost"
//! speed_threshold = 5.0
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accounting::PacketFormat;
use crate::error::{Result, TestbedError};
use crate::recording::naming::{PROVISIONAL_PREFIX, sanitize_stream_name};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "testbed.toml";

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub recording: Recording,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub relocation: Relocation,
    #[serde(default)]
    pub probe: Probe,
    #[serde(default)]
    pub shaping: Vec<ShapingRule>,
    #[serde(default)]
    pub blackbox: BlackboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

/// Output container of recorded segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
    Avi,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
            Self::Avi => "avi",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "mkv" => Some(Self::Mkv),
            "webm" => Some(Self::Webm),
            "avi" => Some(Self::Avi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    /// Save toggle; with `false` frames are processed but not encoded.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory holding provisional and just-finalized segments.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Segment duration budget in seconds of media.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
    #[serde(default)]
    pub container: Container,
    /// Closed segments smaller than this are not finalized.
    #[serde(default = "default_min_segment_bytes")]
    pub min_segment_bytes: u64,
    /// How long `close` waits for the encoder before killing it.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub captions: bool,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
}

impl Default for Recording {
    fn default() -> Self {
        Self {
            enabled: true,
            temp_dir: default_temp_dir(),
            segment_seconds: default_segment_seconds(),
            container: Container::default(),
            min_segment_bytes: default_min_segment_bytes(),
            close_timeout_ms: default_close_timeout_ms(),
            captions: true,
            encoder: EncoderConfig::default(),
            overlay: OverlayConfig::default(),
        }
    }
}

impl Recording {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./output/temp")
}

fn default_segment_seconds() -> u64 {
    300
}

fn default_min_segment_bytes() -> u64 {
    1024
}

fn default_close_timeout_ms() -> u64 {
    10_000
}

/// Encoder subprocess parameters (`ffmpeg` command line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate: String,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    /// GOP length in frames.
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_encoder_loglevel")]
    pub loglevel: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            codec: default_codec(),
            bitrate: default_bitrate(),
            min_bitrate: default_min_bitrate(),
            max_bitrate: default_max_bitrate(),
            buffer_size: default_buffer_size(),
            preset: default_preset(),
            keyframe_interval: default_keyframe_interval(),
            pixel_format: default_pixel_format(),
            loglevel: default_encoder_loglevel(),
        }
    }
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_bitrate() -> String {
    "2M".to_string()
}

fn default_min_bitrate() -> String {
    "1M".to_string()
}

fn default_max_bitrate() -> String {
    "4M".to_string()
}

fn default_buffer_size() -> String {
    "4M".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_keyframe_interval() -> u32 {
    45
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_encoder_loglevel() -> String {
    "error".to_string()
}

/// Caption overlay content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_vessel_name")]
    pub vessel_name: String,
    /// Decimal degrees, north positive.
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    /// Decimal degrees, east positive.
    #[serde(default = "default_longitude")]
    pub longitude: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            vessel_name: default_vessel_name(),
            latitude: default_latitude(),
            longitude: default_longitude(),
        }
    }
}

fn default_vessel_name() -> String {
    "DEFAULT_VESSEL".to_string()
}

fn default_latitude() -> f64 {
    37.5665
}

fn default_longitude() -> f64 {
    126.9780
}

/// What the receiver does when the frame queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// Evict the oldest queued frame to make room (keeps latency low).
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    /// Fixed backoff between source reconnection attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Longest wait for one decoded frame before the source is treated as
    /// stalled and reconnected.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Probability in `[0, 1]` of discarding a received frame on purpose.
    #[serde(default)]
    pub simulated_loss_rate: f64,
    /// Default transform name for streams that do not set one.
    #[serde(default = "default_transform")]
    pub transform: String,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Delay before a supervisor restarts a worker that exited.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// Restart limit per worker; unlimited when absent.
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drop_policy: DropPolicy::default(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            simulated_loss_rate: 0.0,
            transform: default_transform(),
            stats_interval_secs: default_stats_interval_secs(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_restarts: None,
        }
    }
}

impl Pipeline {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

fn default_queue_capacity() -> usize {
    100
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_transform() -> String {
    "identity".to_string()
}

fn default_stats_interval_secs() -> u64 {
    10
}

fn default_restart_backoff_ms() -> u64 {
    1_000
}

/// One recorded stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name; becomes the segment file prefix.
    pub name: String,
    /// `rtsp://...`, `synthetic://...` or a local video file (looped).
    pub source: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Overrides `pipeline.transform`.
    #[serde(default)]
    pub transform: Option<String>,
}

fn default_fps() -> f64 {
    15.0
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

/// Directory-watch strategy for the relocation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native notifications when available, polling otherwise.
    #[default]
    Auto,
    Native,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relocation {
    /// Directory watched for finalized segments; defaults to
    /// `recording.temp_dir`.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    #[serde(default = "default_final_root")]
    pub final_root: PathBuf,
    #[serde(default)]
    pub watch: WatchMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Full rescan period, a safety net for missed events.
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub vessel: VesselConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl Default for Relocation {
    fn default() -> Self {
        Self {
            source_dir: None,
            final_root: default_final_root(),
            watch: WatchMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            rescan_interval_secs: default_rescan_interval_secs(),
            api: ApiConfig::default(),
            vessel: VesselConfig::default(),
            cameras: Vec::new(),
        }
    }
}

impl Relocation {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }
}

fn default_final_root() -> PathBuf {
    PathBuf::from("./output/final")
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_rescan_interval_secs() -> u64 {
    60
}

/// Metadata API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

fn default_api_base_url() -> String {
    "http://localhost".to_string()
}

fn default_api_timeout_secs() -> u64 {
    5
}

/// Vessel telemetry API polled for overlay position and the speed gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_blackbox_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Knots; frames are not saved while the vessel is faster.
    #[serde(default = "default_speed_threshold")]
    pub speed_threshold: f64,
    /// Consecutive failed polls before overlay and gate fall back to
    /// their defaults.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for BlackboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout_secs(),
            poll_interval_ms: default_blackbox_poll_interval_ms(),
            speed_threshold: default_speed_threshold(),
            max_failures: default_max_failures(),
        }
    }
}

impl BlackboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

fn default_blackbox_poll_interval_ms() -> u64 {
    1_000
}

fn default_speed_threshold() -> f64 {
    5.0
}

fn default_max_failures() -> u32 {
    5
}

/// Vessel identity reported with every video record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VesselConfig {
    #[serde(default = "default_vessel_id")]
    pub id: i64,
    #[serde(default = "default_vessel_record_name")]
    pub name: String,
    #[serde(default = "default_gear_code")]
    pub gear_code: String,
    #[serde(default = "default_gear_name")]
    pub gear_name: String,
    #[serde(default = "default_gear_name_ko")]
    pub gear_name_ko: String,
}

impl Default for VesselConfig {
    fn default() -> Self {
        Self {
            id: default_vessel_id(),
            name: default_vessel_record_name(),
            gear_code: default_gear_code(),
            gear_name: default_gear_name(),
            gear_name_ko: default_gear_name_ko(),
        }
    }
}

fn default_vessel_id() -> i64 {
    1
}

fn default_vessel_record_name() -> String {
    "vesselTest".to_string()
}

fn default_gear_code() -> String {
    "PS".to_string()
}

fn default_gear_name() -> String {
    "Purse Seine".to_string()
}

fn default_gear_name_ko() -> String {
    "선망".to_string()
}

/// Camera identity for one stream name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub stream: String,
    pub id: i64,
    pub name: String,
}

/// RTSP / UDP loss probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    #[serde(default = "default_rtsp_timeout_ms")]
    pub rtsp_timeout_ms: u64,
    /// Local RTP port for SETUP; 0 picks an ephemeral even port.
    #[serde(default)]
    pub client_port: u16,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    /// OPTIONS keepalive period while playing.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// How many missing sequence numbers the final report lists.
    #[serde(default = "default_missing_report_limit")]
    pub missing_report_limit: usize,
    #[serde(default)]
    pub packet: PacketFormat,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            rtsp_timeout_ms: default_rtsp_timeout_ms(),
            client_port: 0,
            report_interval_secs: default_report_interval_secs(),
            keepalive_secs: default_keepalive_secs(),
            missing_report_limit: default_missing_report_limit(),
            packet: PacketFormat::default(),
        }
    }
}

impl Probe {
    pub fn rtsp_timeout(&self) -> Duration {
        Duration::from_millis(self.rtsp_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

fn default_rtsp_timeout_ms() -> u64 {
    10_000
}

fn default_report_interval_secs() -> u64 {
    5
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_missing_report_limit() -> usize {
    20
}

/// One traffic-shaping rule applied to a network interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShapingRule {
    pub interface: String,
    #[serde(default)]
    pub delay_ms: Option<u32>,
    #[serde(default)]
    pub jitter_ms: Option<u32>,
    #[serde(default)]
    pub loss_percent: Option<f64>,
    #[serde(default)]
    pub rate_kbit: Option<u32>,
}

impl Config {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when present,
    /// or fall back to defaults. An explicit path that cannot be read or
    /// parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(TestbedError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };

        let config: Self = toml::from_str(&text)
            .map_err(|e| TestbedError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), streams = config.streams.len(), "config loaded");
        Ok(config)
    }

    /// Directory the relocation service watches.
    pub fn relocation_source_dir(&self) -> &Path {
        self.relocation
            .source_dir
            .as_deref()
            .unwrap_or(&self.recording.temp_dir)
    }

    /// Camera id and name reported for `stream`.
    ///
    /// Falls back to the trailing digits of the stream name (default 1)
    /// and `camera<N>`.
    pub fn camera_for(&self, stream: &str) -> (i64, String) {
        if let Some(camera) = self.relocation.cameras.iter().find(|c| c.stream == stream) {
            return (camera.id, camera.name.clone());
        }
        let digits: String = stream
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let number = digits.parse::<i64>().unwrap_or(1);
        (number, format!("camera{number}"))
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !names.insert(stream.name.as_str()) {
                return Err(TestbedError::Config(format!(
                    "duplicate stream name: {}",
                    stream.name
                )));
            }
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(TestbedError::Config("pipeline.queue_capacity must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.pipeline.simulated_loss_rate) {
            return Err(TestbedError::Config(
                "pipeline.simulated_loss_rate must be within [0, 1]".into(),
            ));
        }
        if self.recording.segment_seconds == 0 {
            return Err(TestbedError::Config("recording.segment_seconds must be > 0".into()));
        }
        if self.recording.temp_dir.as_os_str().is_empty() {
            return Err(TestbedError::Config("recording.temp_dir cannot be empty".into()));
        }
        if self.relocation.final_root.as_os_str().is_empty() {
            return Err(TestbedError::Config("relocation.final_root cannot be empty".into()));
        }
        if self.relocation.api.enabled && !self.relocation.api.base_url.starts_with("http") {
            return Err(TestbedError::Config(format!(
                "relocation.api.base_url is not an http(s) URL: {}",
                self.relocation.api.base_url
            )));
        }
        let blackbox = &self.blackbox;
        if blackbox.enabled && !blackbox.base_url.starts_with("http") {
            return Err(TestbedError::Config(format!(
                "blackbox.base_url is not an http(s) URL: {}",
                blackbox.base_url
            )));
        }
        if !(blackbox.speed_threshold >= 0.0 && blackbox.speed_threshold.is_finite()) {
            return Err(TestbedError::Config(format!(
                "blackbox.speed_threshold must be a finite number >= 0: {}",
                blackbox.speed_threshold
            )));
        }
        for rule in &self.shaping {
            if rule.interface.trim().is_empty() {
                return Err(TestbedError::Config("shaping.interface cannot be empty".into()));
            }
            if let Some(loss) = rule.loss_percent {
                if !(0.0..=100.0).contains(&loss) {
                    return Err(TestbedError::Config(format!(
                        "shaping loss_percent out of range on {}: {loss}",
                        rule.interface
                    )));
                }
            }
        }
        Ok(())
    }
}

impl StreamConfig {
    /// Stream with default geometry and frame rate.
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
            transform: None,
        }
    }

    /// The name must be usable as a segment file prefix.
    pub fn validate_name(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TestbedError::Config("stream name cannot be empty".into()));
        }
        // Finalized files would carry the provisional marker and never move.
        if sanitize_stream_name(&self.name).starts_with(PROVISIONAL_PREFIX) {
            return Err(TestbedError::Config(format!(
                "stream {}: name cannot start with {PROVISIONAL_PREFIX}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_name()?;
        if self.source.trim().is_empty() {
            return Err(TestbedError::Config(format!(
                "stream {} has no source",
                self.name
            )));
        }
        let lower = self.source.to_ascii_lowercase();
        if !lower.starts_with("rtsp://")
            && !lower.starts_with("synthetic://")
            && !Path::new(&self.source).is_file()
        {
            return Err(TestbedError::Config(format!(
                "stream {}: source must be rtsp://, synthetic:// or an existing file: {}",
                self.name, self.source
            )));
        }
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            return Err(TestbedError::Config(format!(
                "stream {}: fps must be > 0",
                self.name
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(TestbedError::Config(format!(
                "stream {}: width and height must be > 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Frame budget of one segment.
    pub fn frames_per_segment(&self, segment_seconds: u64) -> u64 {
        ((segment_seconds as f64) * self.fps).round().max(1.0) as u64
    }
}
