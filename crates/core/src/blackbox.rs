//! Vessel telemetry from the blackbox API.
//!
//! A [`BlackboxPoller`] fetches `GET {base_url}/api/blackbox-logs/latest-gps`
//! on a fixed interval and publishes the result through a
//! [`BlackboxHandle`]. Overlay text and metadata records read the latest
//! position and vessel identity from the handle; the processor reads its
//! recording gate, which closes while the vessel is faster than
//! `speed_threshold`.
//!
//! After `max_failures` consecutive failed polls the overlay falls back to
//! the configured defaults and the gate reopens.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::config::{BlackboxConfig, Config, OverlayConfig};
use crate::error::{Result, TestbedError};
use crate::pipeline::StopFlag;

pub const LATEST_GPS_PATH: &str = "/api/blackbox-logs/latest-gps";

const RECORDED_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `payload` of the latest-gps reply. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlackboxData {
    pub vessel_id: Option<i64>,
    pub vessel_name: Option<String>,
    pub gear_code: Option<String>,
    pub gear_name: Option<String>,
    pub gear_name_ko: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Knots.
    pub speed: Option<f64>,
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub temperature: Option<f64>,
    pub status: Option<String>,
    pub net_opt: Option<String>,
    /// `yyyy-MM-dd HH:mm:ss` as sent.
    pub recorded_date: Option<String>,
}

impl BlackboxData {
    pub fn recorded_at(&self) -> Option<NaiveDateTime> {
        let text = self.recorded_date.as_deref()?;
        match NaiveDateTime::parse_from_str(text, RECORDED_DATE_FORMAT) {
            Ok(at) => Some(at),
            Err(e) => {
                tracing::debug!(recorded_date = text, error = %e, "unreadable recordedDate");
                None
            }
        }
    }

    /// Whether this report allows saving frames. Unknown speed allows it.
    pub fn allows_recording(&self, threshold: f64) -> bool {
        match self.speed {
            Some(speed) if speed.is_finite() => speed <= threshold,
            _ => true,
        }
    }
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    payload: Option<BlackboxData>,
}

/// Anything that can report the vessel's latest telemetry.
pub trait TelemetrySource: Send {
    fn latest(&self) -> Result<BlackboxData>;
}

/// Blocking JSON client for the blackbox API.
pub struct BlackboxClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl BlackboxClient {
    pub fn new(config: &BlackboxConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| TestbedError::Telemetry(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}{LATEST_GPS_PATH}", config.base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TelemetrySource for BlackboxClient {
    fn latest(&self) -> Result<BlackboxData> {
        let response = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(|e| TestbedError::Telemetry(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TestbedError::Telemetry(format!("{status}: {body}")));
        }
        let reply: Reply = response
            .json()
            .map_err(|e| TestbedError::Telemetry(format!("{}: {e}", self.endpoint)))?;
        Ok(reply.payload.unwrap_or_default())
    }
}

/// Position and vessel name shown in the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayFix {
    pub vessel_name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Blackbox time of the fix; `None` means "use the frame time".
    pub recorded_at: Option<NaiveDateTime>,
}

impl OverlayFix {
    fn from_defaults(defaults: &OverlayConfig) -> Self {
        Self {
            vessel_name: defaults.vessel_name.clone(),
            latitude: defaults.latitude,
            longitude: defaults.longitude,
            recorded_at: None,
        }
    }

    fn from_report(data: &BlackboxData, defaults: &OverlayConfig) -> Self {
        Self {
            vessel_name: data
                .vessel_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| defaults.vessel_name.clone()),
            latitude: data.latitude.unwrap_or(defaults.latitude),
            longitude: data.longitude.unwrap_or(defaults.longitude),
            recorded_at: data.recorded_at(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    latest: Option<BlackboxData>,
    fix: Option<OverlayFix>,
    recording_allowed: bool,
}

/// Read side of the poller, cheap to clone into every worker.
#[derive(Debug, Clone)]
pub struct BlackboxHandle {
    shared: Arc<RwLock<Shared>>,
}

impl Default for BlackboxHandle {
    fn default() -> Self {
        Self {
            shared: Arc::new(RwLock::new(Shared {
                latest: None,
                fix: None,
                recording_allowed: true,
            })),
        }
    }
}

impl BlackboxHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last successful report, kept across later failures.
    pub fn latest(&self) -> Option<BlackboxData> {
        self.shared.read().latest.clone()
    }

    pub fn fix(&self) -> Option<OverlayFix> {
        self.shared.read().fix.clone()
    }

    pub fn recording_allowed(&self) -> bool {
        self.shared.read().recording_allowed
    }

    /// Store a report; returns the new gate state when it changed.
    pub(crate) fn publish(&self, data: BlackboxData, defaults: &OverlayConfig, threshold: f64) -> Option<bool> {
        let allowed = data.allows_recording(threshold);
        let mut shared = self.shared.write();
        shared.fix = Some(OverlayFix::from_report(&data, defaults));
        shared.latest = Some(data);
        let changed = shared.recording_allowed != allowed;
        shared.recording_allowed = allowed;
        changed.then_some(allowed)
    }

    /// Defaults for the overlay, gate open. Returns `true` if the gate
    /// was closed before.
    fn fall_back(&self, defaults: &OverlayConfig) -> bool {
        let mut shared = self.shared.write();
        shared.fix = Some(OverlayFix::from_defaults(defaults));
        let reopened = !shared.recording_allowed;
        shared.recording_allowed = true;
        reopened
    }
}

/// Polls a [`TelemetrySource`] and keeps a [`BlackboxHandle`] current.
pub struct BlackboxPoller {
    source: Box<dyn TelemetrySource>,
    handle: BlackboxHandle,
    defaults: OverlayConfig,
    interval: Duration,
    speed_threshold: f64,
    max_failures: u32,
    failures: u32,
}

impl BlackboxPoller {
    pub fn new(source: Box<dyn TelemetrySource>, config: &BlackboxConfig, defaults: &OverlayConfig) -> Self {
        Self {
            source,
            handle: BlackboxHandle::new(),
            defaults: defaults.clone(),
            interval: config.poll_interval(),
            speed_threshold: config.speed_threshold,
            max_failures: config.max_failures.max(1),
            failures: 0,
        }
    }

    /// Poller over the HTTP client described by `[blackbox]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = BlackboxClient::new(&config.blackbox)?;
        tracing::info!(
            endpoint = client.endpoint(),
            interval = ?config.blackbox.poll_interval(),
            speed_threshold = config.blackbox.speed_threshold,
            "blackbox poller configured"
        );
        Ok(Self::new(Box::new(client), &config.blackbox, &config.recording.overlay))
    }

    pub fn handle(&self) -> BlackboxHandle {
        self.handle.clone()
    }

    /// Consecutive failed polls so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn poll_once(&mut self) {
        match self.source.latest() {
            Ok(data) => {
                self.failures = 0;
                let speed = data.speed;
                if let Some(allowed) = self.handle.publish(data, &self.defaults, self.speed_threshold) {
                    tracing::info!(
                        speed = ?speed,
                        threshold = self.speed_threshold,
                        recording = allowed,
                        "recording gate changed"
                    );
                }
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                tracing::warn!(
                    error = %e,
                    failures = self.failures,
                    max = self.max_failures,
                    "blackbox poll failed"
                );
                if self.failures >= self.max_failures {
                    if self.failures == self.max_failures {
                        tracing::error!("blackbox unreachable, using configured overlay defaults");
                    }
                    if self.handle.fall_back(&self.defaults) {
                        tracing::info!(recording = true, "recording gate changed");
                    }
                }
            }
        }
    }

    /// Poll until stopped.
    pub fn run(mut self, stop: &StopFlag) {
        tracing::info!(interval = ?self.interval, "blackbox poller started");
        loop {
            self.poll_once();
            if !stop.sleep(self.interval) {
                break;
            }
        }
        tracing::info!("blackbox poller stopped");
    }
}
