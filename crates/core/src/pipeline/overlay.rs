//! One-line overlay text: vessel, stream number, position and time.
//!
//! With a [`BlackboxHandle`] attached, vessel name, position and time come
//! from the latest telemetry fix; the configured values are used until the
//! first fix arrives.
//!
//! ```
//! use testbed::pipeline::overlay::to_dms;
//!
//! assert_eq!(to_dms(37.5665, false), "037d33'59.4\"N");
//! assert_eq!(to_dms(-126.978, true), "126d58'40.8\"W");
//! ```

use chrono::NaiveDateTime;

use crate::blackbox::BlackboxHandle;
use crate::config::OverlayConfig;

/// Compact degrees-minutes-seconds, one decimal on the seconds.
pub fn to_dms(decimal: f64, longitude: bool) -> String {
    let direction = match (longitude, decimal >= 0.0) {
        (true, true) => 'E',
        (true, false) => 'W',
        (false, true) => 'N',
        (false, false) => 'S',
    };
    let abs = decimal.abs();
    let mut degrees = abs.trunc() as u32;
    let minutes_f = (abs - degrees as f64) * 60.0;
    let mut minutes = minutes_f.trunc() as u32;
    let mut seconds = (minutes_f - minutes as f64) * 60.0;

    // Keep 59.97" from printing as 60.0".
    if (seconds * 10.0).round() >= 600.0 {
        seconds = 0.0;
        minutes += 1;
        if minutes == 60 {
            minutes = 0;
            degrees += 1;
        }
    }
    format!("{degrees:03}d{minutes:02}'{seconds:04.1}\"{direction}")
}

#[derive(Debug, Clone)]
pub struct OverlayText {
    vessel: String,
    stream_number: u32,
    latitude: String,
    longitude: String,
    telemetry: Option<BlackboxHandle>,
}

impl OverlayText {
    pub fn new(config: &OverlayConfig, stream_number: u32) -> Self {
        Self {
            vessel: config.vessel_name.clone(),
            stream_number,
            latitude: to_dms(config.latitude, false),
            longitude: to_dms(config.longitude, true),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: BlackboxHandle) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Caption line for a frame captured at `at`.
    pub fn render(&self, at: NaiveDateTime) -> String {
        match self.telemetry.as_ref().and_then(BlackboxHandle::fix) {
            Some(fix) => self.line(
                &fix.vessel_name,
                &to_dms(fix.latitude, false),
                &to_dms(fix.longitude, true),
                fix.recorded_at.unwrap_or(at),
            ),
            None => self.line(&self.vessel, &self.latitude, &self.longitude, at),
        }
    }

    fn line(&self, vessel: &str, latitude: &str, longitude: &str, at: NaiveDateTime) -> String {
        format!(
            "{vessel} S{:02} {latitude} {longitude} {}",
            self.stream_number,
            at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}
