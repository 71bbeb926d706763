//! Outbound metadata report for each relocated video.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::blackbox::BlackboxData;
use crate::config::{ApiConfig, Config};
use crate::error::{Result, TestbedError};

/// Body of `POST /api/camera-videos`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub camera_id: i64,
    pub camera_name: String,
    pub vessel_id: i64,
    pub vessel_name: String,
    pub gear_code: String,
    pub gear_name: String,
    pub gear_name_ko: String,
    pub file_name: String,
    pub file_real_name: String,
    /// Directory holding the file.
    pub file_path: String,
    /// Megabytes with two decimals.
    pub file_size: String,
    /// Extension without the dot.
    pub file_ext: String,
    pub record_start_time: String,
    pub record_end_time: String,
}

impl VideoRecord {
    pub fn new(
        config: &Config,
        stream: &str,
        path: &Path,
        size: u64,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Self {
        let (camera_id, camera_name) = config.camera_for(stream);
        let vessel = &config.relocation.vessel;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            camera_id,
            camera_name,
            vessel_id: vessel.id,
            vessel_name: vessel.name.clone(),
            gear_code: vessel.gear_code.clone(),
            gear_name: vessel.gear_name.clone(),
            gear_name_ko: vessel.gear_name_ko.clone(),
            file_real_name: file_name.clone(),
            file_name,
            file_path: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            file_size: format_megabytes(size),
            file_ext: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default(),
            record_start_time: iso_seconds(start),
            record_end_time: iso_seconds(end.max(start)),
        }
    }

    /// Vessel and gear identity from telemetry, where reported.
    pub fn with_vessel(mut self, data: &BlackboxData) -> Self {
        let pick = |value: &Option<String>, field: &mut String| {
            if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                *field = v.to_string();
            }
        };
        if let Some(id) = data.vessel_id {
            self.vessel_id = id;
        }
        pick(&data.vessel_name, &mut self.vessel_name);
        pick(&data.gear_code, &mut self.gear_code);
        pick(&data.gear_name, &mut self.gear_name);
        pick(&data.gear_name_ko, &mut self.gear_name_ko);
        self
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1024.0 * 1024.0))
}

fn iso_seconds(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Receives one record per relocated video.
pub trait MetadataSink: Send {
    fn report(&self, record: &VideoRecord) -> Result<()>;
}

/// Blocking JSON client for the metadata API.
pub struct MetadataClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl MetadataClient {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs.max(1)))
            .build()
            .map_err(|e| TestbedError::Metadata(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/camera-videos", api.base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl MetadataSink for MetadataClient {
    fn report(&self, record: &VideoRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(record)
            .send()
            .map_err(|e| TestbedError::Metadata(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TestbedError::Metadata(format!("{status}: {body}")));
        }
        tracing::debug!(file = %record.file_name, "metadata reported");
        Ok(())
    }
}
