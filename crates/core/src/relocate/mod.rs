//! Relocation of finalized segments into the dated archive tree.
//!
//! The recorder's provisional→final `rename` is the only hand-off signal:
//! a file is eligible as soon as its name lacks the provisional prefix.
//! The destination `YYYY/MM/DD/HH` comes from the timestamp in the name,
//! never from file times.
//!
//! Moves are a single `rename` on the same volume. Across volumes the file
//! is copied to `<dest>.part`, synced, renamed into place and only then is
//! the source removed; a crash in between leaves at most a duplicate,
//! which the next recovery pass resolves by moving the source again.

pub mod metadata;
pub mod watch;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::blackbox::BlackboxHandle;
use crate::config::Config;
use crate::error::{Result, TestbedError};
use crate::pipeline::StopFlag;
use crate::recording::naming::{CAPTION_EXTENSION, SegmentName, is_provisional};

pub use metadata::{MetadataClient, MetadataSink, VideoRecord};
pub use watch::{NativeWatcher, PollWatcher, WatchStrategy, select_strategy};

const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    Renamed,
    Copied,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relocated {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub method: MoveMethod,
    /// Whether a metadata record was accepted for this file.
    pub reported: bool,
}

pub struct Relocator {
    config: Arc<Config>,
    source_dir: PathBuf,
    final_root: PathBuf,
    sink: Option<Box<dyn MetadataSink>>,
    telemetry: Option<BlackboxHandle>,
}

impl Relocator {
    /// Build from configuration; the HTTP client is created only when the
    /// API is enabled.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let sink: Option<Box<dyn MetadataSink>> = if config.relocation.api.enabled {
            Some(Box::new(MetadataClient::new(&config.relocation.api)?))
        } else {
            None
        };
        Ok(Self {
            source_dir: config.relocation_source_dir().to_path_buf(),
            final_root: config.relocation.final_root.clone(),
            config,
            sink,
            telemetry: None,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn MetadataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Take vessel identity for metadata records from the latest telemetry.
    pub fn with_telemetry(mut self, telemetry: BlackboxHandle) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Move one finalized file. Provisional names, `.part` files and
    /// paths that no longer exist are ignored (`Ok(None)`).
    pub fn on_finalized(&self, path: &Path) -> Result<Option<Relocated>> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        if is_provisional(file_name) || file_name.ends_with(PART_SUFFIX) {
            tracing::trace!(file = file_name, "skipping provisional file");
            return Ok(None);
        }
        let meta = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let name = SegmentName::parse(file_name)?;
        let dest_dir = self.final_root.join(name.dated_dir());
        fs::create_dir_all(&dest_dir)?;
        let destination = dest_dir.join(file_name);

        let ended = meta
            .modified()
            .map(|t| DateTime::<Local>::from(t).naive_local())
            .unwrap_or(name.started);
        let size = meta.len();

        let method = move_file(path, &destination)?;
        set_readable(&destination);
        tracing::info!(
            file = file_name,
            destination = %destination.display(),
            method = ?method,
            "segment relocated"
        );

        let mut reported = false;
        if name.extension != CAPTION_EXTENSION {
            if let Some(sink) = &self.sink {
                let mut record =
                    VideoRecord::new(&self.config, &name.stream, &destination, size, name.started, ended);
                if let Some(data) = self.telemetry.as_ref().and_then(BlackboxHandle::latest) {
                    record = record.with_vessel(&data);
                }
                match sink.report(&record) {
                    Ok(()) => reported = true,
                    Err(e) => tracing::warn!(file = file_name, error = %e, "metadata report failed"),
                }
            }
        }

        Ok(Some(Relocated {
            source: path.to_path_buf(),
            destination,
            method,
            reported,
        }))
    }

    /// Move every finalized file already present in the source directory.
    pub fn recover(&self) -> Result<Vec<Relocated>> {
        let mut paths: Vec<PathBuf> = match fs::read_dir(&self.source_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        paths.sort();

        let mut moved = Vec::new();
        for path in paths {
            match self.on_finalized(&path) {
                Ok(Some(relocated)) => moved.push(relocated),
                Ok(None) => {}
                Err(TestbedError::UnrecognizedName(name)) => {
                    tracing::debug!(file = %name, "not a segment, leaving in place");
                }
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "relocation failed"),
            }
        }
        if !moved.is_empty() {
            tracing::info!(count = moved.len(), "recovered finalized segments");
        }
        Ok(moved)
    }
}

fn move_file(source: &Path, destination: &Path) -> Result<MoveMethod> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(MoveMethod::Renamed),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            copy_then_remove(source, destination)?;
            Ok(MoveMethod::Copied)
        }
        Err(e) => Err(e.into()),
    }
}

/// Cross-volume move: copy to `.part`, sync, rename, delete source.
pub(crate) fn copy_then_remove(source: &Path, destination: &Path) -> Result<()> {
    let mut part = destination.as_os_str().to_owned();
    part.push(PART_SUFFIX);
    let part = PathBuf::from(part);

    fs::copy(source, &part)?;
    fs::File::open(&part)?.sync_all()?;
    fs::rename(&part, destination)?;
    fs::remove_file(source)?;
    Ok(())
}

#[cfg(unix)]
fn set_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
        tracing::warn!(file = %path.display(), error = %e, "chmod failed");
    }
}

#[cfg(not(unix))]
fn set_readable(_path: &Path) {}

/// Counters of one [`RelocationService`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationStats {
    pub moved: u64,
    pub copied: u64,
    pub reported: u64,
    pub failed: u64,
}

/// Long-lived loop: recovery pass, then event-driven relocation with a
/// periodic full rescan.
pub struct RelocationService {
    relocator: Relocator,
    strategy: Box<dyn WatchStrategy>,
    rescan_interval: Duration,
    stats: RelocationStats,
}

const WAIT_SLICE: Duration = Duration::from_millis(500);

impl RelocationService {
    pub fn new(relocator: Relocator, strategy: Box<dyn WatchStrategy>, rescan_interval: Duration) -> Self {
        Self {
            relocator,
            strategy,
            rescan_interval,
            stats: RelocationStats::default(),
        }
    }

    pub fn stats(&self) -> RelocationStats {
        self.stats
    }

    pub fn run(&mut self, stop: &StopFlag) -> Result<RelocationStats> {
        tracing::info!(
            dir = %self.relocator.source_dir().display(),
            strategy = self.strategy.name(),
            "relocation service started"
        );
        self.rescan()?;
        let mut last_rescan = Instant::now();

        while !stop.is_stopped() {
            for path in self.strategy.next_batch(WAIT_SLICE)? {
                let result = self.relocator.on_finalized(&path);
                self.count(result, &path);
            }
            if last_rescan.elapsed() >= self.rescan_interval {
                self.rescan()?;
                last_rescan = Instant::now();
            }
        }

        tracing::info!(
            moved = self.stats.moved,
            reported = self.stats.reported,
            failed = self.stats.failed,
            "relocation service stopped"
        );
        Ok(self.stats)
    }

    fn rescan(&mut self) -> Result<()> {
        for relocated in self.relocator.recover()? {
            self.tally(&relocated);
        }
        Ok(())
    }

    fn count(&mut self, result: Result<Option<Relocated>>, path: &Path) {
        match result {
            Ok(Some(relocated)) => self.tally(&relocated),
            Ok(None) => {}
            Err(TestbedError::UnrecognizedName(_)) => {}
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!(file = %path.display(), error = %e, "relocation failed");
            }
        }
    }

    fn tally(&mut self, relocated: &Relocated) {
        self.stats.moved += 1;
        if relocated.method == MoveMethod::Copied {
            self.stats.copied += 1;
        }
        if relocated.reported {
            self.stats.reported += 1;
        }
    }
}
