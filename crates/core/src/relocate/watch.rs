//! Directory watch strategies behind one interface. The strategy is picked
//! once at startup: native notifications when the platform backend can be
//! initialised, polling otherwise.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::WatchMode;
use crate::error::{Result, TestbedError};
use crate::recording::naming::is_provisional;

pub trait WatchStrategy: Send {
    fn name(&self) -> &'static str;

    /// Wait up to `timeout` for candidate paths (finalized names only).
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<PathBuf>>;
}

fn is_candidate(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !is_provisional(n))
}

fn watch_error(dir: &Path, e: notify::Error) -> TestbedError {
    TestbedError::Io(std::io::Error::other(format!("watch {}: {e}", dir.display())))
}

/// Create and rename notifications from the OS backend.
pub struct NativeWatcher {
    // Dropping the watcher ends the subscription.
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
}

impl NativeWatcher {
    pub fn new(dir: &Path) -> Result<Self> {
        let (tx, events) = unbounded();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })
        .map_err(|e| watch_error(dir, e))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(dir, e))?;
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    fn collect(event: notify::Result<Event>, out: &mut Vec<PathBuf>) {
        match event {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
                );
                if relevant {
                    out.extend(event.paths.into_iter().filter(|p| is_candidate(p)));
                }
            }
            Err(e) => tracing::warn!(error = %e, "watch error"),
        }
    }
}

impl WatchStrategy for NativeWatcher {
    fn name(&self) -> &'static str {
        "native"
    }

    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<PathBuf>> {
        let mut batch = Vec::new();
        match self.events.recv_timeout(timeout) {
            Ok(event) => Self::collect(event, &mut batch),
            Err(RecvTimeoutError::Timeout) => return Ok(batch),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TestbedError::Io(std::io::Error::other("watch backend stopped")));
            }
        }
        for event in self.events.try_iter() {
            Self::collect(event, &mut batch);
        }
        batch.dedup();
        Ok(batch)
    }
}

/// Periodic directory listing.
pub struct PollWatcher {
    dir: PathBuf,
    interval: Duration,
    last_poll: Option<Instant>,
    seen: HashSet<PathBuf>,
}

impl PollWatcher {
    pub fn new(dir: &Path, interval: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            interval,
            last_poll: None,
            seen: HashSet::new(),
        }
    }

    fn list(&self) -> Result<HashSet<PathBuf>> {
        match fs::read_dir(&self.dir) {
            Ok(entries) => Ok(entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_candidate(p))
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl WatchStrategy for PollWatcher {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<PathBuf>> {
        if let Some(last) = self.last_poll {
            let due = last + self.interval;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                std::thread::sleep(wait.min(timeout));
                if wait > timeout {
                    return Ok(Vec::new());
                }
            }
        }
        self.last_poll = Some(Instant::now());

        let present = self.list()?;
        let mut fresh: Vec<PathBuf> = present.difference(&self.seen).cloned().collect();
        fresh.sort();
        // Forget files that left so a re-created name is reported again.
        self.seen = present;
        Ok(fresh)
    }
}

/// Choose the strategy for `mode`. `Auto` probes the native backend once.
pub fn select_strategy(mode: WatchMode, dir: &Path, poll_interval: Duration) -> Result<Box<dyn WatchStrategy>> {
    fs::create_dir_all(dir)?;
    match mode {
        WatchMode::Native => Ok(Box::new(NativeWatcher::new(dir)?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(dir, poll_interval))),
        WatchMode::Auto => match NativeWatcher::new(dir) {
            Ok(watcher) => Ok(Box::new(watcher)),
            Err(e) => {
                tracing::info!(error = %e, "native watch unavailable, polling");
                Ok(Box::new(PollWatcher::new(dir, poll_interval)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_reports_new_finalized_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = PollWatcher::new(dir.path(), Duration::ZERO);
        assert!(watcher.next_batch(Duration::from_millis(10)).unwrap().is_empty());

        fs::write(dir.path().join("temp_cam_250101_000000.mp4"), b"x").unwrap();
        fs::write(dir.path().join("cam_250101_000001.mp4"), b"x").unwrap();
        let batch = watcher.next_batch(Duration::from_millis(10)).unwrap();
        assert_eq!(batch, vec![dir.path().join("cam_250101_000001.mp4")]);
        assert!(watcher.next_batch(Duration::from_millis(10)).unwrap().is_empty());

        fs::rename(
            dir.path().join("temp_cam_250101_000000.mp4"),
            dir.path().join("cam_250101_000000.mp4"),
        )
        .unwrap();
        let batch = watcher.next_batch(Duration::from_millis(10)).unwrap();
        assert_eq!(batch, vec![dir.path().join("cam_250101_000000.mp4")]);
    }

    #[test]
    fn poll_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = PollWatcher::new(dir.path(), Duration::from_secs(60));
        watcher.next_batch(Duration::ZERO).unwrap();
        fs::write(dir.path().join("cam_250101_000001.mp4"), b"x").unwrap();
        assert!(watcher.next_batch(Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn auto_always_yields_a_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = select_strategy(WatchMode::Auto, dir.path(), Duration::from_secs(1)).unwrap();
        assert!(["native", "poll"].contains(&strategy.name()));
        let poll = select_strategy(WatchMode::Poll, dir.path(), Duration::from_secs(1)).unwrap();
        assert_eq!(poll.name(), "poll");
    }
}
