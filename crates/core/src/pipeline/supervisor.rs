//! Stream supervision: one receiver/processor pair per stream, restarted
//! after a worker panic or a fatal pipeline error.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::blackbox::BlackboxHandle;
use crate::config::{Config, StreamConfig};
use crate::error::{Result, TestbedError};
use crate::recording::{EncoderFactory, SegmentWriter, VideoParams};

use super::StopFlag;
use super::overlay::OverlayText;
use super::processor::Processor;
use super::queue::frame_queue;
use super::receiver::StreamReceiver;
use super::source::open_source;
use super::stats::{PipelineStats, StatsSnapshot, bump};
use super::transform::TransformRegistry;

/// Everything one stream needs to (re)build its pipeline.
struct StreamContext {
    stream: StreamConfig,
    number: u32,
    config: Arc<Config>,
    encoder: Arc<dyn EncoderFactory>,
    transforms: TransformRegistry,
    telemetry: Option<BlackboxHandle>,
    stats: Arc<PipelineStats>,
}

impl StreamContext {
    fn transform_name(&self) -> &str {
        self.stream
            .transform
            .as_deref()
            .unwrap_or(&self.config.pipeline.transform)
    }

    /// Run one receiver/processor pair until it ends.
    fn run_once(&self, stop: &StopFlag) -> Result<()> {
        let pipeline = &self.config.pipeline;
        let recording = &self.config.recording;

        let writer = if recording.enabled {
            Some(SegmentWriter::new(&self.stream, recording, self.encoder.clone())?)
        } else {
            None
        };
        let mut processor = Processor::new(
            &self.stream.name,
            self.transforms.create(self.transform_name())?,
            writer,
            self.stats.clone(),
        );
        if recording.captions {
            let mut overlay = OverlayText::new(&recording.overlay, self.number);
            if let Some(telemetry) = &self.telemetry {
                overlay = overlay.with_telemetry(telemetry.clone());
            }
            processor = processor.with_overlay(overlay);
        }
        if let Some(telemetry) = &self.telemetry {
            processor = processor.with_gate(telemetry.clone());
        }

        let (producer, frames) = frame_queue(
            pipeline.queue_capacity,
            pipeline.drop_policy,
            self.stats.receiver.queue_drops.clone(),
        );
        let params = VideoParams {
            width: self.stream.width,
            height: self.stream.height,
            fps: self.stream.fps,
        };
        let receiver = StreamReceiver::new(
            &self.stream.name,
            open_source(&self.stream, &recording.encoder.binary, pipeline.read_timeout()),
            producer,
            params,
            self.stats.clone(),
        )
        .with_reconnect_interval(pipeline.reconnect_interval())
        .with_simulated_loss(pipeline.simulated_loss_rate);

        let worker_stop = stop.child();
        let receiver_stop = worker_stop.clone();
        let receiver = thread::Builder::new()
            .name(format!("rx-{}", self.stream.name))
            .spawn(move || receiver.run(&receiver_stop))?;
        let processor = thread::Builder::new()
            .name(format!("proc-{}", self.stream.name))
            .spawn(move || processor.run(frames))?;

        // The processor ends once the receiver has dropped the queue, or
        // early if it panicked; either way the receiver is told to stop.
        let processed = processor.join();
        worker_stop.stop();
        let received = receiver.join();

        match (received, processed) {
            (Ok(()), Ok(_)) => Ok(()),
            (Err(_), _) => Err(TestbedError::SourceExited(format!(
                "{}: receiver panicked",
                self.stream.name
            ))),
            (_, Err(_)) => Err(TestbedError::EncoderExited {
                path: self.config.recording.temp_dir.clone(),
                detail: format!("{}: processor panicked", self.stream.name),
            }),
        }
    }
}

/// Owns the worker pair of one stream and its restart policy.
pub struct StreamSupervisor {
    name: String,
    stats: Arc<PipelineStats>,
    handle: Option<JoinHandle<()>>,
}

impl StreamSupervisor {
    fn spawn(context: StreamContext, stop: StopFlag) -> Result<Self> {
        let name = context.stream.name.clone();
        let stats = context.stats.clone();
        let handle = thread::Builder::new()
            .name(format!("sup-{name}"))
            .spawn(move || supervise(context, stop))?;
        Ok(Self {
            name,
            stats,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(stream = %self.name, "supervisor thread panicked");
            }
        }
    }
}

fn supervise(context: StreamContext, stop: StopFlag) {
    let policy = &context.config.pipeline;
    let mut restarts = 0u32;
    loop {
        let result = context.run_once(&stop);
        if stop.is_stopped() {
            break;
        }
        match &result {
            Ok(()) => tracing::warn!(stream = %context.stream.name, "pipeline ended unexpectedly"),
            Err(e) => tracing::warn!(stream = %context.stream.name, error = %e, "pipeline failed"),
        }
        if result.as_ref().is_err_and(|e| !e.is_transient()) {
            tracing::error!(stream = %context.stream.name, "giving up on stream");
            break;
        }

        restarts += 1;
        bump(&context.stats.restarts);
        if policy.max_restarts.is_some_and(|max| restarts > max) {
            tracing::error!(stream = %context.stream.name, restarts, "restart limit reached");
            break;
        }
        tracing::info!(stream = %context.stream.name, restarts, backoff = ?policy.restart_backoff(), "restarting pipeline");
        if !stop.sleep(policy.restart_backoff()) {
            break;
        }
    }
}

/// Registry of stream supervisors plus the periodic stats reporter.
pub struct Supervisor {
    config: Arc<Config>,
    encoder: Arc<dyn EncoderFactory>,
    transforms: TransformRegistry,
    telemetry: Option<BlackboxHandle>,
    stop: StopFlag,
    streams: Vec<StreamSupervisor>,
    reporter: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        encoder: Arc<dyn EncoderFactory>,
        transforms: TransformRegistry,
    ) -> Self {
        Self {
            config,
            encoder,
            transforms,
            telemetry: None,
            stop: StopFlag::new(),
            streams: Vec::new(),
            reporter: None,
        }
    }

    /// Feed overlays and the recording gate of every stream from `telemetry`.
    pub fn with_telemetry(mut self, telemetry: BlackboxHandle) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Flag that stops every stream when set.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Start one supervisor per configured stream. Unknown transform
    /// names are rejected before anything starts.
    pub fn start(&mut self) -> Result<()> {
        for stream in &self.config.streams {
            let name = stream
                .transform
                .as_deref()
                .unwrap_or(&self.config.pipeline.transform);
            self.transforms.create(name)?;
        }

        for (i, stream) in self.config.streams.iter().enumerate() {
            let context = StreamContext {
                stream: stream.clone(),
                number: i as u32 + 1,
                config: self.config.clone(),
                encoder: self.encoder.clone(),
                transforms: self.transforms.clone(),
                telemetry: self.telemetry.clone(),
                stats: Arc::new(PipelineStats::default()),
            };
            self.streams
                .push(StreamSupervisor::spawn(context, self.stop.clone())?);
            tracing::info!(stream = %stream.name, source = %stream.source, "stream started");
        }

        let interval = self.config.pipeline.stats_interval();
        let stop = self.stop.clone();
        let reporters: Vec<(String, Arc<PipelineStats>)> = self
            .streams
            .iter()
            .map(|s| (s.name.clone(), s.stats.clone()))
            .collect();
        self.reporter = Some(
            thread::Builder::new()
                .name("stats".into())
                .spawn(move || {
                    while stop.sleep(interval) {
                        for (name, stats) in &reporters {
                            tracing::info!(stream = %name, "{}", stats.snapshot());
                        }
                    }
                })?,
        );
        Ok(())
    }

    pub fn streams(&self) -> &[StreamSupervisor] {
        &self.streams
    }

    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.streams
            .iter()
            .map(|s| (s.name.clone(), s.stats()))
            .collect()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop everything, wait for open segments to finalize and return the
    /// final counters.
    pub fn shutdown(mut self) -> Vec<(String, StatsSnapshot)> {
        self.stop.stop();
        for stream in &mut self.streams {
            stream.join();
        }
        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.join();
        }
        let stats = self.stats();
        for (name, snapshot) in &stats {
            tracing::info!(stream = %name, "final: {snapshot}");
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Recording;
    use crate::recording::Encoder;
    use std::path::Path;
    use std::time::Duration;

    struct NullEncoder;

    impl Encoder for NullEncoder {
        fn write_frame(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    struct NullFactory;

    impl EncoderFactory for NullFactory {
        fn spawn(&self, output: &Path, _params: &VideoParams) -> Result<Box<dyn Encoder>> {
            std::fs::write(output, b"")?;
            Ok(Box::new(NullEncoder))
        }
    }

    fn config(dir: &Path, transform: &str) -> Config {
        let mut config = Config::default();
        config.recording = Recording {
            temp_dir: dir.to_path_buf(),
            ..Recording::default()
        };
        config.pipeline.transform = transform.into();
        config.pipeline.stats_interval_secs = 1;
        config.streams.push(StreamConfig {
            name: "cam1".into(),
            source: "synthetic://bars".into(),
            fps: 50.0,
            width: 8,
            height: 4,
            transform: None,
        });
        config
    }

    #[test]
    fn unknown_transform_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(
            Arc::new(config(dir.path(), "nope")),
            Arc::new(NullFactory),
            TransformRegistry::default(),
        );
        assert!(matches!(supervisor.start(), Err(TestbedError::Config(_))));
        assert!(supervisor.streams().is_empty());
    }

    #[test]
    fn synthetic_stream_runs_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(
            Arc::new(config(dir.path(), "identity")),
            Arc::new(NullFactory),
            TransformRegistry::default(),
        );
        supervisor.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(supervisor.streams()[0].is_running());

        let stats = supervisor.shutdown();
        let (name, snap) = &stats[0];
        assert_eq!(name, "cam1");
        assert!(snap.received > 0);
        assert_eq!(snap.processed + snap.queue_drops, snap.received);
        // The null encoder writes nothing, so the segment is too small.
        assert_eq!(snap.segments_failed, 1);
        assert_eq!(snap.restarts, 0);
    }

    #[test]
    fn closed_gate_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let gate = BlackboxHandle::new();
        gate.publish(
            crate::blackbox::BlackboxData {
                speed: Some(30.0),
                ..Default::default()
            },
            &crate::config::OverlayConfig::default(),
            5.0,
        );
        let mut supervisor = Supervisor::new(
            Arc::new(config(dir.path(), "identity")),
            Arc::new(NullFactory),
            TransformRegistry::default(),
        )
        .with_telemetry(gate);
        supervisor.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let (_, snap) = supervisor.shutdown().remove(0);
        assert!(snap.processed > 0);
        assert_eq!(snap.gated, snap.processed);
        assert_eq!(snap.saved, 0);
        assert_eq!(snap.segments_failed, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
