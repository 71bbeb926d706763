use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use rand::Rng;

use crate::recording::VideoParams;

use super::frame::Frame;
use super::queue::{FrameProducer, PushOutcome};
use super::source::FrameSource;
use super::stats::{PipelineStats, bump};
use super::StopFlag;

/// Pulls frames from a source, paces them to the stream rate and feeds the
/// queue. Reconnects with a fixed backoff for as long as it runs.
pub struct StreamReceiver {
    stream: String,
    source: Box<dyn FrameSource>,
    producer: FrameProducer,
    params: VideoParams,
    reconnect_interval: Duration,
    simulated_loss_rate: f64,
    stats: Arc<PipelineStats>,
}

impl StreamReceiver {
    pub fn new(
        stream: &str,
        source: Box<dyn FrameSource>,
        producer: FrameProducer,
        params: VideoParams,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            stream: stream.to_string(),
            source,
            producer,
            params,
            reconnect_interval: Duration::from_secs(5),
            simulated_loss_rate: 0.0,
            stats,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Share of frames discarded before queueing, in `[0, 1]`.
    pub fn with_simulated_loss(mut self, rate: f64) -> Self {
        self.simulated_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Run until stopped; the stop flag is the only way out. Dropping
    /// `self` at the end disconnects the queue.
    pub fn run(mut self, stop: &StopFlag) {
        let stats = self.stats.clone();
        let r = &stats.receiver;
        let interval = Duration::from_secs_f64(1.0 / self.params.fps.max(0.001));
        let mut rng = rand::rng();
        let mut connected = false;
        let mut index = 0u64;
        let mut next_due = Instant::now();

        tracing::info!(stream = %self.stream, source = %self.source.describe(), "receiver started");

        while !stop.is_stopped() {
            if !connected {
                bump(&r.connection_attempts);
                match self.source.connect() {
                    Ok(()) => {
                        tracing::info!(stream = %self.stream, "source connected");
                        connected = true;
                        next_due = Instant::now();
                    }
                    Err(e) => {
                        tracing::warn!(stream = %self.stream, error = %e, retry_in = ?self.reconnect_interval, "source connect failed");
                        stop.sleep(self.reconnect_interval);
                        continue;
                    }
                }
            }

            let mut data = vec![0u8; self.params.frame_len()];
            if let Err(e) = self.source.read_frame(&mut data) {
                bump(&r.read_errors);
                tracing::warn!(stream = %self.stream, error = %e, retry_in = ?self.reconnect_interval, "frame read failed, reconnecting");
                self.source.disconnect();
                connected = false;
                stop.sleep(self.reconnect_interval);
                continue;
            }
            bump(&r.received);

            let frame = Frame::new(
                data,
                self.params.width,
                self.params.height,
                index,
                Local::now().naive_local(),
            );
            index += 1;

            if self.simulated_loss_rate > 0.0 && rng.random::<f64>() < self.simulated_loss_rate {
                bump(&r.simulated_losses);
            } else if self.producer.push(frame) != PushOutcome::Queued {
                tracing::trace!(stream = %self.stream, "queue full, frame dropped");
            }

            next_due += interval;
            let now = Instant::now();
            if next_due > now {
                stop.sleep(next_due - now);
            } else if now - next_due > interval {
                // Fell behind (slow source); do not burst to catch up.
                next_due = now;
            }
        }

        self.source.disconnect();
        tracing::info!(stream = %self.stream, frames = index, "receiver stopped");
    }
}
