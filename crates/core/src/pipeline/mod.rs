//! Per-stream frame pipeline.
//!
//! ```text
//! FrameSource ─▶ StreamReceiver ─▶ bounded queue ─▶ Processor ─▶ SegmentWriter
//!                (pacing, loss,     (drop oldest/     (transform,     (+ captions)
//!                 reconnect)         newest)           overlay text)
//! ```
//!
//! Each stream runs under a [`StreamSupervisor`] that restarts the pair
//! after a worker panic or a fatal error; [`Supervisor`] owns all of them.

pub mod frame;
pub mod overlay;
pub mod processor;
pub mod queue;
pub mod receiver;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod transform;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub use frame::Frame;
pub use processor::Processor;
pub use queue::{FrameProducer, PushOutcome, frame_queue};
pub use receiver::StreamReceiver;
pub use source::{FfmpegSource, FrameSource, SyntheticSource, open_source};
pub use stats::{PipelineStats, StatsSnapshot};
pub use supervisor::{StreamSupervisor, Supervisor};
pub use transform::{FrameTransform, Identity, Pixelate, TransformRegistry};

const STOP_POLL: Duration = Duration::from_millis(100);

/// Cooperative stop signal. A child flag is also stopped by its parent.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(self.own.clone()),
        }
    }

    pub fn stop(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.own.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::SeqCst))
    }

    /// Sleep up to `duration`; returns `false` if stopped meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}
