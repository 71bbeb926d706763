//! Per-stream pipeline counters.
//!
//! Workers bump atomics; the supervisor reads [`PipelineStats::snapshot`]
//! for its periodic report.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub received: AtomicU64,
    pub simulated_losses: AtomicU64,
    pub read_errors: AtomicU64,
    pub connection_attempts: AtomicU64,
    /// Shared with the queue producer.
    pub queue_drops: Arc<AtomicU64>,
}

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub processed: AtomicU64,
    pub saved: AtomicU64,
    pub transform_failures: AtomicU64,
    pub write_errors: AtomicU64,
    pub segments_finalized: AtomicU64,
    pub segments_failed: AtomicU64,
    /// Finalized videos whose caption could not be finalized.
    pub captions_failed: AtomicU64,
    /// Frames not saved while recording was gated off.
    pub gated: AtomicU64,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub receiver: ReceiverStats,
    pub processor: ProcessorStats,
    pub restarts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub queue_drops: u64,
    pub simulated_losses: u64,
    pub read_errors: u64,
    pub connection_attempts: u64,
    pub processed: u64,
    pub saved: u64,
    pub transform_failures: u64,
    pub write_errors: u64,
    pub segments_finalized: u64,
    pub segments_failed: u64,
    pub captions_failed: u64,
    pub gated: u64,
    pub restarts: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let r = &self.receiver;
        let p = &self.processor;
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: get(&r.received),
            queue_drops: get(&r.queue_drops),
            simulated_losses: get(&r.simulated_losses),
            read_errors: get(&r.read_errors),
            connection_attempts: get(&r.connection_attempts),
            processed: get(&p.processed),
            saved: get(&p.saved),
            transform_failures: get(&p.transform_failures),
            write_errors: get(&p.write_errors),
            segments_finalized: get(&p.segments_finalized),
            segments_failed: get(&p.segments_failed),
            captions_failed: get(&p.captions_failed),
            gated: get(&p.gated),
            restarts: get(&self.restarts),
        }
    }
}

impl StatsSnapshot {
    /// Share of received frames lost to queue drops and simulated loss.
    pub fn drop_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            (self.queue_drops + self.simulated_losses) as f64 / self.received as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} processed={} saved={} drops={} simulated_loss={} \
             read_errors={} transform_failures={} write_errors={} \
             segments={} failed_segments={} failed_captions={} gated={} \
             connects={} restarts={}",
            self.received,
            self.processed,
            self.saved,
            self.queue_drops,
            self.simulated_losses,
            self.read_errors,
            self.transform_failures,
            self.write_errors,
            self.segments_finalized,
            self.segments_failed,
            self.captions_failed,
            self.gated,
            self.connection_attempts,
            self.restarts
        )
    }
}
