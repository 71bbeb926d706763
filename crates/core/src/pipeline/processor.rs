use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::blackbox::BlackboxHandle;
use crate::error::{Result, TestbedError};
use crate::recording::{FinalizedSegment, SegmentWriter};

use super::frame::Frame;
use super::overlay::OverlayText;
use super::stats::{PipelineStats, bump};
use super::transform::FrameTransform;

/// Drains the queue in FIFO order: transform, caption text, encode.
///
/// With a recording gate attached, frames are still transformed but not
/// saved while the gate is closed; the open segment is finalized when the
/// gate closes.
pub struct Processor {
    stream: String,
    transform: Box<dyn FrameTransform>,
    writer: Option<SegmentWriter>,
    overlay: Option<OverlayText>,
    gate: Option<BlackboxHandle>,
    stats: Arc<PipelineStats>,
    finalized: Vec<FinalizedSegment>,
}

impl Processor {
    /// `writer` is `None` when saving is disabled; frames are then only
    /// transformed and counted.
    pub fn new(
        stream: &str,
        transform: Box<dyn FrameTransform>,
        writer: Option<SegmentWriter>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            stream: stream.to_string(),
            transform,
            writer,
            overlay: None,
            gate: None,
            stats,
            finalized: Vec::new(),
        }
    }

    pub fn with_overlay(mut self, overlay: OverlayText) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Save frames only while `gate` allows recording.
    pub fn with_gate(mut self, gate: BlackboxHandle) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Process until the queue is disconnected and drained, then close the
    /// open segment. Returns the segments finalized by this run.
    pub fn run(mut self, frames: Receiver<Frame>) -> Vec<FinalizedSegment> {
        tracing::info!(stream = %self.stream, transform = self.transform.name(), "processor started");
        for frame in frames.iter() {
            self.process(frame);
        }

        if let Some(writer) = self.writer.as_mut() {
            let result = writer.close();
            self.record_write(result);
        }
        tracing::info!(stream = %self.stream, segments = self.finalized.len(), "processor stopped");
        self.finalized
    }

    pub fn process(&mut self, mut frame: Frame) {
        bump(&self.stats.processor.processed);
        self.apply_transform(&mut frame);

        if self.writer.is_some() && !self.recording_allowed() {
            self.hold();
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let caption = self.overlay.as_ref().map(|o| o.render(frame.captured_at));
        let result = writer.write_frame(&frame.data, caption.as_deref());
        if result.is_ok() {
            bump(&self.stats.processor.saved);
        }
        self.record_write(result);
    }

    fn recording_allowed(&self) -> bool {
        self.gate.as_ref().is_none_or(BlackboxHandle::recording_allowed)
    }

    /// Gate closed: skip the frame, finalizing the open segment first.
    fn hold(&mut self) {
        bump(&self.stats.processor.gated);
        let closed = match self.writer.as_mut() {
            Some(writer) if writer.is_open() => Some(writer.close()),
            _ => None,
        };
        if let Some(result) = closed {
            tracing::info!(stream = %self.stream, "recording gated off, finalizing segment");
            self.record_write(result);
        }
    }

    fn apply_transform(&mut self, frame: &mut Frame) {
        let backup = (!self.transform.is_identity()).then(|| frame.data.clone());
        let transform = &mut self.transform;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| transform.apply(frame)));

        let failure = match outcome {
            Ok(Ok(())) if frame.data.len() == frame.expected_len() => return,
            Ok(Ok(())) => "frame geometry changed".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "panicked".to_string(),
        };

        bump(&self.stats.processor.transform_failures);
        tracing::warn!(
            stream = %self.stream,
            transform = self.transform.name(),
            frame = frame.index,
            error = %failure,
            "transform failed, passing frame through"
        );
        if let Some(original) = backup {
            frame.data = original;
        }
    }

    fn record_write(&mut self, result: Result<Option<FinalizedSegment>>) {
        let p = &self.stats.processor;
        match result {
            Ok(Some(segment)) => {
                bump(&p.segments_finalized);
                if segment.caption_failed {
                    bump(&p.captions_failed);
                }
                self.finalized.push(segment);
            }
            Ok(None) => {}
            Err(e) => {
                bump(&p.write_errors);
                if matches!(
                    e,
                    TestbedError::EncoderExited { .. } | TestbedError::SegmentTooSmall { .. }
                ) {
                    bump(&p.segments_failed);
                }
                tracing::warn!(stream = %self.stream, error = %e, "segment write failed");
            }
        }
    }
}
