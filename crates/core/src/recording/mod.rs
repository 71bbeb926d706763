//! Segment recording: encoder subprocess, caption file and naming.

pub mod caption;
pub mod encoder;
pub mod naming;
pub mod segment;

pub use caption::CaptionWriter;
pub use encoder::{Encoder, EncoderFactory, FfmpegEncoderFactory, ProcessEncoder, VideoParams, check_binary};
pub use naming::{PROVISIONAL_PREFIX, SegmentName, is_provisional};
pub use segment::{FinalizedSegment, SegmentWriter};
