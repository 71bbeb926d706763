//! RTP packet headers.
//!
//! Each RTP packet carries a 12-byte fixed header (RFC 3550 §5.1):
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, typically 90 kHz for video.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! [`rtp::RtpPacketInfo`] parses received headers; [`rtp::RtpHeader`] writes
//! headers for the synthetic test sender.

pub mod rtp;

pub use rtp::{RtpHeader, RtpPacketInfo};
