//! RTSP network-quality testbed: loss accounting, recording and relocation.
//!
//! | Module | Role |
//! |--------|------|
//! | [`accounting`] | RTP sequence accountant (loss, duplicates, reordering, jitter) |
//! | [`blackbox`] | vessel telemetry poller feeding overlay, speed gate and metadata |
//! | [`protocol`], [`session`], [`transport`] | RTSP client negotiation and RTP reception |
//! | [`recording`] | segment writer, encoder subprocess and caption writer |
//! | [`pipeline`] | per-stream receiver / processor workers and their supervisor |
//! | [`relocate`] | moves finalized segments into the dated archive tree |
//! | [`monitor`] | UDP / RTSP loss probes and the synthetic test sender |
//! | [`shaping`] | traffic-control command planning |

pub mod accounting;
pub mod blackbox;
pub mod config;
pub mod error;
pub mod media;
pub mod monitor;
pub mod pipeline;
pub mod protocol;
pub mod recording;
pub mod relocate;
pub mod session;
pub mod shaping;
pub mod transport;

pub use accounting::{LossSnapshot, SeqWidth, SequenceAccountant};
pub use blackbox::{BlackboxHandle, BlackboxPoller};
pub use config::Config;
pub use error::{Result, TestbedError};
pub use monitor::{LossReport, RtspLossProbe, TestSender, UdpLossMonitor};
pub use pipeline::{StopFlag, Supervisor};
pub use relocate::{RelocationService, Relocator};
pub use session::{Negotiator, NegotiatorState};
