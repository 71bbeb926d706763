//! UDP transport for RTP media.
//!
//! RTSP uses a split transport model: the control exchange runs over TCP
//! (owned by [`crate::session::Negotiator`]) and RTP media arrives over UDP
//! on the port pair announced in SETUP.
//!
//! - [`MediaSockets`] binds the even/odd RTP/RTCP pair.
//! - [`PacketReceiver`] drains the RTP socket into a
//!   [`SequenceAccountant`](crate::accounting::SequenceAccountant).
//! - [`UdpTransport`] sends synthetic test traffic.

pub mod udp;

pub use udp::{MediaSockets, PacketReceiver, UdpTransport};
