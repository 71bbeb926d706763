//! RTP sequence-number accounting (loss, duplicates, reordering).
//!
//! A [`SequenceAccountant`] is fed one sequence number per received datagram
//! and keeps just enough state to answer, at any moment:
//!
//! - how many packets arrived (`received`) and how many were distinct (`unique`),
//! - how wide the observed sequence range is (`expected_span`),
//! - how many of those sequence numbers were never seen (`lost`),
//! - how many arrivals were duplicates or out of their expected position.
//!
//! ## Wraparound
//!
//! Sequence numbers wrap at the configured width (8/16/32/64 bits). Every
//! arrival is *extended* into a monotonic 128-bit index relative to the
//! highest index seen so far using the half-range rule (RFC 3550 §A.1):
//!
//! ```text
//! delta = (s - highest) mod 2^N
//! delta <  2^(N-1)  -> s is ahead of highest by delta
//! delta >= 2^(N-1)  -> s is behind highest by 2^N - delta
//! ```
//!
//! so `65534, 65535, 0, 1` on a 16-bit stream is four consecutive packets,
//! not a 65536-packet gap. Span arithmetic only ever sees extended indices.
//!
//! ## Loss rate
//!
//! `loss_rate = (expected_span - unique) / expected_span` is derived every
//! time a [`LossSnapshot`] is taken and never cached, so a "missing" packet
//! that later arrives out of order lowers the rate again.

pub mod extract;
pub mod jitter;

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use extract::{ByteOrder, PacketFormat};
pub use jitter::JitterEstimator;

/// Width of the sequence-number field in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SeqWidth {
    W8,
    W16,
    W32,
    W64,
}

impl SeqWidth {
    /// Map a byte count (1, 2, 4 or 8) to a width.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::W8),
            2 => Some(Self::W16),
            4 => Some(Self::W32),
            8 => Some(Self::W64),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// `2^bits`, the wraparound modulus.
    pub fn modulus(self) -> i128 {
        1i128 << self.bits()
    }

    /// Mask that truncates a value to this width.
    pub fn mask(self) -> u64 {
        match self {
            Self::W64 => u64::MAX,
            other => (1u64 << other.bits()) - 1,
        }
    }
}

impl TryFrom<u8> for SeqWidth {
    type Error = String;

    fn try_from(bytes: u8) -> Result<Self, Self::Error> {
        Self::from_bytes(bytes as usize)
            .ok_or_else(|| format!("unsupported sequence width: {bytes} bytes (expected 1, 2, 4 or 8)"))
    }
}

impl From<SeqWidth> for u8 {
    fn from(width: SeqWidth) -> u8 {
        width.bytes() as u8
    }
}

/// Cursor over the extended sequence space, set by the first packet.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    expected_next: i128,
    highest: i128,
    lowest: i128,
}

/// Per-endpoint loss session.
///
/// Created empty; the first observed packet initializes the cursor.
/// Mutated only through [`observe`](Self::observe) and friends; read through
/// [`snapshot`](Self::snapshot) and [`missing`](Self::missing), which never
/// mutate.
#[derive(Debug)]
pub struct SequenceAccountant {
    width: SeqWidth,
    cursor: Option<Cursor>,
    seen: HashSet<i128>,
    received: u64,
    duplicates: u64,
    out_of_order: u64,
    malformed: u64,
    bytes: u64,
    first_arrival: Option<Instant>,
    last_arrival: Option<Instant>,
    jitter: Option<JitterEstimator>,
}

impl SequenceAccountant {
    pub fn new(width: SeqWidth) -> Self {
        Self {
            width,
            cursor: None,
            seen: HashSet::new(),
            received: 0,
            duplicates: 0,
            out_of_order: 0,
            malformed: 0,
            bytes: 0,
            first_arrival: None,
            last_arrival: None,
            jitter: None,
        }
    }

    /// Accountant for RTP streams (16-bit sequence numbers).
    pub fn rtp() -> Self {
        Self::new(SeqWidth::W16)
    }

    /// Enable the interarrival jitter estimate using the media clock rate
    /// announced in SDP (`a=rtpmap:<pt> <codec>/<clock>`).
    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.jitter = Some(JitterEstimator::new(clock_rate));
        self
    }

    pub fn width(&self) -> SeqWidth {
        self.width
    }

    /// Record one datagram arriving now.
    pub fn observe(&mut self, sequence: u64, byte_size: usize) {
        self.observe_at(sequence, byte_size, Instant::now());
    }

    /// Record one datagram with an explicit arrival time.
    pub fn observe_at(&mut self, sequence: u64, byte_size: usize, arrival: Instant) {
        let sequence = sequence & self.width.mask();

        self.received += 1;
        self.bytes += byte_size as u64;
        if self.first_arrival.is_none() {
            self.first_arrival = Some(arrival);
        }
        self.last_arrival = Some(arrival);

        let Some(mut cursor) = self.cursor else {
            let index = sequence as i128;
            self.cursor = Some(Cursor {
                expected_next: index + 1,
                highest: index,
                lowest: index,
            });
            self.seen.insert(index);
            tracing::trace!(sequence, "first packet");
            return;
        };

        let index = self.extend(sequence, cursor.highest);

        if !self.seen.insert(index) {
            self.duplicates += 1;
            tracing::trace!(sequence, "duplicate packet");
            return;
        }

        if index != cursor.expected_next {
            self.out_of_order += 1;
            tracing::trace!(
                sequence,
                expected = self.wire(cursor.expected_next),
                "packet out of expected position"
            );
        }

        cursor.lowest = cursor.lowest.min(index);
        if index > cursor.highest {
            cursor.highest = index;
            cursor.expected_next = index + 1;
        }
        self.cursor = Some(cursor);
    }

    /// Feed the RTP timestamp of a packet already passed to
    /// [`observe_at`](Self::observe_at). No-op without a clock rate.
    pub fn observe_timestamp(&mut self, rtp_timestamp: u32, arrival: Instant) {
        if let Some(jitter) = self.jitter.as_mut() {
            jitter.update(rtp_timestamp, arrival);
        }
    }

    /// Count a datagram that was too short or otherwise unreadable.
    ///
    /// Malformed packets never touch the sequence state.
    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    /// Derive the current statistics. Calling this twice with no
    /// intervening observation yields identical results.
    pub fn snapshot(&self) -> LossSnapshot {
        let unique = self.seen.len() as u64;
        let (expected_span, lowest, highest, expected_next) = match self.cursor {
            Some(c) => (
                u64::try_from(c.highest - c.lowest + 1).unwrap_or(u64::MAX),
                Some(self.wire(c.lowest)),
                Some(self.wire(c.highest)),
                Some(self.wire(c.expected_next)),
            ),
            None => (0, None, None, None),
        };
        let lost = expected_span.saturating_sub(unique);
        let loss_rate = if expected_span > 0 {
            lost as f64 / expected_span as f64
        } else {
            0.0
        };

        let elapsed = match (self.first_arrival, self.last_arrival) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        };
        let secs = elapsed.as_secs_f64();
        let (byte_rate, packet_rate) = if secs > 0.0 {
            (self.bytes as f64 / secs, self.received as f64 / secs)
        } else {
            (0.0, 0.0)
        };

        LossSnapshot {
            received: self.received,
            unique,
            expected_span,
            lost,
            loss_rate,
            duplicates: self.duplicates,
            out_of_order: self.out_of_order,
            malformed: self.malformed,
            bytes: self.bytes,
            elapsed,
            byte_rate,
            packet_rate,
            lowest,
            highest,
            expected_next,
            jitter_ms: self.jitter.as_ref().and_then(JitterEstimator::jitter_ms),
        }
    }

    /// Sequence numbers inside the observed span that never arrived, in
    /// ascending order, at most `limit` of them.
    pub fn missing(&self, limit: usize) -> Vec<u64> {
        let Some(cursor) = self.cursor else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        let mut index = cursor.lowest;
        while index <= cursor.highest && missing.len() < limit {
            if !self.seen.contains(&index) {
                missing.push(self.wire(index));
            }
            index += 1;
        }
        missing
    }

    /// Extend a wire sequence number relative to the current highest index.
    fn extend(&self, sequence: u64, highest: i128) -> i128 {
        let modulus = self.width.modulus();
        let delta = (sequence as i128 - highest.rem_euclid(modulus)).rem_euclid(modulus);
        if delta >= modulus / 2 {
            highest + delta - modulus
        } else {
            highest + delta
        }
    }

    fn wire(&self, index: i128) -> u64 {
        index.rem_euclid(self.width.modulus()) as u64
    }
}

/// Point-in-time view of a [`SequenceAccountant`].
#[derive(Debug, Clone, PartialEq)]
pub struct LossSnapshot {
    pub received: u64,
    pub unique: u64,
    pub expected_span: u64,
    pub lost: u64,
    /// Fraction in `[0, 1]`, not a percentage.
    pub loss_rate: f64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub malformed: u64,
    pub bytes: u64,
    /// Time between the first and the last arrival.
    pub elapsed: Duration,
    pub byte_rate: f64,
    pub packet_rate: f64,
    pub lowest: Option<u64>,
    pub highest: Option<u64>,
    pub expected_next: Option<u64>,
    /// Best-effort RFC 3550 interarrival jitter.
    pub jitter_ms: Option<f64>,
}

impl fmt::Display for LossSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "received packets : {}", self.received)?;
        writeln!(f, "unique packets   : {}", self.unique)?;
        writeln!(f, "expected packets : {}", self.expected_span)?;
        writeln!(f, "lost packets     : {}", self.lost)?;
        writeln!(f, "loss rate        : {:.2}%", self.loss_rate * 100.0)?;
        writeln!(f, "duplicates       : {}", self.duplicates)?;
        writeln!(f, "out of order     : {}", self.out_of_order)?;
        writeln!(f, "malformed        : {}", self.malformed)?;
        match (self.lowest, self.highest) {
            (Some(lo), Some(hi)) => writeln!(f, "sequence range   : {lo} ~ {hi}")?,
            _ => writeln!(f, "sequence range   : -")?,
        }
        writeln!(f, "bytes received   : {}", self.bytes)?;
        if let Some(jitter) = self.jitter_ms {
            writeln!(f, "jitter           : {jitter:.2} ms")?;
        }
        write!(
            f,
            "receive rate     : {:.1} packets/s, {:.1} KB/s",
            self.packet_rate,
            self.byte_rate / 1024.0
        )
    }
}
