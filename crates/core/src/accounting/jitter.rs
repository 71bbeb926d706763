use std::time::Instant;

/// Interarrival jitter estimator (RFC 3550 §6.4.1, §A.8).
///
/// For consecutive packets `i-1, i` with RTP timestamps `S` and arrival
/// times `R` (converted to timestamp units):
///
/// ```text
/// D(i-1, i) = (R_i - R_{i-1}) - (S_i - S_{i-1})
/// J_i       = J_{i-1} + (|D(i-1, i)| - J_{i-1}) / 16
/// ```
///
/// Packets sharing one video frame carry the same timestamp, so the
/// estimate for video includes frame burst spacing. Treat it as a trend
/// indicator.
#[derive(Debug, Clone)]
pub struct JitterEstimator {
    clock_rate: u32,
    last: Option<(u32, Instant)>,
    jitter: f64,
    samples: u64,
}

impl JitterEstimator {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            last: None,
            jitter: 0.0,
            samples: 0,
        }
    }

    pub fn update(&mut self, rtp_timestamp: u32, arrival: Instant) {
        if let Some((prev_ts, prev_arrival)) = self.last {
            let arrival_units =
                arrival.saturating_duration_since(prev_arrival).as_secs_f64() * self.clock_rate as f64;
            let ts_units = rtp_timestamp.wrapping_sub(prev_ts) as i32 as f64;
            let d = (arrival_units - ts_units).abs();
            self.jitter += (d - self.jitter) / 16.0;
            self.samples += 1;
        }
        self.last = Some((rtp_timestamp, arrival));
    }

    /// Current estimate in milliseconds, `None` until two packets were seen
    /// or when the clock rate is unknown.
    pub fn jitter_ms(&self) -> Option<f64> {
        if self.samples == 0 || self.clock_rate == 0 {
            return None;
        }
        Some(self.jitter / self.clock_rate as f64 * 1000.0)
    }
}
