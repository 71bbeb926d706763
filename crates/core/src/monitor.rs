//! Loss probes and the synthetic test sender.
//!
//! [`UdpLossMonitor`] listens on a plain UDP port, [`RtspLossProbe`]
//! negotiates an RTSP session first and measures its RTP stream. Both feed
//! a [`SequenceAccountant`] from a [`PacketReceiver`] thread and log a
//! snapshot every report interval. [`TestSender`] produces traffic with a
//! known loss pattern.

use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::accounting::{LossSnapshot, PacketFormat, SequenceAccountant};
use crate::config::Probe;
use crate::error::Result;
use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader};
use crate::pipeline::StopFlag;
use crate::session::Negotiator;
use crate::transport::{PacketReceiver, UdpTransport};

/// Final result of a probe run.
#[derive(Debug, Clone)]
pub struct LossReport {
    pub snapshot: LossSnapshot,
    /// First unresolved gaps, as wire sequence numbers.
    pub missing: Vec<u64>,
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.snapshot)?;
        if self.missing.is_empty() {
            write!(f, "missing: none")
        } else {
            let list: Vec<String> = self.missing.iter().map(u64::to_string).collect();
            write!(f, "missing (first {}): {}", self.missing.len(), list.join(", "))
        }
    }
}

/// Run a receiver thread on `socket` until `stop`, `duration` or `tick`
/// failing, logging a snapshot every `report_interval`.
fn measure(
    socket: UdpSocket,
    format: PacketFormat,
    accountant: Arc<Mutex<SequenceAccountant>>,
    settings: &Probe,
    stop: &StopFlag,
    duration: Option<Duration>,
    mut tick: impl FnMut() -> Result<()>,
) -> Result<LossReport> {
    let receiver = PacketReceiver::new(socket, format, accountant.clone())?;
    let running = Arc::new(AtomicBool::new(true));
    let handle = {
        let running = running.clone();
        thread::Builder::new()
            .name("loss-rx".into())
            .spawn(move || receiver.run(&running))?
    };

    let started = Instant::now();
    let report_interval = settings.report_interval();
    let mut last_report = Instant::now();
    while !stop.is_stopped() {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        stop.sleep(Duration::from_millis(200));
        if last_report.elapsed() >= report_interval {
            last_report = Instant::now();
            let snap = accountant.lock().snapshot();
            tracing::info!(
                received = snap.received,
                lost = snap.lost,
                loss_rate = format!("{:.4}", snap.loss_rate),
                duplicates = snap.duplicates,
                out_of_order = snap.out_of_order,
                jitter_ms = ?snap.jitter_ms,
                "loss report"
            );
        }
        if let Err(e) = tick() {
            tracing::warn!(error = %e, "probe aborted");
            break;
        }
    }

    running.store(false, Ordering::SeqCst);
    let datagrams = handle.join().unwrap_or(0);
    tracing::debug!(datagrams, "receiver joined");

    let accountant = accountant.lock();
    Ok(LossReport {
        snapshot: accountant.snapshot(),
        missing: accountant.missing(settings.missing_report_limit),
    })
}

/// Sequence accounting on a bare UDP port.
pub struct UdpLossMonitor {
    socket: UdpSocket,
    format: PacketFormat,
    settings: Probe,
}

impl UdpLossMonitor {
    pub fn bind(addr: SocketAddr, settings: &Probe) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        tracing::info!(addr = %socket.local_addr()?, format = ?settings.packet, "UDP loss monitor listening");
        Ok(Self {
            socket,
            format: settings.packet,
            settings: settings.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn run(self, stop: &StopFlag, duration: Option<Duration>) -> Result<LossReport> {
        let accountant = Arc::new(Mutex::new(SequenceAccountant::new(self.format.width())));
        measure(
            self.socket,
            self.format,
            accountant,
            &self.settings,
            stop,
            duration,
            || Ok(()),
        )
    }
}

/// RTSP DESCRIBE/SETUP/PLAY, RTP accounting, TEARDOWN.
pub struct RtspLossProbe {
    url: String,
    settings: Probe,
}

impl RtspLossProbe {
    pub fn new(url: &str, settings: &Probe) -> Self {
        Self {
            url: url.to_string(),
            settings: settings.clone(),
        }
    }

    pub fn run(&self, stop: &StopFlag, duration: Option<Duration>) -> Result<LossReport> {
        let mut negotiator = Negotiator::connect(&self.url, self.settings.rtsp_timeout())?;
        let clock_rate = negotiator.describe()?.clock_rate;
        negotiator.setup(self.settings.client_port)?;
        let media = negotiator.play()?;

        let accountant = Arc::new(Mutex::new(
            SequenceAccountant::rtp().with_clock_rate(clock_rate),
        ));
        let keepalive_every = self.settings.keepalive_interval();
        let mut last_keepalive = Instant::now();

        let report = measure(
            media.rtp,
            PacketFormat::Rtp,
            accountant,
            &self.settings,
            stop,
            duration,
            || {
                if last_keepalive.elapsed() >= keepalive_every {
                    last_keepalive = Instant::now();
                    negotiator.keepalive()?;
                }
                Ok(())
            },
        );

        if let Err(e) = negotiator.teardown() {
            tracing::warn!(url = %self.url, error = %e, "teardown failed");
        }
        report
    }
}

/// What a [`TestSender`] run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub sent: u64,
    pub skipped: u64,
}

/// Emits numbered datagrams, deliberately skipping every n-th one.
pub struct TestSender {
    transport: UdpTransport,
    target: SocketAddr,
    format: PacketFormat,
    packet_size: usize,
    interval: Duration,
    skip_every: Option<u64>,
}

impl TestSender {
    pub fn new(target: SocketAddr, format: PacketFormat) -> Result<Self> {
        Ok(Self {
            transport: UdpTransport::bind()?,
            target,
            format,
            packet_size: 1200,
            interval: Duration::from_millis(10),
            skip_every: None,
        })
    }

    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Skip every `100 / loss_percent`-th packet; `0` disables skipping.
    pub fn with_loss_percent(mut self, loss_percent: f64) -> Self {
        self.skip_every = skip_period(loss_percent);
        self
    }

    fn packet(&self, header: &mut RtpHeader, sequence: u64) -> Vec<u8> {
        match self.format {
            PacketFormat::Rtp => {
                let mut packet = header.write(sequence as u16, false).to_vec();
                packet.resize(self.packet_size.max(RTP_HEADER_LEN), 0);
                header.advance_timestamp(3_000);
                packet
            }
            simple => simple.encode_simple(sequence, self.packet_size),
        }
    }

    pub fn run(&self, count: u64, stop: &StopFlag) -> Result<SendReport> {
        let mut header = RtpHeader::with_random_ssrc(96);
        let mut report = SendReport::default();
        tracing::info!(destination = %self.target, count, skip_every = ?self.skip_every, "sending test packets");

        for sequence in 0..count {
            if stop.is_stopped() {
                break;
            }
            let packet = self.packet(&mut header, sequence);
            if self.skip_every.is_some_and(|n| (sequence + 1) % n == 0) {
                report.skipped += 1;
            } else {
                self.transport.send_to(&packet, self.target)?;
                report.sent += 1;
            }
            if !self.interval.is_zero() {
                stop.sleep(self.interval);
            }
        }
        tracing::info!(sent = report.sent, skipped = report.skipped, "test sender finished");
        Ok(report)
    }
}

fn skip_period(loss_percent: f64) -> Option<u64> {
    if loss_percent > 0.0 && loss_percent.is_finite() {
        Some(((100.0 / loss_percent) as u64).max(1))
    } else {
        None
    }
}
