use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::accounting::{PacketFormat, SequenceAccountant};
use crate::error::{Result, TestbedError};
use crate::media::rtp::RtpPacketInfo;

/// How long a blocking `recv_from` waits before re-checking the stop flag.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Largest datagram we expect (jumbo RTP is not used on the testbed).
const MAX_DATAGRAM: usize = 65_536;

/// Attempts at finding a free even/odd ephemeral port pair.
const PORT_PAIR_ATTEMPTS: usize = 16;

/// Bound RTP/RTCP socket pair for one SETUP (RFC 3550 §11: RTP on an even
/// port, RTCP on the next odd port).
#[derive(Debug)]
pub struct MediaSockets {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

impl MediaSockets {
    /// Bind the pair on `ip`.
    ///
    /// With `preferred_rtp_port == 0` an ephemeral even port is searched;
    /// otherwise exactly `preferred..preferred+1` is bound.
    pub fn bind(ip: IpAddr, preferred_rtp_port: u16) -> Result<Self> {
        if preferred_rtp_port != 0 {
            let rtcp_port = preferred_rtp_port
                .checked_add(1)
                .ok_or_else(|| TestbedError::Config("RTP port 65535 has no RTCP pair".into()))?;
            let rtp = UdpSocket::bind(SocketAddr::new(ip, preferred_rtp_port))?;
            let rtcp = UdpSocket::bind(SocketAddr::new(ip, rtcp_port))?;
            return Ok(Self { rtp, rtcp });
        }

        for _ in 0..PORT_PAIR_ATTEMPTS {
            let rtp = UdpSocket::bind(SocketAddr::new(ip, 0))?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            match UdpSocket::bind(SocketAddr::new(ip, port + 1)) {
                Ok(rtcp) => return Ok(Self { rtp, rtcp }),
                Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TestbedError::Io(std::io::Error::new(
            ErrorKind::AddrInUse,
            "no free RTP/RTCP port pair",
        )))
    }

    pub fn rtp_port(&self) -> Result<u16> {
        Ok(self.rtp.local_addr()?.port())
    }

    pub fn rtcp_port(&self) -> Result<u16> {
        Ok(self.rtcp.local_addr()?.port())
    }
}

/// UDP transport for outbound test traffic.
///
/// Binds a single ephemeral socket (`0.0.0.0:0`) and sends datagrams to a
/// fixed destination.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound packets.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }
}

/// Receive loop feeding a shared [`SequenceAccountant`].
///
/// Runs on its own thread. The only state shared with the RTSP control
/// exchange is the accountant behind its mutex.
pub struct PacketReceiver {
    socket: UdpSocket,
    format: PacketFormat,
    accountant: Arc<Mutex<SequenceAccountant>>,
}

impl PacketReceiver {
    pub fn new(
        socket: UdpSocket,
        format: PacketFormat,
        accountant: Arc<Mutex<SequenceAccountant>>,
    ) -> Result<Self> {
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        Ok(Self {
            socket,
            format,
            accountant,
        })
    }

    /// Receive until `running` is cleared. Returns the number of datagrams
    /// read. Undersized datagrams are counted as malformed and dropped.
    pub fn run(&self, running: &AtomicBool) -> u64 {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut datagrams = 0u64;

        while running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _peer)) => {
                    datagrams += 1;
                    self.handle(&buf[..len], Instant::now());
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        tracing::warn!(error = %e, "UDP receive error");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        tracing::debug!(datagrams, "receive loop exited");
        datagrams
    }

    fn handle(&self, data: &[u8], arrival: Instant) {
        let Some(sequence) = self.format.extract(data) else {
            tracing::trace!(len = data.len(), "malformed datagram");
            self.accountant.lock().record_malformed();
            return;
        };

        let mut accountant = self.accountant.lock();
        accountant.observe_at(sequence, data.len(), arrival);
        if self.format == PacketFormat::Rtp {
            if let Some(info) = RtpPacketInfo::parse(data) {
                accountant.observe_timestamp(info.timestamp, arrival);
            }
        }
    }
}
