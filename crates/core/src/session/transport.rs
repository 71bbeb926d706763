/// RTP/RTCP transport parameters from an RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=1A2B3C4D
/// ```
///
/// Only `RTP/AVP` unicast over UDP is supported; interleaved TCP and
/// multicast are rejected by the negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Client's RTP receive port.
    pub client_rtp_port: u16,
    /// Client's RTCP receive port (typically `client_rtp_port + 1`).
    pub client_rtcp_port: u16,
    /// Server's RTP/RTCP send ports, present in SETUP responses.
    pub server_ports: Option<(u16, u16)>,
    /// SSRC the server will use, if announced.
    pub ssrc: Option<u32>,
}

impl TransportHeader {
    /// Transport requested by the client for a UDP port pair.
    pub fn request(client_rtp_port: u16, client_rtcp_port: u16) -> Self {
        Self {
            client_rtp_port,
            client_rtcp_port,
            server_ports: None,
            ssrc: None,
        }
    }

    /// Header value to send with SETUP.
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            "RTP/AVP;unicast;client_port={}-{}",
            self.client_rtp_port, self.client_rtcp_port
        );
        if let Some((rtp, rtcp)) = self.server_ports {
            value.push_str(&format!(";server_port={rtp}-{rtcp}"));
        }
        value
    }

    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Looks for `client_port=RTP-RTCP` among semicolon-separated parameters,
    /// plus the optional `server_port` and `ssrc`. Headers that select TCP
    /// interleaving are rejected.
    ///
    /// ## Examples
    ///
    /// ```
    /// use testbed::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse(
    ///     "RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001",
    /// )
    /// .unwrap();
    /// assert_eq!(th.client_rtp_port, 8000);
    /// assert_eq!(th.server_ports, Some((5000, 5001)));
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let mut client = None;
        let mut server_ports = None;
        let mut ssrc = None;

        for part in header.split(';') {
            let part = part.trim();
            if part.starts_with("RTP/AVP/TCP") || part.starts_with("interleaved=") {
                return None;
            }
            if let Some(ports) = part.strip_prefix("client_port=") {
                client = Some(parse_port_pair(ports)?);
            } else if let Some(ports) = part.strip_prefix("server_port=") {
                server_ports = parse_port_pair(ports);
            } else if let Some(value) = part.strip_prefix("ssrc=") {
                ssrc = u32::from_str_radix(value.trim(), 16).ok();
            }
        }

        let (client_rtp_port, client_rtcp_port) = client?;
        Some(TransportHeader {
            client_rtp_port,
            client_rtcp_port,
            server_ports,
            ssrc,
        })
    }
}

/// `a-b`, or a single port `a` meaning `a-(a+1)`.
fn parse_port_pair(ports: &str) -> Option<(u16, u16)> {
    match ports.split_once('-') {
        Some((rtp, rtcp)) => Some((rtp.trim().parse().ok()?, rtcp.trim().parse().ok()?)),
        None => {
            let rtp: u16 = ports.trim().parse().ok()?;
            Some((rtp, rtp.checked_add(1)?))
        }
    }
}
