//! RTSP client session negotiation (RFC 2326 §3, §A.1).
//!
//! A [`Negotiator`] owns one TCP control connection and walks the minimal
//! client handshake needed to get RTP flowing to a local UDP port:
//!
//! ```text
//! Init --DESCRIBE--> Described --SETUP--> SetUp --PLAY--> Playing
//!   \                    \                  \               \
//!    +------------------- TEARDOWN ----------+---------------+--> TornDown
//!
//! any state --timeout / malformed response / non-2xx--> Error
//! ```
//!
//! `Error` and `TornDown` are absorbing: every later operation fails with
//! [`TestbedError::SessionTerminated`] and the caller builds a fresh
//! negotiator to retry. The media sockets bound during SETUP are handed
//! out by [`Negotiator::play`] and never touched by the control exchange
//! again.

pub mod transport;

use std::io::{BufReader, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{ParseErrorKind, Result, TestbedError};
use crate::protocol::{Method, RtspRequest, RtspResponse, RtspUrl, SessionDescription};
use crate::transport::MediaSockets;
pub use transport::TransportHeader;

/// Default timeout for the TCP connect and for every response.
pub const DEFAULT_RTSP_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side RTSP session state (RFC 2326 §A.1, client view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Init,
    Described,
    SetUp,
    Playing,
    TornDown,
    Error,
}

impl NegotiatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Described => "described",
            Self::SetUp => "set-up",
            Self::Playing => "playing",
            Self::TornDown => "torn-down",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TornDown | Self::Error)
    }
}

/// Minimal RTSP client for one stream.
pub struct Negotiator {
    url: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    local_ip: IpAddr,
    cseq: u32,
    state: NegotiatorState,
    session_id: Option<String>,
    session_timeout: Option<Duration>,
    content_base: Option<String>,
    description: Option<SessionDescription>,
    transport: Option<TransportHeader>,
    media: Option<MediaSockets>,
}

impl Negotiator {
    /// Open the control connection. Every later read and write on it is
    /// bounded by `timeout`.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = RtspUrl::parse(url)?;
        let addr = parsed
            .authority()
            .to_socket_addrs()?
            .next()
            .ok_or(TestbedError::parse(ParseErrorKind::InvalidUrl))?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TestbedError::Timeout("RTSP connect")
            } else {
                e.into()
            }
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let local_ip = stream.local_addr()?.ip();

        tracing::info!(url, %addr, "RTSP control connection established");

        Ok(Self {
            url: url.to_string(),
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            local_ip,
            cseq: 1,
            state: NegotiatorState::Init,
            session_id: None,
            session_timeout: None,
            content_base: None,
            description: None,
            transport: None,
            media: None,
        })
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Keepalive period the server asked for, if it sent `;timeout=N`.
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        self.description.as_ref()
    }

    pub fn transport(&self) -> Option<&TransportHeader> {
        self.transport.as_ref()
    }

    /// DESCRIBE: fetch and parse the SDP. `Init → Described`.
    pub fn describe(&mut self) -> Result<&SessionDescription> {
        self.require("DESCRIBE", &[NegotiatorState::Init])?;

        let url = self.url.clone();
        let response = self.exchange(Method::Describe, &url, &[("Accept", "application/sdp")])?;

        let body = response.body.as_deref().unwrap_or_default();
        let description = match SessionDescription::parse(body) {
            Ok(description) => description,
            Err(e) => return Err(self.fail(e)),
        };

        self.content_base = response
            .get_header("Content-Base")
            .or_else(|| response.get_header("Content-Location"))
            .map(str::to_string);

        tracing::info!(
            url = %self.url,
            payload_type = description.payload_type,
            encoding = description.encoding.as_deref().unwrap_or("?"),
            clock_rate = description.clock_rate,
            control = description.control.as_deref().unwrap_or("-"),
            "DESCRIBE ok"
        );

        self.transition(NegotiatorState::Described);
        Ok(&*self.description.insert(description))
    }

    /// URL SETUP is sent to: the track control resolved against
    /// Content-Base, or against the request URL.
    pub fn control_url(&self) -> String {
        let base = self.content_base.as_deref().unwrap_or(&self.url);
        let control = self.description.as_ref().and_then(|d| d.control.as_deref());
        crate::protocol::resolve_control(base, control)
    }

    /// SETUP: bind the local RTP/RTCP pair and request unicast UDP delivery.
    /// `Described → SetUp`.
    ///
    /// `client_port == 0` picks an ephemeral even port.
    pub fn setup(&mut self, client_port: u16) -> Result<&TransportHeader> {
        self.require("SETUP", &[NegotiatorState::Described])?;

        let media = match MediaSockets::bind(self.local_ip, client_port) {
            Ok(media) => media,
            Err(e) => return Err(self.fail(e)),
        };
        let requested = TransportHeader::request(media.rtp_port()?, media.rtcp_port()?);

        let control = self.control_url();
        let transport_value = requested.to_header_value();
        let response = self.exchange(
            Method::Setup,
            &control,
            &[("Transport", transport_value.as_str())],
        )?;

        let Some(session_id) = response.session_id().map(str::to_string) else {
            return Err(self.fail(TestbedError::parse(ParseErrorKind::MissingHeader("Session"))));
        };
        let Some(transport) = response.get_header("Transport").and_then(TransportHeader::parse)
        else {
            return Err(self.fail(TestbedError::parse(ParseErrorKind::InvalidTransport)));
        };

        self.session_timeout = response.session_timeout_secs().map(Duration::from_secs);

        tracing::info!(
            url = %control,
            session_id = %session_id,
            client_port = requested.client_rtp_port,
            server_port = ?transport.server_ports,
            "SETUP ok"
        );

        self.session_id = Some(session_id);
        self.media = Some(media);
        self.transition(NegotiatorState::SetUp);
        Ok(&*self.transport.insert(transport))
    }

    /// PLAY: start delivery and hand over the bound media sockets.
    /// `SetUp → Playing`.
    pub fn play(&mut self) -> Result<MediaSockets> {
        self.require("PLAY", &[NegotiatorState::SetUp])?;

        let url = self.url.clone();
        let response = self.exchange(Method::Play, &url, &[("Range", "npt=0.000-")])?;

        let Some(media) = self.media.take() else {
            return Err(self.fail(TestbedError::InvalidState {
                operation: "PLAY",
                state: "set-up without media sockets",
            }));
        };

        tracing::info!(
            url = %self.url,
            rtp_info = response.get_header("RTP-Info").unwrap_or("-"),
            "PLAY ok"
        );
        self.transition(NegotiatorState::Playing);
        Ok(media)
    }

    /// OPTIONS keepalive (RFC 2326 §10.1). Allowed in any live state.
    pub fn keepalive(&mut self) -> Result<()> {
        self.require(
            "OPTIONS",
            &[
                NegotiatorState::Init,
                NegotiatorState::Described,
                NegotiatorState::SetUp,
                NegotiatorState::Playing,
            ],
        )?;
        let url = self.url.clone();
        self.exchange(Method::Options, &url, &[])?;
        tracing::debug!(url = %self.url, "keepalive ok");
        Ok(())
    }

    /// TEARDOWN: release the server session. Any live state `→ TornDown`.
    ///
    /// Without a session (before SETUP) no request is sent.
    pub fn teardown(&mut self) -> Result<()> {
        self.require(
            "TEARDOWN",
            &[
                NegotiatorState::Init,
                NegotiatorState::Described,
                NegotiatorState::SetUp,
                NegotiatorState::Playing,
            ],
        )?;

        if self.session_id.is_some() {
            let url = self.url.clone();
            self.exchange(Method::Teardown, &url, &[])?;
        }

        tracing::info!(url = %self.url, session_id = ?self.session_id, "TEARDOWN ok");
        self.media = None;
        self.transition(NegotiatorState::TornDown);
        Ok(())
    }

    /// Send one request and read its response. Any failure moves the
    /// negotiator to `Error`.
    fn exchange(
        &mut self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> Result<RtspResponse> {
        let cseq = self.cseq;
        self.cseq += 1;

        let mut request = RtspRequest::new(method, uri, cseq);
        for (name, value) in headers {
            request = request.add_header(name, value);
        }
        if let Some(session_id) = &self.session_id {
            request = request.add_header("Session", session_id);
        }

        tracing::debug!(method = %method, uri, cseq, "sending request");

        if let Err(e) = self
            .writer
            .write_all(request.serialize().as_bytes())
            .and_then(|()| self.writer.flush())
        {
            return Err(self.fail(e.into()));
        }

        let response = match RtspResponse::read_from(&mut self.reader) {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };

        if let Some(echoed) = response.cseq() {
            if echoed != cseq {
                tracing::warn!(expected = cseq, echoed, "CSeq mismatch");
                return Err(self.fail(TestbedError::parse(ParseErrorKind::InvalidHeader)));
            }
        }

        if !response.is_success() {
            return Err(self.fail(TestbedError::Status {
                method: method.as_str(),
                code: response.status_code,
                reason: response.status_text.clone(),
            }));
        }

        Ok(response)
    }

    fn require(&self, operation: &'static str, allowed: &[NegotiatorState]) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TestbedError::SessionTerminated(self.state.as_str()));
        }
        if !allowed.contains(&self.state) {
            return Err(TestbedError::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn fail(&mut self, error: TestbedError) -> TestbedError {
        tracing::warn!(url = %self.url, state = self.state.as_str(), error = %error, "RTSP negotiation failed");
        self.media = None;
        self.transition(NegotiatorState::Error);
        error
    }

    fn transition(&mut self, next: NegotiatorState) {
        tracing::debug!(url = %self.url, old_state = ?self.state, new_state = ?next, "state transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Read};
    use std::net::TcpListener;
    use std::thread;

    /// Answer each request on one connection with the scripted responses.
    fn scripted_server(responses: Vec<String>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut seen = Vec::new();
            for response in responses {
                let mut request = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        return seen;
                    }
                    request.push_str(&line);
                    if line == "\r\n" {
                        break;
                    }
                }
                seen.push(request);
                writer.write_all(response.as_bytes()).unwrap();
            }
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest);
            seen
        });
        (format!("rtsp://{addr}/stream"), handle)
    }

    #[test]
    fn non_success_status_moves_to_error() {
        let (url, server) =
            scripted_server(vec!["RTSP/1.0 404 Not Found\r\nCSeq: 1\r\n\r\n".to_string()]);
        let mut negotiator = Negotiator::connect(&url, Duration::from_secs(2)).unwrap();
        let err = negotiator.describe().unwrap_err();
        assert!(matches!(err, TestbedError::Status { code: 404, .. }));
        assert_eq!(negotiator.state(), NegotiatorState::Error);
        assert!(matches!(
            negotiator.setup(0),
            Err(TestbedError::SessionTerminated("error"))
        ));
        drop(negotiator);
        server.join().unwrap();
    }

    #[test]
    fn setup_before_describe_is_rejected_without_error_state() {
        let (url, server) = scripted_server(Vec::new());
        let mut negotiator = Negotiator::connect(&url, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            negotiator.setup(0),
            Err(TestbedError::InvalidState { operation: "SETUP", state: "init" })
        ));
        assert_eq!(negotiator.state(), NegotiatorState::Init);
        drop(negotiator);
        server.join().unwrap();
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("rtsp://{}/stream", listener.local_addr().unwrap());
        let hold = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });
        let mut negotiator = Negotiator::connect(&url, Duration::from_millis(200)).unwrap();
        assert!(matches!(negotiator.describe(), Err(TestbedError::Timeout(_))));
        assert_eq!(negotiator.state(), NegotiatorState::Error);
        hold.join().unwrap();
    }

    #[test]
    fn teardown_before_setup_sends_nothing() {
        let (url, server) = scripted_server(Vec::new());
        let mut negotiator = Negotiator::connect(&url, Duration::from_secs(2)).unwrap();
        negotiator.teardown().unwrap();
        assert_eq!(negotiator.state(), NegotiatorState::TornDown);
        drop(negotiator);
        assert!(server.join().unwrap().is_empty());
    }
}
