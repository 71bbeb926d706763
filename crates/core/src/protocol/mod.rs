//! RTSP client-side protocol (RFC 2326).
//!
//! This module handles the text-based RTSP signaling the negotiator needs:
//! building requests, parsing responses and parsing the SDP body returned
//! by DESCRIBE.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Methods used by the client
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Keepalive during long captures |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (UDP ports) |
//! | PLAY | §10.5 | Start media delivery |
//! | TEARDOWN | §10.7 | Destroy session |

pub mod request;
pub mod response;
pub mod sdp;

use std::fmt;

use crate::error::{ParseErrorKind, Result, TestbedError};

pub use request::RtspRequest;
pub use response::RtspResponse;
pub use sdp::SessionDescription;

/// Default RTSP port (RFC 2326 §3.2).
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// `User-Agent` sent with every client request.
pub const USER_AGENT: &str = concat!("rtsp-testbed/", env!("CARGO_PKG_VERSION"));

/// RTSP methods issued by the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `rtsp://host[:port]/path` URL.
///
/// Credentials (`user:pass@`) are not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub host: String,
    pub port: u16,
    /// Path including the leading `/`, or empty.
    pub path: String,
}

impl RtspUrl {
    /// Parse an RTSP URL.
    ///
    /// ```
    /// use testbed::protocol::RtspUrl;
    ///
    /// let url = RtspUrl::parse("rtsp://10.0.0.2:8554/live/cam1").unwrap();
    /// assert_eq!(url.host, "10.0.0.2");
    /// assert_eq!(url.port, 8554);
    /// assert_eq!(url.path, "/live/cam1");
    ///
    /// assert_eq!(RtspUrl::parse("rtsp://camera/").unwrap().port, 554);
    /// assert!(RtspUrl::parse("http://camera/").is_err());
    /// ```
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("rtsp://")
            .ok_or(TestbedError::parse(ParseErrorKind::InvalidUrl))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() || authority.contains('@') {
            return Err(TestbedError::parse(ParseErrorKind::InvalidUrl));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| TestbedError::parse(ParseErrorKind::InvalidUrl))?;
                (host, port)
            }
            None => (authority, DEFAULT_RTSP_PORT),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtsp://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Resolve an SDP `a=control` attribute against a base URL
/// (RFC 2326 §C.1.1).
///
/// - absolute control URLs are used as-is,
/// - `*` or an empty control means the base URL itself,
/// - anything else is appended to the base with a single `/`.
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control.map(str::trim) {
        None | Some("") | Some("*") => base.to_string(),
        Some(control) if control.starts_with("rtsp://") => control.to_string(),
        Some(control) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            control.trim_start_matches('/')
        ),
    }
}
