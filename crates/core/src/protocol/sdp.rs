//! SDP (Session Description Protocol) parsing (RFC 4566 / RFC 8866).
//!
//! Extracts what the negotiator needs from a DESCRIBE body:
//!
//! ```text
//! v=0
//! s=Stream
//! a=control:*                                   ← session-level control
//! m=video 0 RTP/AVP 96                          ← first video media section
//! a=rtpmap:96 H264/90000                        ← codec / clock rate
//! a=control:trackID=0                           ← track control URL
//! ```
//!
//! Only the first `m=video` section is considered; audio sections are
//! skipped.

use crate::error::{ParseErrorKind, Result, TestbedError};

/// Clock rate assumed for video when no `a=rtpmap` is present (RFC 3551 §5).
pub const DEFAULT_VIDEO_CLOCK_RATE: u32 = 90_000;

/// The parts of a session description relevant to one video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_name: Option<String>,
    /// Session-level `a=control`, if any.
    pub session_control: Option<String>,
    /// RTP payload type from the `m=video` line.
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`).
    pub encoding: Option<String>,
    pub clock_rate: u32,
    /// Media-level `a=control` of the video track.
    pub control: Option<String>,
}

impl SessionDescription {
    /// Parse an SDP body. Fails with [`ParseErrorKind::NoVideoMedia`] when
    /// the body has no usable `m=video` line.
    pub fn parse(body: &str) -> Result<Self> {
        let mut session_name = None;
        let mut session_control = None;
        let mut video: Option<VideoTrack> = None;
        let mut in_video = false;
        let mut session_level = true;

        for line in body.lines().map(str::trim) {
            if let Some(media) = line.strip_prefix("m=") {
                in_video = false;
                session_level = false;
                if media.starts_with("video ") && video.is_none() {
                    // m=<media> <port> <proto> <fmt> ...
                    let payload_type = media
                        .split_whitespace()
                        .nth(3)
                        .and_then(|pt| pt.parse().ok())
                        .ok_or(TestbedError::parse(ParseErrorKind::NoVideoMedia))?;
                    video = Some(VideoTrack {
                        payload_type,
                        ..VideoTrack::default()
                    });
                    in_video = true;
                }
                continue;
            }

            if let Some(name) = line.strip_prefix("s=") {
                session_name = Some(name.to_string());
            } else if let Some(control) = line.strip_prefix("a=control:") {
                let control = Some(control.trim().to_string());
                if session_level {
                    session_control = control;
                } else if let Some(track) = video.as_mut().filter(|_| in_video) {
                    track.control = control;
                }
            } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
                if let Some(track) = video.as_mut().filter(|_| in_video) {
                    track.apply_rtpmap(rtpmap);
                }
            }
        }

        let track = video.ok_or(TestbedError::parse(ParseErrorKind::NoVideoMedia))?;

        Ok(SessionDescription {
            session_name,
            session_control,
            payload_type: track.payload_type,
            encoding: track.encoding,
            clock_rate: track.clock_rate.unwrap_or(DEFAULT_VIDEO_CLOCK_RATE),
            control: track.control,
        })
    }
}

#[derive(Default)]
struct VideoTrack {
    payload_type: u8,
    encoding: Option<String>,
    clock_rate: Option<u32>,
    control: Option<String>,
}

impl VideoTrack {
    /// `a=rtpmap:<pt> <encoding>/<clock>[/<params>]`
    fn apply_rtpmap(&mut self, rtpmap: &str) {
        let mut fields = rtpmap.split_whitespace();
        if fields.next().and_then(|pt| pt.parse::<u8>().ok()) != Some(self.payload_type) {
            return;
        }
        if let Some(encoding) = fields.next() {
            let mut parts = encoding.split('/');
            self.encoding = parts.next().map(str::to_string);
            self.clock_rate = parts.next().and_then(|clock| clock.parse().ok());
        }
    }
}
