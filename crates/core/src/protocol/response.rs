use std::io::{BufRead, ErrorKind, Read};

use crate::error::{ParseErrorKind, Result, TestbedError};

/// An RTSP response (RFC 2326 §7).
///
/// Text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// The negotiator reads responses with [`read_from`](Self::read_from). The
/// builder half ([`new`](Self::new), [`add_header`](Self::add_header),
/// [`with_body`](Self::with_body), [`serialize`](Self::serialize)) is what a
/// loopback test server answers with.
#[derive(Debug)]
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Upper bound on a response body; SDP bodies are a few hundred bytes.
const MAX_BODY_LEN: usize = 64 * 1024;

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }

    /// Read one complete response: status line, headers up to the blank
    /// line, then exactly `Content-Length` body bytes.
    ///
    /// A socket read timeout surfaces as [`TestbedError::Timeout`].
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) if head.trim().is_empty() => {
                    return Err(TestbedError::parse(ParseErrorKind::EmptyResponse));
                }
                Ok(0) => break,
                Ok(_) => {
                    if line == "\r\n" || line == "\n" {
                        if head.trim().is_empty() {
                            // Tolerate stray blank lines between messages.
                            continue;
                        }
                        break;
                    }
                    head.push_str(&line);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TestbedError::Timeout("RTSP response"));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut response = Self::parse_head(&head)?;

        if let Some(len) = response.content_length()? {
            if len > MAX_BODY_LEN {
                return Err(TestbedError::parse(ParseErrorKind::InvalidContentLength));
            }
            if len > 0 {
                let mut body = vec![0u8; len];
                reader.read_exact(&mut body).map_err(|e| match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                        TestbedError::Timeout("RTSP response body")
                    }
                    ErrorKind::UnexpectedEof => {
                        TestbedError::parse(ParseErrorKind::InvalidContentLength)
                    }
                    _ => e.into(),
                })?;
                response.body = Some(String::from_utf8_lossy(&body).into_owned());
            }
        }

        Ok(response)
    }

    /// Parse the status line and headers (no body).
    pub fn parse_head(head: &str) -> Result<Self> {
        let mut lines = head.lines();

        let status_line = lines
            .next()
            .ok_or(TestbedError::parse(ParseErrorKind::EmptyResponse))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("RTSP/") {
            return Err(TestbedError::parse(ParseErrorKind::InvalidStatusLine));
        }
        let status_code: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(TestbedError::parse(ParseErrorKind::InvalidStatusLine))?;
        let status_text = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(TestbedError::parse(ParseErrorKind::InvalidHeader))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(RtspResponse {
            status_code,
            status_text,
            headers,
            body: None,
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq").and_then(|v| v.parse().ok())
    }

    /// Session identifier without the `;timeout=N` parameter
    /// (RFC 2326 §12.37).
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
            .filter(|id| !id.is_empty())
    }

    /// Session timeout advertised by the server, if any.
    pub fn session_timeout_secs(&self) -> Option<u64> {
        self.get_header("Session")?
            .split(';')
            .skip(1)
            .find_map(|param| param.trim().strip_prefix("timeout="))
            .and_then(|secs| secs.trim().parse().ok())
    }

    fn content_length(&self) -> Result<Option<usize>> {
        match self.get_header("Content-Length") {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| TestbedError::parse(ParseErrorKind::InvalidContentLength)),
        }
    }
}
