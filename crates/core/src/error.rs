//! Error types for the testbed library.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur anywhere in the testbed stack.
///
/// Variants map to the failure classes the pipeline distinguishes:
///
/// - **Transient network**: [`Io`](Self::Io), [`Timeout`](Self::Timeout),
///   [`Status`](Self::Status): retried by the stream coordinator.
/// - **Protocol**: [`Parse`](Self::Parse), [`InvalidState`](Self::InvalidState),
///   [`SessionTerminated`](Self::SessionTerminated): end the current RTSP
///   negotiation; the caller builds a fresh negotiator.
/// - **External process**: [`EncoderExited`](Self::EncoderExited),
///   [`SourceExited`](Self::SourceExited): the current segment or source
///   connection is abandoned and a new one is started.
/// - **Output**: [`SegmentTooSmall`](Self::SegmentTooSmall),
///   [`UnrecognizedName`](Self::UnrecognizedName).
/// - **Configuration**: [`Config`](Self::Config),
///   [`BinaryMissing`](Self::BinaryMissing): the only errors that reach
///   process exit.
#[derive(Debug, thiserror::Error)]
pub enum TestbedError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking network operation hit its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Failed to parse an RTSP response, SDP body or segment name.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The RTSP server answered with a non-2xx status.
    #[error("RTSP {method} failed: {code} {reason}")]
    Status {
        method: &'static str,
        code: u16,
        reason: String,
    },

    /// An RTSP operation was attempted from a state that does not allow it.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The negotiator already reached `Error` or `TornDown`.
    #[error("RTSP session terminated ({0})")]
    SessionTerminated(&'static str),

    /// The encoder subprocess died or closed its input pipe.
    #[error("encoder exited for {path}: {detail}")]
    EncoderExited { path: PathBuf, detail: String },

    /// The frame source subprocess ended.
    #[error("frame source ended: {0}")]
    SourceExited(String),

    /// A frame transform failed; the frame passes through unchanged.
    #[error("frame transform {name} failed: {detail}")]
    Transform { name: String, detail: String },

    /// A frame buffer does not match the negotiated geometry.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    /// A closed segment did not reach the minimum playable size.
    #[error("segment {path} too small: {size} bytes")]
    SegmentTooSmall { path: PathBuf, size: u64 },

    /// A file name does not follow `<stream>_<YYMMDD>_<HHMMSS>.<ext>`.
    #[error("unrecognized segment name: {0}")]
    UnrecognizedName(String),

    /// The metadata API rejected or failed a report.
    #[error("metadata API error: {0}")]
    Metadata(String),

    /// The blackbox telemetry API failed or sent an unreadable reply.
    #[error("blackbox API error: {0}")]
    Telemetry(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required external binary could not be executed.
    #[error("required binary not found: {0}")]
    BinaryMissing(String),
}

impl TestbedError {
    /// Whether a retry with backoff is meaningful for this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout(_)
                | Self::Status { .. }
                | Self::SourceExited(_)
                | Self::EncoderExited { .. }
                | Self::Metadata(_)
                | Self::Telemetry(_)
        )
    }

    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }
}

/// Specific kind of parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Response was empty (no status line).
    EmptyResponse,
    /// Status line did not have the expected `RTSP/1.0 Code Reason` format.
    InvalidStatusLine,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` did not match the bytes available.
    InvalidContentLength,
    /// A required header was absent.
    MissingHeader(&'static str),
    /// `Transport` header lacked a usable port pair.
    InvalidTransport,
    /// The SDP body did not describe a video stream.
    NoVideoMedia,
    /// URL was not `rtsp://host[:port]/path`.
    InvalidUrl,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyResponse => write!(f, "empty response"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::MissingHeader(name) => write!(f, "missing {name} header"),
            Self::InvalidTransport => write!(f, "invalid transport header"),
            Self::NoVideoMedia => write!(f, "no video media in SDP"),
            Self::InvalidUrl => write!(f, "invalid RTSP URL"),
        }
    }
}

/// Convenience alias for `Result<T, TestbedError>`.
pub type Result<T> = std::result::Result<T, TestbedError>;
