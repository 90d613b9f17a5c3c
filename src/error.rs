//! Crate-level error type.
//!
//! A single taxonomy shared by the device client, session manager and the
//! operations built on top of them. The boundary layer maps each variant to a
//! caller-visible HTTP status; internally variants propagate unchanged.

use std::io;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device could not be reached (connect failure or timeout).
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The device answered with a non-success status or an unparseable body.
    #[error("device protocol error: {0}")]
    Protocol(String),

    /// Every audio channel on the device is already in use.
    #[error("no available channels")]
    NoAvailableChannels,

    /// Another operation holds the audio channel (or a second concurrent
    /// WebRTC offer arrived).
    #[error("operation conflict: {0}")]
    Conflict(&'static str),

    /// The operation was cancelled mid-flight by preemption or abort.
    #[error("operation interrupted")]
    Interrupted,

    /// The device data-plane handshake exceeded its time bound.
    #[error("device handshake timed out")]
    Timeout,

    /// Read or write on a stream that was already closed locally.
    #[error("stream closed")]
    Closed,

    /// I/O error on the data-plane connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure inside the WebRTC stack (negotiation, track wiring).
    /// String-based so the third-party error type stays out of the
    /// public API.
    #[error("webrtc: {0}")]
    WebRtc(String),
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtc(err.to_string())
    }
}

impl Error {
    /// Classify a reqwest transport error per the taxonomy: connect-level
    /// failures are `Unreachable`, everything else is `Protocol`.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Unreachable(err.to_string())
        } else {
            Error::Protocol(err.to_string())
        }
    }
}
