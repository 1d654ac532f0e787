//! Error kinds surfaced by the voice pipeline.
//!
//! Only [`VoiceError::CaptureUnavailable`] and [`VoiceError::TransportRejected`]
//! are ever returned to callers as hard failures. Relay, turn and playback
//! failures are logged and absorbed where they happen; their variants exist so
//! the absorbing code has a typed value to log.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone permission denied or the capture device failed to open.
    #[error("audio capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// The server refused the connection attempt before any session existed.
    #[error("connection rejected: {0}")]
    TransportRejected(#[from] RejectReason),

    /// Transport failure after the connection was accepted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream not ready or refusing audio.
    #[error("relay failure: {0}")]
    Relay(String),

    /// An in-flight turn failed upstream.
    #[error("turn failure: {0}")]
    Turn(String),

    /// A received audio chunk could not be decoded or played.
    #[error("audio decode/playback failure: {0}")]
    DecodePlayback(String),
}

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingSessionId,
    MalformedSessionId,
    MissingCredential,
    InvalidCredential,
    ExpiredCredential,
    /// A live connection already owns this session id.
    SessionActive,
    /// The gateway is at its session limit.
    AtCapacity,
    /// Client side: the server answered the upgrade with this HTTP status.
    Status(u16),
}

impl RejectReason {
    /// HTTP status the gateway answers with.
    pub fn status_code(self) -> u16 {
        match self {
            Self::MissingSessionId | Self::MalformedSessionId => 400,
            Self::MissingCredential | Self::InvalidCredential | Self::ExpiredCredential => 401,
            Self::SessionActive => 409,
            Self::AtCapacity => 503,
            Self::Status(code) => code,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSessionId => f.write_str("missing session_id"),
            Self::MalformedSessionId => f.write_str("malformed session_id"),
            Self::MissingCredential => f.write_str("missing credential"),
            Self::InvalidCredential => f.write_str("invalid credential"),
            Self::ExpiredCredential => f.write_str("credential expired"),
            Self::SessionActive => f.write_str("session already has a live connection"),
            Self::AtCapacity => f.write_str("gateway at session capacity"),
            Self::Status(code) => write!(f, "server answered HTTP {code}"),
        }
    }
}

impl std::error::Error for RejectReason {}
