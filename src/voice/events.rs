//! WebSocket envelope schema for a live voice session.
//!
//! ## Protocol
//!
//! ```text
//! Client ──WebSocket──▸ Gateway/Orchestrator ──WebSocket──▸ Realtime upstream
//!    ◂── envelopes ───────────◂── audio/events ───────────◂
//! ```
//!
//! All envelopes are JSON text frames tagged by `type`. Audio travels base64
//! encoded and is always split into chunks of at most
//! [`MAX_AUDIO_CHUNK_BYTES`] raw bytes, so no frame exceeds
//! [`MAX_ENVELOPE_BYTES`].

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::state::{ConversationLabel, Speaker, StateTransition};

/// Largest raw audio payload carried by one `audio_chunk`.
pub const MAX_AUDIO_CHUNK_BYTES: usize = 32 * 1024;

/// Largest accepted text frame. Fits a full audio chunk after base64 (4/3)
/// plus the JSON wrapper.
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

// ── Envelope ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Audio in either direction.
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64-encoded audio bytes.
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// Client → server: the user started talking over the agent.
    #[serde(rename = "interrupt")]
    Interrupt,

    /// Server → client: drop everything queued for playback.
    #[serde(rename = "interrupted")]
    Interrupted,

    #[serde(rename = "state_changed")]
    StateChanged {
        state: ConversationLabel,
        speaker: Speaker,
        #[serde(rename = "turnCount")]
        turn_count: u64,
    },

    /// First envelope of every accepted connection.
    #[serde(rename = "session_ready")]
    SessionReady {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "silenceTimeoutMs")]
        silence_timeout_ms: u64,
        #[serde(rename = "minSpeechDurationMs")]
        min_speech_duration_ms: u64,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("bad audio payload: {0}")]
    BadAudio(#[from] base64::DecodeError),
}

impl Envelope {
    /// Parse one inbound text frame. Oversized frames are refused before
    /// any JSON work; unknown `type` values are malformed.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        if text.len() > MAX_ENVELOPE_BYTES {
            return Err(EnvelopeError::TooLarge {
                len: text.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn audio(bytes: &[u8], seq: Option<u64>) -> Self {
        Self::AudioChunk {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            seq,
        }
    }

    pub fn state_changed(transition: &StateTransition) -> Self {
        Self::StateChanged {
            state: transition.to,
            speaker: transition.state.current_speaker,
            turn_count: transition.state.turn_count,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioChunk { .. } => "audio_chunk",
            Self::Interrupt => "interrupt",
            Self::Interrupted => "interrupted",
            Self::StateChanged { .. } => "state_changed",
            Self::SessionReady { .. } => "session_ready",
            Self::Error { .. } => "error",
        }
    }
}

/// Decode the `data` field of an `audio_chunk`.
pub fn decode_audio(data: &str) -> Result<Vec<u8>, EnvelopeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

/// Split `bytes` into `audio_chunk` envelopes, stamping each with the next
/// value of `seq`.
pub fn audio_envelopes(bytes: &[u8], seq: &mut u64) -> Vec<Envelope> {
    bytes
        .chunks(MAX_AUDIO_CHUNK_BYTES)
        .map(|chunk| {
            let envelope = Envelope::audio(chunk, Some(*seq));
            *seq += 1;
            envelope
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────
