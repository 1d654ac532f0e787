//! Server side of the real-time voice pipeline.
//!
//! ## Design
//! - Trait-driven upstream abstraction (`UpstreamConnector` / `UpstreamHandle`)
//! - One `AgentOrchestrator` per live session, owned by the `SessionRegistry`
//! - Coarse conversation-state projection with change-only notification
//! - JSON envelope protocol shared with the client (`events`)
//! - Fallback error audio instead of silence when a turn fails

pub mod events;
pub mod fallback;
pub mod openai_realtime;
pub mod orchestrator;
pub mod preflight;
pub mod registry;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;
pub mod session;
pub mod state;
pub mod upstream;

// ── Shared voice event type ──────────────────────────────────────

/// Provider-agnostic event produced by an upstream session.
///
/// The orchestrator is the only consumer and the only place these are
/// translated into conversation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    /// Upstream session configured and ready to stream.
    SetupComplete,
    /// Upstream VAD heard the user start talking.
    SpeechStarted,
    /// Upstream VAD decided the user finished.
    SpeechStopped,
    ResponseCreated { response_id: Option<String> },
    /// Synthesized audio chunk (PCM16, 24kHz mono).
    Audio { data: Vec<u8> },
    ResponseDone,
    ResponseCancelled,
    /// Transcription of the user's speech.
    InputTranscript { text: String },
    /// Transcription of the agent's speech.
    OutputTranscript { text: String },
    Error { message: String },
}

pub use events::Envelope;
pub use orchestrator::{AgentOrchestrator, RelayOutcome};
pub use registry::SessionRegistry;
pub use session::SessionConfig;
pub use state::{ConversationLabel, ConversationState, ConversationStateTracker};
pub use upstream::{UpstreamConnector, UpstreamHandle, UpstreamLink};
