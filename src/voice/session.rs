//! Per-session configuration handed to the orchestrator and the upstream.

use std::sync::Arc;
use std::time::Duration;

use super::fallback::FallbackAudio;
use crate::config::Config;
use crate::reliability::RetryPolicy;

/// Input and output audio: PCM16LE, 24 kHz, mono.
pub const SAMPLE_RATE: u32 = 24_000;

const DEFAULT_INSTRUCTIONS: &str = "You are a helpful voice assistant. \
Keep answers short and conversational, and stop talking as soon as the user interrupts.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upstream inference model id.
    pub model: String,
    pub voice: String,
    pub transcription_model: Option<String>,
    /// System prompt supplied by the deployment; the pipeline never inspects it.
    pub instructions: String,
    /// Silence hangover before a turn is considered finished.
    pub silence_timeout_ms: u64,
    /// Speech shorter than this is treated as noise.
    pub min_speech_duration_ms: u64,
    /// Unset means an in-flight turn may take as long as the upstream needs.
    pub turn_timeout: Option<Duration>,
    pub fallback: Option<Arc<FallbackAudio>>,
    /// Backoff between upstream reconnect attempts; the session ends once
    /// `max_retries` consecutive attempts have failed.
    pub reconnect: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            transcription_model: Some("gpt-4o-mini-transcribe".into()),
            instructions: DEFAULT_INSTRUCTIONS.into(),
            silence_timeout_ms: 800,
            min_speech_duration_ms: 250,
            turn_timeout: None,
            fallback: None,
            reconnect: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config, fallback: Option<Arc<FallbackAudio>>) -> Self {
        let upstream = &config.upstream;
        Self {
            model: upstream.model.clone(),
            voice: upstream.voice.clone(),
            transcription_model: upstream
                .transcription_model
                .clone()
                .filter(|m| !m.trim().is_empty()),
            instructions: upstream
                .instructions
                .clone()
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.into()),
            silence_timeout_ms: config.capture.silence_timeout_ms,
            min_speech_duration_ms: config.capture.min_speech_duration_ms,
            turn_timeout: upstream
                .turn_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            fallback,
            reconnect: RetryPolicy::from(&config.reliability),
        }
    }
}
