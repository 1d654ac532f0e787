//! Configuration structs, deserialized from `config.toml`.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    #[schemars(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Client-side speech segmentation. Also advertised to clients in
    /// `session_ready`.
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Backoff for idempotent external calls (the upstream status check).
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent live sessions (0 = unlimited).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

fn default_max_sessions() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

// ── Auth ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthConfig {
    /// HMAC secret for session credentials. When unset the gateway makes an
    /// ephemeral one at startup, so credentials do not survive a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret: Option<String>,

    /// Credential lifetime in seconds.
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u64,
}

fn default_credential_ttl_secs() -> u64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_secret: None,
            credential_ttl_secs: default_credential_ttl_secs(),
        }
    }
}

// ── Upstream ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpstreamConfig {
    /// Realtime WebSocket endpoint.
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Model listing endpoint used by the startup status check.
    #[serde(default = "default_status_url")]
    pub status_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_transcription_model")]
    pub transcription_model: Option<String>,

    /// System prompt for the agent.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Check the model status endpoint at startup.
    #[serde(default = "default_true")]
    pub preflight: bool,

    /// Fail a turn stuck in processing/thinking for this long. Unset = wait
    /// indefinitely.
    #[serde(default)]
    pub turn_timeout_ms: Option<u64>,
}

fn default_upstream_url() -> String {
    crate::voice::openai_realtime::OPENAI_REALTIME_WS_URL.into()
}

fn default_status_url() -> String {
    "https://api.openai.com/v1/models".into()
}

fn default_model() -> String {
    "gpt-4o-realtime-preview".into()
}

fn default_voice() -> String {
    "alloy".into()
}

fn default_transcription_model() -> Option<String> {
    Some("gpt-4o-mini-transcribe".into())
}

fn default_true() -> bool {
    true
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            status_url: default_status_url(),
            api_key: None,
            model: default_model(),
            voice: default_voice(),
            transcription_model: default_transcription_model(),
            instructions: None,
            preflight: true,
            turn_timeout_ms: None,
        }
    }
}

// ── Capture ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CaptureConfig {
    /// RMS energy (0.0–1.0) above which a frame counts as speech.
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,

    /// Silence hangover before an utterance is finalized. Longer values cut
    /// off fewer slow speakers but add reply latency.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,

    /// Speech shorter than this is discarded as noise.
    #[serde(default = "default_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_silence_threshold() -> f32 {
    0.015
}

fn default_silence_timeout_ms() -> u64 {
    800
}

fn default_min_speech_duration_ms() -> u64 {
    250
}

fn default_monitor_interval_ms() -> u64 {
    20
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_threshold: default_silence_threshold(),
            silence_timeout_ms: default_silence_timeout_ms(),
            min_speech_duration_ms: default_min_speech_duration_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

// ── Fallback audio ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FallbackConfig {
    /// Raw PCM16LE 24 kHz mono clip played when a turn fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_audio_path: Option<PathBuf>,
}

// ── Reliability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ── Logging ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `parley=debug,info`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
