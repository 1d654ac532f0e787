//! Client side of the real-time voice pipeline.
//!
//! [`VoiceClient`] ties the three client components together:
//! capture utterances go out over the transport, synthesized audio coming
//! back is played in order, and user speech over agent playback is a
//! barge-in.

pub mod capture;
pub mod playback;
pub mod transport;
pub mod vad;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::CaptureConfig;
use crate::error::VoiceError;
use crate::voice::events::Envelope;

pub use capture::{AudioCaptureClient, AudioInput, CaptureEvent, CaptureStream, ChannelInput, Utterance};
pub use playback::{AudioSink, DecodedAudio, PlaybackQueue};
pub use transport::TransportClient;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct VoiceClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080/api/voice/ws`.
    pub endpoint: String,
    pub session_id: String,
    pub credential: String,
    /// Local capture settings. The hangover and minimum speech duration
    /// are replaced by the values announced in `session_ready`.
    pub capture: CaptureConfig,
    pub ready_timeout: Duration,
}

impl VoiceClientConfig {
    pub fn new(
        endpoint: impl Into<String>,
        session_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_id: session_id.into(),
            credential: credential.into(),
            capture: CaptureConfig::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// What happened during one [`VoiceClient::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientSummary {
    pub utterances_sent: u64,
    pub audio_chunks_received: u64,
    pub barge_ins: u64,
    /// Last `turnCount` the server reported.
    pub turns: u64,
}

pub struct VoiceClient {
    config: VoiceClientConfig,
    transport: TransportClient,
    inbound: mpsc::Receiver<Envelope>,
    capture: AudioCaptureClient,
    playback: PlaybackQueue,
}

impl VoiceClient {
    pub async fn connect(
        config: VoiceClientConfig,
        input: Arc<dyn AudioInput>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self, VoiceError> {
        let (transport, inbound) =
            TransportClient::connect(&config.endpoint, &config.session_id, &config.credential)
                .await?;
        let capture = AudioCaptureClient::new(config.capture.clone(), input);
        Ok(Self {
            config,
            transport,
            inbound,
            capture,
            playback: PlaybackQueue::new(sink),
        })
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    /// Run the conversation until `shutdown` resolves or the server closes.
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ClientSummary, VoiceError> {
        if let Err(e) = self.await_session_ready().await {
            self.transport.close().await;
            return Err(e);
        }

        let mut capture_events = match self.capture.start() {
            Ok(events) => events,
            Err(e) => {
                self.transport.close().await;
                return Err(e);
            }
        };

        let session_id = self.config.session_id.clone();
        let mut summary = ClientSummary::default();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!(session_id = %session_id, "Voice client shutting down");
                    break;
                }
                event = capture_events.recv() => {
                    let Some(event) = event else { break };
                    if !self.on_capture_event(event, &mut summary).await {
                        break;
                    }
                }
                envelope = self.inbound.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::info!(session_id = %session_id, "Server closed the voice session");
                        break;
                    };
                    self.on_envelope(envelope, &mut summary);
                }
            }
        }

        self.capture.stop().await;
        self.playback.clear();
        self.transport.close().await;
        Ok(summary)
    }

    async fn await_session_ready(&mut self) -> Result<(), VoiceError> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            let envelope = tokio::time::timeout_at(deadline, self.inbound.recv())
                .await
                .map_err(|_| VoiceError::Transport("timed out waiting for session_ready".into()))?
                .ok_or_else(|| VoiceError::Transport("closed before session_ready".into()))?;

            match envelope {
                Envelope::SessionReady {
                    session_id,
                    silence_timeout_ms,
                    min_speech_duration_ms,
                } => {
                    let mut capture = self.capture.config().clone();
                    capture.silence_timeout_ms = silence_timeout_ms;
                    capture.min_speech_duration_ms = min_speech_duration_ms;
                    self.capture.set_config(capture);
                    tracing::info!(
                        session_id = %session_id,
                        silence_timeout_ms,
                        min_speech_duration_ms,
                        "Voice session ready"
                    );
                    return Ok(());
                }
                Envelope::Error { code, message } => {
                    return Err(VoiceError::Transport(format!("{code}: {message}")));
                }
                other => {
                    tracing::debug!(kind = other.kind(), "Ignoring envelope before session_ready");
                }
            }
        }
    }

    /// Returns false once the transport is gone.
    async fn on_capture_event(&mut self, event: CaptureEvent, summary: &mut ClientSummary) -> bool {
        match event {
            CaptureEvent::SpeechStart => {
                if self.playback.is_speaking() {
                    tracing::info!(session_id = %self.config.session_id, "Barge-in over agent playback");
                    self.playback.clear();
                    summary.barge_ins += 1;
                    if let Err(e) = self.transport.send(Envelope::Interrupt).await {
                        tracing::warn!(error = %e, "Failed to send interrupt");
                        return false;
                    }
                }
                true
            }
            CaptureEvent::SpeechEnd(utterance) => {
                match self.transport.send_audio(&utterance.audio).await {
                    Ok(chunks) => {
                        summary.utterances_sent += 1;
                        tracing::debug!(
                            seq = utterance.seq,
                            chunks,
                            bytes = utterance.audio.len(),
                            "Utterance sent"
                        );
                        true
                    }
                    Err(e) => {
                        tracing::warn!(seq = utterance.seq, error = %e, "Failed to send utterance");
                        false
                    }
                }
            }
            CaptureEvent::SpeechDiscarded { speech } => {
                tracing::debug!(speech_ms = speech.as_millis() as u64, "Noise burst ignored");
                true
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope, summary: &mut ClientSummary) {
        match envelope {
            Envelope::AudioChunk { data, seq } => {
                summary.audio_chunks_received += 1;
                let n = summary.audio_chunks_received;
                if n == 1 || n.is_multiple_of(50) {
                    tracing::debug!(chunk = n, seq = ?seq, "Received agent audio");
                }
                self.playback.enqueue(data);
            }
            Envelope::Interrupted => {
                let dropped = self.playback.clear();
                tracing::debug!(dropped, "Server interrupted playback");
            }
            Envelope::StateChanged {
                state,
                speaker,
                turn_count,
            } => {
                summary.turns = turn_count;
                tracing::debug!(state = %state, speaker = ?speaker, turn_count, "Conversation state changed");
            }
            Envelope::Error { code, message } => {
                tracing::warn!(code = %code, message = %message, "Voice server reported an error");
            }
            other => {
                tracing::warn!(kind = other.kind(), "Unexpected envelope from server");
            }
        }
    }
}
