//! OpenAI Realtime WebSocket upstream.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: WebSocket to `wss://api.openai.com/v1/realtime?model=...`
//! 2. **Setup**: send `session.update` with instructions, voice, audio format
//!    and server VAD turn detection
//! 3. **Stream**: send `input_audio_buffer.append` (Base64 PCM16 24kHz),
//!    receive `response.audio.delta` (Base64 PCM16 24kHz) plus lifecycle events
//! 4. **Barge-in**: send `response.cancel` to stop the current response
//! 5. **Close**: gracefully close the WebSocket session

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::session::SessionConfig;
use super::upstream::{UpstreamConnector, UpstreamHandle, UpstreamLink};
use super::VoiceEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// OpenAI Realtime WebSocket endpoint.
pub const OPENAI_REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

const CHANNEL_CAPACITY: usize = 256;

// ── Outbound message ───────────────────────────────────────────────

#[derive(Debug)]
enum OutboundMessage {
    /// Raw PCM16 bytes → Base64 → `input_audio_buffer.append`.
    Audio(Vec<u8>),
    CancelResponse,
    Close,
}

// ── Connector ──────────────────────────────────────────────────────

pub struct OpenAiRealtimeConnector {
    url: String,
    api_key: String,
}

impl OpenAiRealtimeConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl UpstreamConnector for OpenAiRealtimeConnector {
    fn name(&self) -> &str {
        "openai-realtime"
    }

    async fn connect(
        &self,
        session_id: &str,
        config: &SessionConfig,
    ) -> anyhow::Result<UpstreamLink> {
        let (session, events) =
            OpenAiRealtimeSession::connect(session_id.to_string(), &self.url, &self.api_key, config)
                .await?;
        Ok(UpstreamLink {
            handle: Arc::new(session),
            events,
        })
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Handle for one OpenAI Realtime session. Events arrive on the receiver
/// returned by [`OpenAiRealtimeSession::connect`].
pub struct OpenAiRealtimeSession {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    session_id: String,
}

impl OpenAiRealtimeSession {
    pub async fn connect(
        session_id: String,
        base_url: &str,
        api_key: &str,
        config: &SessionConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<VoiceEvent>)> {
        let url = format!(
            "{base_url}?model={}",
            urlencoding::encode(&config.model)
        );

        tracing::info!(
            session_id = %session_id,
            model = %config.model,
            voice = %config.voice,
            "Connecting to OpenAI Realtime"
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build WebSocket request: {e}"))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {api_key}")
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid auth header: {e}"))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid header: {e}"))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to OpenAI Realtime: {e}"))?;

        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let update_json = serde_json::to_string(&build_session_update(config))?;
        tracing::debug!(session_id = %session_id, "Sending OpenAI session.update");
        ws_sender
            .send(WsMessage::Text(update_json.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send session.update: {e}"))?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<VoiceEvent>(CHANNEL_CAPACITY);

        let sid_out = session_id.clone();
        tokio::spawn(async move {
            Self::outbound_loop(outbound_rx, ws_sender, sid_out).await;
        });

        let sid_in = session_id.clone();
        tokio::spawn(async move {
            Self::inbound_loop(ws_receiver, event_tx, sid_in).await;
        });

        Ok((
            Self {
                outbound_tx,
                session_id,
            },
            event_rx,
        ))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── Internal loops ────────────────────────────────────────────

    async fn outbound_loop(
        mut rx: mpsc::Receiver<OutboundMessage>,
        mut ws_sender: SplitSink<WsStream, WsMessage>,
        session_id: String,
    ) {
        let mut audio_chunk_count: u64 = 0;

        while let Some(msg) = rx.recv().await {
            let payload = match msg {
                OutboundMessage::Audio(pcm) => {
                    audio_chunk_count += 1;
                    if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                        tracing::info!(
                            session_id = %session_id,
                            chunk = audio_chunk_count,
                            pcm_bytes = pcm.len(),
                            "Sending audio chunk to OpenAI Realtime"
                        );
                    }
                    serde_json::json!({
                        "type": "input_audio_buffer.append",
                        "audio": base64::engine::general_purpose::STANDARD.encode(&pcm),
                    })
                }
                OutboundMessage::CancelResponse => {
                    tracing::info!(session_id = %session_id, "Cancelling OpenAI response");
                    serde_json::json!({ "type": "response.cancel" })
                }
                OutboundMessage::Close => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            };

            let Ok(json) = serde_json::to_string(&payload) else {
                continue;
            };
            if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                tracing::warn!(
                    session_id = %session_id,
                    "WebSocket send failed, closing outbound loop"
                );
                break;
            }
        }

        tracing::debug!(session_id = %session_id, "OpenAI Realtime outbound loop terminated");
    }

    async fn inbound_loop(
        mut ws_receiver: SplitStream<WsStream>,
        event_tx: mpsc::Sender<VoiceEvent>,
        session_id: String,
    ) {
        let start_time = std::time::Instant::now();
        let mut audio_response_count: u64 = 0;

        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => {
                    let events = parse_server_event(
                        text.as_str(),
                        &session_id,
                        start_time,
                        &mut audio_response_count,
                    );
                    for event in events {
                        if event_tx.send(event).await.is_err() {
                            tracing::debug!(
                                session_id = %session_id,
                                "Event receiver dropped, closing inbound loop"
                            );
                            return;
                        }
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(
                        session_id = %session_id,
                        close_frame = ?frame,
                        "OpenAI Realtime connection closed"
                    );
                    break;
                }
                Ok(
                    WsMessage::Ping(_)
                    | WsMessage::Pong(_)
                    | WsMessage::Frame(_)
                    | WsMessage::Binary(_),
                ) => {}
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "OpenAI Realtime WebSocket error"
                    );
                    let _ = event_tx
                        .send(VoiceEvent::Error {
                            message: format!("WebSocket error: {e}"),
                        })
                        .await;
                    break;
                }
            }
        }

        // dropping event_tx ends the orchestrator's stream
        tracing::debug!(session_id = %session_id, "OpenAI Realtime inbound loop terminated");
    }
}

#[async_trait]
impl UpstreamHandle for OpenAiRealtimeSession {
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.outbound_tx
            .send(OutboundMessage::Audio(pcm.to_vec()))
            .await
            .map_err(|_| anyhow::anyhow!("Audio channel closed"))
    }

    async fn cancel_response(&self) -> anyhow::Result<()> {
        self.outbound_tx
            .send(OutboundMessage::CancelResponse)
            .await
            .map_err(|_| anyhow::anyhow!("Control channel closed"))
    }

    async fn close(&self) {
        let _ = self.outbound_tx.send(OutboundMessage::Close).await;
    }
}

// ── Session update message ─────────────────────────────────────────

fn build_session_update(config: &SessionConfig) -> serde_json::Value {
    let mut session = serde_json::json!({
        "instructions": config.instructions,
        "voice": config.voice,
        "input_audio_format": "pcm16",
        "output_audio_format": "pcm16",
        "turn_detection": {
            "type": "server_vad",
            "silence_duration_ms": config.silence_timeout_ms,
            "create_response": true
        }
    });
    if let Some(model) = &config.transcription_model {
        session["input_audio_transcription"] = serde_json::json!({ "model": model });
    }

    serde_json::json!({
        "type": "session.update",
        "session": session,
    })
}

// ── Server event parsing ───────────────────────────────────────────

fn parse_server_event(
    json_text: &str,
    session_id: &str,
    start_time: std::time::Instant,
    audio_response_count: &mut u64,
) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    let elapsed = start_time.elapsed().as_secs_f32();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Dropping unparseable OpenAI event"
            );
            return events;
        }
    };

    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "session.created" | "session.updated" => {
            tracing::info!(
                session_id = %session_id,
                event_type = event_type,
                "OpenAI Realtime session ready"
            );
            events.push(VoiceEvent::SetupComplete);
        }

        "input_audio_buffer.speech_started" => {
            tracing::info!(
                session_id = %session_id,
                t = format!("{elapsed:.1}s"),
                "⬇ Server VAD: speech started"
            );
            events.push(VoiceEvent::SpeechStarted);
        }
        "input_audio_buffer.speech_stopped" => {
            tracing::info!(
                session_id = %session_id,
                t = format!("{elapsed:.1}s"),
                "⬇ Server VAD: speech stopped"
            );
            events.push(VoiceEvent::SpeechStopped);
        }

        "response.created" => {
            let response_id = value
                .get("response")
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            tracing::info!(
                session_id = %session_id,
                t = format!("{elapsed:.1}s"),
                response_id = response_id.as_deref().unwrap_or("-"),
                "⬇ Response created"
            );
            events.push(VoiceEvent::ResponseCreated { response_id });
        }

        // the GA API renamed the delta event
        "response.audio.delta" | "response.output_audio.delta" => {
            let Some(delta_b64) = value.get("delta").and_then(|v| v.as_str()) else {
                return events;
            };
            match base64::engine::general_purpose::STANDARD.decode(delta_b64) {
                Ok(audio_bytes) => {
                    *audio_response_count += 1;
                    if *audio_response_count == 1 || (*audio_response_count).is_multiple_of(50) {
                        tracing::info!(
                            session_id = %session_id,
                            t = format!("{elapsed:.1}s"),
                            audio_n = *audio_response_count,
                            bytes = audio_bytes.len(),
                            "⬇ OpenAI audio response"
                        );
                    }
                    events.push(VoiceEvent::Audio { data: audio_bytes });
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Bad audio delta");
                }
            }
        }

        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            if let Some(text) = value.get("delta").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(VoiceEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        "conversation.item.input_audio_transcription.completed" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(VoiceEvent::InputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        // response.done carries the final status; a cancelled response ends
        // with status "cancelled" rather than a separate event
        "response.done" => {
            let status = value
                .get("response")
                .and_then(|r| r.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or("completed");
            tracing::info!(
                session_id = %session_id,
                t = format!("{elapsed:.1}s"),
                status,
                "⬇ Response done"
            );
            match status {
                "cancelled" => events.push(VoiceEvent::ResponseCancelled),
                "failed" => {
                    let message = value
                        .pointer("/response/status_details/error/message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("response failed");
                    events.push(VoiceEvent::Error {
                        message: message.to_string(),
                    });
                }
                _ => events.push(VoiceEvent::ResponseDone),
            }
        }

        "response.cancelled" => {
            tracing::info!(
                session_id = %session_id,
                t = format!("{elapsed:.1}s"),
                "⬇ Response cancelled"
            );
            events.push(VoiceEvent::ResponseCancelled);
        }

        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown OpenAI error");
            let code = value
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            // cancelling when nothing is in flight is harmless
            if code == "response_cancel_not_active" {
                tracing::debug!(session_id = %session_id, "Cancel ignored: no active response");
                return events;
            }
            tracing::error!(
                session_id = %session_id,
                error = %message,
                "OpenAI Realtime error"
            );
            events.push(VoiceEvent::Error {
                message: message.to_string(),
            });
        }

        _ => {
            tracing::debug!(
                session_id = %session_id,
                event_type = event_type,
                "OpenAI Realtime event (unhandled)"
            );
        }
    }

    events
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Vec<VoiceEvent> {
        let mut count = 0;
        parse_server_event(json, "test", std::time::Instant::now(), &mut count)
    }

    #[test]
    fn build_session_update_contains_session_settings() {
        let config = SessionConfig {
            instructions: "Be brief.".into(),
            voice: "verse".into(),
            silence_timeout_ms: 900,
            ..SessionConfig::default()
        };
        let msg = build_session_update(&config);

        assert_eq!(msg["type"], "session.update");
        assert_eq!(msg["session"]["instructions"], "Be brief.");
        assert_eq!(msg["session"]["voice"], "verse");
        assert_eq!(msg["session"]["input_audio_format"], "pcm16");
        assert_eq!(msg["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(msg["session"]["turn_detection"]["silence_duration_ms"], 900);
        assert_eq!(
            msg["session"]["input_audio_transcription"]["model"],
            "gpt-4o-mini-transcribe"
        );
    }

    #[test]
    fn session_update_omits_transcription_when_unset() {
        let config = SessionConfig {
            transcription_model: None,
            ..SessionConfig::default()
        };
        let msg = build_session_update(&config);
        assert!(msg["session"].get("input_audio_transcription").is_none());
    }

    #[test]
    fn parse_session_created() {
        let events = parse(r#"{"type": "session.created", "session": {}}"#);
        assert_eq!(events, vec![VoiceEvent::SetupComplete]);
    }

    #[test]
    fn parse_vad_events() {
        assert_eq!(
            parse(r#"{"type": "input_audio_buffer.speech_started"}"#),
            vec![VoiceEvent::SpeechStarted]
        );
        assert_eq!(
            parse(r#"{"type": "input_audio_buffer.speech_stopped"}"#),
            vec![VoiceEvent::SpeechStopped]
        );
    }

    #[test]
    fn parse_response_created_keeps_id() {
        let events = parse(r#"{"type": "response.created", "response": {"id": "resp_1"}}"#);
        assert_eq!(
            events,
            vec![VoiceEvent::ResponseCreated {
                response_id: Some("resp_1".into())
            }]
        );
    }

    #[test]
    fn parse_audio_delta_both_names() {
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode([10u8, 20, 30]);
        for name in ["response.audio.delta", "response.output_audio.delta"] {
            let json = format!(r#"{{"type": "{name}", "delta": "{audio_b64}"}}"#);
            let mut count = 0;
            let events = parse_server_event(&json, "test", std::time::Instant::now(), &mut count);
            assert_eq!(
                events,
                vec![VoiceEvent::Audio {
                    data: vec![10, 20, 30]
                }]
            );
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn bad_audio_delta_is_dropped() {
        assert!(parse(r#"{"type": "response.audio.delta", "delta": "%%%"}"#).is_empty());
    }

    #[test]
    fn parse_response_done_by_status() {
        assert_eq!(parse(r#"{"type": "response.done"}"#), vec![VoiceEvent::ResponseDone]);
        assert_eq!(
            parse(r#"{"type": "response.done", "response": {"status": "cancelled"}}"#),
            vec![VoiceEvent::ResponseCancelled]
        );
        let failed = parse(
            r#"{"type": "response.done", "response": {"status": "failed",
                "status_details": {"error": {"message": "server overloaded"}}}}"#,
        );
        assert!(matches!(
            &failed[..],
            [VoiceEvent::Error { message }] if message == "server overloaded"
        ));
    }

    #[test]
    fn parse_response_cancelled() {
        assert_eq!(
            parse(r#"{"type": "response.cancelled"}"#),
            vec![VoiceEvent::ResponseCancelled]
        );
    }

    #[test]
    fn parse_transcripts() {
        assert!(matches!(
            &parse(r#"{"type": "response.audio_transcript.delta", "delta": "hello"}"#)[..],
            [VoiceEvent::OutputTranscript { text }] if text == "hello"
        ));
        assert!(matches!(
            &parse(r#"{"type": "conversation.item.input_audio_transcription.completed", "transcript": "hi there"}"#)[..],
            [VoiceEvent::InputTranscript { text }] if text == "hi there"
        ));
    }

    #[test]
    fn parse_error_event() {
        let events = parse(r#"{"type": "error", "error": {"message": "Rate limit exceeded"}}"#);
        assert!(matches!(
            &events[..],
            [VoiceEvent::Error { message }] if message.contains("Rate limit")
        ));
    }

    #[test]
    fn cancel_without_active_response_is_not_an_error() {
        let events = parse(
            r#"{"type": "error", "error": {"code": "response_cancel_not_active", "message": "no active response"}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn unparseable_and_unknown_events_are_dropped() {
        assert!(parse("not json").is_empty());
        assert!(parse(r#"{"type": "rate_limits.updated"}"#).is_empty());
    }
}
