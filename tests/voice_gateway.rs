//! End-to-end tests: the real gateway router on an ephemeral port, a
//! scripted upstream, and tokio-tungstenite clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parley::client::playback::{DecodedAudio, Pcm16Sink};
use parley::client::{ChannelInput, VoiceClient, VoiceClientConfig};
use parley::error::{RejectReason, VoiceError};
use parley::gateway::auth::CredentialAuthority;
use parley::gateway::{serve, AppState};
use parley::reliability::RetryPolicy;
use parley::voice::events::{decode_audio, Envelope};
use parley::voice::fallback::FallbackAudio;
use parley::voice::scripted::{ScriptedConnector, ScriptedSession};
use parley::voice::state::{ConversationLabel, Speaker};
use parley::voice::{SessionConfig, SessionRegistry, VoiceEvent};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-test-secret-0123456789";
const WAIT: Duration = Duration::from_secs(5);

struct TestGateway {
    base: String,
    registry: Arc<SessionRegistry>,
    authority: Arc<CredentialAuthority>,
    connector: Arc<ScriptedConnector>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    async fn start(session_config: SessionConfig) -> Self {
        Self::start_with(session_config, ScriptedConnector::new()).await
    }

    async fn start_with(session_config: SessionConfig, connector: ScriptedConnector) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Arc::new(SessionRegistry::new(8));
        let authority = Arc::new(CredentialAuthority::new(SECRET, Duration::from_secs(300)));
        let connector = Arc::new(connector);
        let state = AppState {
            registry: Arc::clone(&registry),
            authority: Arc::clone(&authority),
            connector: connector.clone(),
            session_config: Arc::new(session_config),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, state, async {
            let _ = shutdown_rx.await;
        }));

        Self {
            base: format!("ws://{addr}/api/voice/ws"),
            registry,
            authority,
            connector,
            shutdown: Some(shutdown_tx),
            server,
        }
    }

    fn url(&self, session_id: &str, token: &str) -> String {
        format!("{}?session_id={session_id}&token={token}", self.base)
    }

    async fn connect(&self, session_id: &str) -> Client {
        let token = self.authority.issue(session_id).unwrap();
        let (ws, _) = tokio_tungstenite::connect_async(self.url(session_id, &token))
            .await
            .unwrap();
        ws
    }

    /// Connect and wait until the orchestrator's upstream is live.
    async fn connect_ready(&self, session_id: &str) -> (Client, ScriptedSession) {
        let mut ws = self.connect(session_id).await;
        assert!(matches!(next_envelope(&mut ws).await, Envelope::SessionReady { .. }));
        let upstream = tokio::time::timeout(WAIT, self.connector.wait_for_session(session_id))
            .await
            .unwrap();
        let orchestrator = self.registry.get(session_id).unwrap();
        assert!(tokio::time::timeout(WAIT, orchestrator.wait_ready()).await.unwrap());
        (ws, upstream)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.server).await;
    }
}

async fn rejected_status(url: &str) -> u16 {
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected HTTP rejection, got {other}"),
        Ok(_) => panic!("connection unexpectedly accepted"),
    }
}

async fn next_envelope(ws: &mut Client) -> Envelope {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::parse(text.as_str()).unwrap();
        }
    }
}

async fn next_state(ws: &mut Client) -> (ConversationLabel, Speaker, u64) {
    match next_envelope(ws).await {
        Envelope::StateChanged {
            state,
            speaker,
            turn_count,
        } => (state, speaker, turn_count),
        other => panic!("expected state_changed, got {other:?}"),
    }
}

async fn send_envelope(ws: &mut Client, envelope: &Envelope) {
    ws.send(Message::Text(envelope.to_json().unwrap().into()))
        .await
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Connection admission ────────────────────────────────────────

#[tokio::test]
async fn connect_without_credential_is_rejected_before_upgrade() {
    let gateway = TestGateway::start(SessionConfig::default()).await;

    let status = rejected_status(&format!("{}?session_id=abc", gateway.base)).await;
    assert_eq!(status, 401);

    let status = rejected_status(&gateway.url("abc", "v1.1.deadbeef")).await;
    assert_eq!(status, 401);

    // a valid credential for a different session
    let other = gateway.authority.issue("other").unwrap();
    let status = rejected_status(&gateway.url("abc", &other)).await;
    assert_eq!(status, 401);

    assert!(gateway.registry.is_empty());
    assert!(gateway.connector.session("abc").is_none());
    gateway.stop().await;
}

#[tokio::test]
async fn malformed_session_id_is_bad_request() {
    let gateway = TestGateway::start(SessionConfig::default()).await;

    let token = gateway.authority.issue("abc").unwrap();
    let status = rejected_status(&gateway.url("bad%20id", &token)).await;
    assert_eq!(status, 400);

    let status = rejected_status(&format!("{}?token={token}", gateway.base)).await;
    assert_eq!(status, 400);

    assert!(gateway.registry.is_empty());
    gateway.stop().await;
}

#[tokio::test]
async fn second_connection_for_live_session_conflicts() {
    let gateway = TestGateway::start(SessionConfig::default()).await;
    let (_ws, _upstream) = gateway.connect_ready("dup").await;

    let token = gateway.authority.issue("dup").unwrap();
    let status = rejected_status(&gateway.url("dup", &token)).await;
    assert_eq!(status, 409);
    assert_eq!(gateway.registry.len(), 1);
    gateway.stop().await;
}

// ── Session lifecycle ───────────────────────────────────────────

#[tokio::test]
async fn session_ready_announces_capture_settings() {
    let config = SessionConfig {
        silence_timeout_ms: 600,
        min_speech_duration_ms: 150,
        ..SessionConfig::default()
    };
    let gateway = TestGateway::start(config).await;
    let mut ws = gateway.connect("ready-1").await;

    assert_eq!(
        next_envelope(&mut ws).await,
        Envelope::SessionReady {
            session_id: "ready-1".into(),
            silence_timeout_ms: 600,
            min_speech_duration_ms: 150,
        }
    );
    gateway.stop().await;
}

#[tokio::test]
async fn full_turn_streams_state_and_audio() {
    let gateway = TestGateway::start(SessionConfig::default()).await;
    let (mut ws, upstream) = gateway.connect_ready("turn-1").await;

    assert!(upstream.emit(VoiceEvent::SpeechStarted).await);
    assert_eq!(next_state(&mut ws).await, (ConversationLabel::Listening, Speaker::User, 0));

    assert!(upstream.emit(VoiceEvent::SpeechStopped).await);
    assert_eq!(next_state(&mut ws).await.0, ConversationLabel::Processing);

    assert!(upstream
        .emit(VoiceEvent::ResponseCreated {
            response_id: Some("resp_1".into())
        })
        .await);
    assert_eq!(next_state(&mut ws).await.0, ConversationLabel::Thinking);

    assert!(upstream.emit(VoiceEvent::Audio { data: vec![1, 2, 3, 4] }).await);
    assert_eq!(next_state(&mut ws).await, (ConversationLabel::Speaking, Speaker::Agent, 0));
    match next_envelope(&mut ws).await {
        Envelope::AudioChunk { data, seq } => {
            assert_eq!(decode_audio(&data).unwrap(), vec![1, 2, 3, 4]);
            assert_eq!(seq, Some(0));
        }
        other => panic!("expected audio, got {other:?}"),
    }

    assert!(upstream.emit(VoiceEvent::Audio { data: vec![5, 6] }).await);
    assert!(matches!(
        next_envelope(&mut ws).await,
        Envelope::AudioChunk { seq: Some(1), .. }
    ));

    assert!(upstream.emit(VoiceEvent::ResponseDone).await);
    assert_eq!(next_state(&mut ws).await, (ConversationLabel::Waiting, Speaker::None, 1));

    gateway.stop().await;
}

#[tokio::test]
async fn client_audio_is_relayed_and_garbage_is_ignored() {
    let gateway = TestGateway::start(SessionConfig::default()).await;
    let (mut ws, upstream) = gateway.connect_ready("relay-1").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"telepathy"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"audio_chunk","data":"***"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();

    send_envelope(&mut ws, &Envelope::audio(&[10, 20, 30, 40], None)).await;
    send_envelope(&mut ws, &Envelope::audio(&[50, 60], Some(1))).await;

    eventually(|| upstream.received_audio().len() == 2).await;
    assert_eq!(
        upstream.received_audio(),
        vec![vec![10, 20, 30, 40], vec![50, 60]]
    );
    gateway.stop().await;
}

#[tokio::test]
async fn client_interrupt_cancels_response_in_flight() {
    let gateway = TestGateway::start(SessionConfig::default()).await;
    let (mut ws, upstream) = gateway.connect_ready("barge-1").await;

    upstream.emit(VoiceEvent::SpeechStarted).await;
    upstream.emit(VoiceEvent::SpeechStopped).await;
    upstream
        .emit(VoiceEvent::ResponseCreated { response_id: None })
        .await;
    upstream.emit(VoiceEvent::Audio { data: vec![0; 8] }).await;
    for _ in 0..4 {
        next_state(&mut ws).await;
    }
    assert!(matches!(next_envelope(&mut ws).await, Envelope::AudioChunk { .. }));

    send_envelope(&mut ws, &Envelope::Interrupt).await;
    assert_eq!(next_envelope(&mut ws).await, Envelope::Interrupted);
    assert_eq!(next_state(&mut ws).await.0, ConversationLabel::Waiting);
    assert_eq!(upstream.cancel_count(), 1);

    // late audio of the cancelled response never reaches the client
    upstream.emit(VoiceEvent::Audio { data: vec![9; 8] }).await;
    upstream.emit(VoiceEvent::SpeechStarted).await;
    assert_eq!(next_state(&mut ws).await.0, ConversationLabel::Listening);
    gateway.stop().await;
}

#[tokio::test]
async fn upstream_error_plays_fallback_and_keeps_session() {
    let config = SessionConfig {
        fallback: Some(Arc::new(FallbackAudio::from_bytes(vec![7u8; 6]))),
        ..SessionConfig::default()
    };
    let gateway = TestGateway::start(config).await;
    let (mut ws, upstream) = gateway.connect_ready("fail-1").await;

    upstream.emit(VoiceEvent::SpeechStarted).await;
    upstream.emit(VoiceEvent::SpeechStopped).await;
    next_state(&mut ws).await;
    next_state(&mut ws).await;

    upstream
        .emit(VoiceEvent::Error {
            message: "model overloaded".into(),
        })
        .await;
    assert_eq!(next_state(&mut ws).await.0, ConversationLabel::Waiting);
    match next_envelope(&mut ws).await {
        Envelope::Error { code, message } => {
            assert_eq!(code, "upstream_error");
            assert_eq!(message, "model overloaded");
        }
        other => panic!("expected error, got {other:?}"),
    }
    match next_envelope(&mut ws).await {
        Envelope::AudioChunk { data, .. } => assert_eq!(decode_audio(&data).unwrap(), vec![7u8; 6]),
        other => panic!("expected fallback audio, got {other:?}"),
    }

    // still live
    assert!(gateway.registry.contains("fail-1"));
    upstream.emit(VoiceEvent::SpeechStarted).await;
    assert_eq!(next_state(&mut ws).await.0, ConversationLabel::Listening);
    gateway.stop().await;
}

#[tokio::test]
async fn client_close_cleans_up_session() {
    let gateway = TestGateway::start(SessionConfig::default()).await;
    let (mut ws, upstream) = gateway.connect_ready("close-1").await;
    assert_eq!(gateway.registry.len(), 1);

    ws.close(None).await.unwrap();

    let registry = Arc::clone(&gateway.registry);
    eventually(|| registry.is_empty()).await;
    eventually(|| upstream.is_closed()).await;

    // the id is free again
    let (_ws, _upstream) = gateway.connect_ready("close-1").await;
    gateway.stop().await;
}

#[tokio::test]
async fn upstream_hang_up_reconnects_and_relays_next_utterance() {
    let config = SessionConfig {
        reconnect: RetryPolicy::new(3, Duration::from_millis(20)),
        ..SessionConfig::default()
    };
    let gateway = TestGateway::start(config).await;
    let (mut ws, upstream) = gateway.connect_ready("drop-1").await;

    upstream.hang_up();
    match next_envelope(&mut ws).await {
        Envelope::Error { code, .. } => assert_eq!(code, "upstream_closed"),
        other => panic!("expected error, got {other:?}"),
    }

    let connector = Arc::clone(&gateway.connector);
    eventually(|| connector.connect_count() == 2).await;
    let orchestrator = gateway.registry.get("drop-1").unwrap();
    assert!(tokio::time::timeout(WAIT, orchestrator.wait_ready()).await.unwrap());

    send_envelope(&mut ws, &Envelope::audio(&[4, 5, 6], None)).await;
    let fresh = gateway.connector.session("drop-1").unwrap();
    eventually(|| fresh.received_audio() == vec![vec![4, 5, 6]]).await;
    assert!(gateway.registry.contains("drop-1"));
    gateway.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_ends_session_and_closes_socket() {
    let config = SessionConfig {
        reconnect: RetryPolicy::new(1, Duration::from_millis(20)),
        ..SessionConfig::default()
    };
    let gateway = TestGateway::start_with(config, ScriptedConnector::failing()).await;
    let mut ws = gateway.connect("down-1").await;
    assert!(matches!(next_envelope(&mut ws).await, Envelope::SessionReady { .. }));

    match next_envelope(&mut ws).await {
        Envelope::Error { code, .. } => assert_eq!(code, "upstream_unavailable"),
        other => panic!("expected error, got {other:?}"),
    }
    match next_envelope(&mut ws).await {
        Envelope::Error { code, .. } => assert_eq!(code, "session_ended"),
        other => panic!("expected error, got {other:?}"),
    }

    // the server closes the socket
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket stayed open");

    let registry = Arc::clone(&gateway.registry);
    eventually(|| registry.is_empty()).await;
    assert_eq!(gateway.connector.connect_count(), 2);
    gateway.stop().await;
}

// ── Full client ─────────────────────────────────────────────────

#[tokio::test]
async fn voice_client_round_trip() {
    let config = SessionConfig {
        silence_timeout_ms: 200,
        min_speech_duration_ms: 60,
        ..SessionConfig::default()
    };
    let gateway = TestGateway::start(config).await;

    let (input, frames) = ChannelInput::new();
    let played = Arc::new(Mutex::new(Vec::<i16>::new()));
    let sink_played = Arc::clone(&played);
    let sink = Pcm16Sink::new(move |audio: DecodedAudio| {
        sink_played.lock().extend(audio.samples);
    });

    let token = gateway.authority.issue("client-1").unwrap();
    let client = VoiceClient::connect(
        VoiceClientConfig::new(gateway.base.clone(), "client-1", token),
        Arc::new(input),
        Arc::new(sink),
    )
    .await
    .unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn(client.run(async {
        let _ = stop_rx.await;
    }));

    let upstream = tokio::time::timeout(WAIT, gateway.connector.wait_for_session("client-1"))
        .await
        .unwrap();
    let orchestrator = gateway.registry.get("client-1").unwrap();
    assert!(tokio::time::timeout(WAIT, orchestrator.wait_ready()).await.unwrap());

    // ~300ms of speech then silence well past the hangover
    for i in 0..60 {
        let frame = if i < 15 {
            (0..480).map(|n| if n % 2 == 0 { 6_000 } else { -6_000 }).collect()
        } else {
            vec![0i16; 480]
        };
        frames.push(frame);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    eventually(|| !upstream.received_audio().is_empty()).await;
    let sent: usize = upstream.received_audio().iter().map(Vec::len).sum();
    assert!(sent > 0 && sent % 2 == 0);

    upstream
        .emit(VoiceEvent::ResponseCreated { response_id: None })
        .await;
    upstream
        .emit(VoiceEvent::Audio {
            data: [3i16, -3, 5].iter().flat_map(|s| s.to_le_bytes()).collect(),
        })
        .await;
    upstream.emit(VoiceEvent::ResponseDone).await;

    let played_view = Arc::clone(&played);
    eventually(move || played_view.lock().len() == 3).await;
    assert_eq!(*played.lock(), vec![3, -3, 5]);

    let _ = stop_tx.send(());
    let summary = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.utterances_sent, 1);
    assert_eq!(summary.audio_chunks_received, 1);

    let registry = Arc::clone(&gateway.registry);
    eventually(|| registry.is_empty()).await;
    gateway.stop().await;
}

#[tokio::test]
async fn voice_client_surfaces_rejection() {
    let gateway = TestGateway::start(SessionConfig::default()).await;
    let (input, _frames) = ChannelInput::new();
    let sink = Pcm16Sink::new(|_audio: DecodedAudio| {});

    let result = VoiceClient::connect(
        VoiceClientConfig::new(gateway.base.clone(), "client-2", "v1.0.00"),
        Arc::new(input),
        Arc::new(sink),
    )
    .await;

    assert!(matches!(
        result,
        Err(VoiceError::TransportRejected(RejectReason::Status(401)))
    ));
    gateway.stop().await;
}
