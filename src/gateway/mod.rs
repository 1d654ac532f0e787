//! Axum gateway: health endpoint plus the voice WebSocket.
//!
//! - Credentials and session id are checked before the upgrade, so a
//!   rejected attempt never creates session state
//! - One `AgentOrchestrator` per connection, registered under its session id
//! - Single writer task per socket fed by an mpsc channel (send order =
//!   delivery order)
//! - Malformed client frames are dropped with a warning; the connection stays up

pub mod auth;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::Config;
use crate::error::RejectReason;
use crate::reliability::RetryPolicy;
use crate::voice::events::{decode_audio, Envelope, MAX_ENVELOPE_BYTES};
use crate::voice::fallback::FallbackAudio;
use crate::voice::openai_realtime::OpenAiRealtimeConnector;
use crate::voice::{AgentOrchestrator, SessionConfig, SessionRegistry, UpstreamConnector};
use auth::{authorize, ConnectParams, CredentialAuthority};

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;

/// Envelopes queued per connection before the orchestrator waits on the
/// client socket.
const OUTBOUND_BUFFER: usize = 512;

/// How long a closing session waits for queued envelopes to reach the client.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames above this are refused by the socket layer itself; anything
/// between `MAX_ENVELOPE_BYTES` and this is dropped with a warning.
const MAX_WS_MESSAGE_BYTES: usize = 1024 * 1024;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub authority: Arc<CredentialAuthority>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub session_config: Arc<SessionConfig>,
}

/// Build the router. Split from [`run_gateway`] so tests can serve it on an
/// ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/voice/ws", get(handle_voice_ws))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
}

/// Serve `router(state)` on `listener` until `shutdown` resolves, then close
/// every live session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    let closed = registry.shutdown().await;
    if closed > 0 {
        tracing::info!(sessions = closed, "Closed live sessions on shutdown");
    }
    Ok(())
}

/// Run the voice gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let api_key = config
        .upstream
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .context("Upstream API key not configured. Set OPENAI_API_KEY or [upstream] api_key.")?;

    let ttl = Duration::from_secs(config.auth.credential_ttl_secs);
    let authority = match config.auth.credential_secret.as_deref() {
        Some(secret) => CredentialAuthority::new(secret, ttl),
        None => {
            tracing::warn!(
                "No auth.credential_secret configured; using an ephemeral secret. \
                 Credentials will not survive a restart."
            );
            CredentialAuthority::ephemeral(ttl)
        }
    };

    if config.upstream.preflight {
        let policy = RetryPolicy::from(&config.reliability);
        let client = reqwest::Client::new();
        match crate::voice::preflight::check_model(
            &client,
            &config.upstream.status_url,
            &api_key,
            &config.upstream.model,
            &policy,
        )
        .await
        {
            Ok(()) => tracing::info!(model = %config.upstream.model, "Upstream model reachable"),
            Err(e) => tracing::warn!(error = %e, "Upstream preflight failed; continuing"),
        }
    }

    let fallback = FallbackAudio::load_optional(config.fallback.error_audio_path.as_deref()).await;
    let session_config = SessionConfig::from_config(&config, fallback);

    let state = AppState {
        registry: Arc::new(SessionRegistry::new(config.gateway.max_sessions)),
        authority: Arc::new(authority),
        connector: Arc::new(OpenAiRealtimeConnector::new(
            config.upstream.url.clone(),
            api_key,
        )),
        session_config: Arc::new(session_config),
    };

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.gateway.host))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        model = %config.upstream.model,
        "Voice gateway listening"
    );

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested");
    })
    .await
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
    }))
}

/// Map a refusal to the HTTP answer for the upgrade request.
pub fn reject_response(reason: RejectReason) -> Response {
    let status =
        StatusCode::from_u16(reason.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, reason.to_string()).into_response()
}

/// GET /api/voice/ws?session_id=...&token=...: voice session WebSocket.
///
/// Protocol (JSON text frames, see `voice::events`):
/// 1. Server sends `session_ready` with the capture settings for this session
/// 2. Client sends `audio_chunk` (finished utterances, chunked) and `interrupt`
/// 3. Server sends `state_changed`, `audio_chunk` (agent speech, with `seq`),
///    `interrupted` and `error`
async fn handle_voice_ws(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = match authorize(&state.authority, &params) {
        Ok(id) => id,
        Err(reason) => {
            tracing::warn!(
                session_id = params.session_id.as_deref().unwrap_or("-"),
                reason = %reason,
                "Rejecting voice connection"
            );
            return reject_response(reason);
        }
    };

    if let Err(reason) = state.registry.can_admit(&session_id) {
        tracing::warn!(session_id = %session_id, reason = %reason, "Rejecting voice connection");
        return reject_response(reason);
    }

    ws.max_message_size(MAX_WS_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_voice_connection(socket, state, session_id))
}

/// Bridge one client socket to its orchestrator:
/// Client → (audio_chunk) → Orchestrator → Upstream
///                                           ↓
/// Client ← (audio_chunk + events) ← Orchestrator
async fn handle_voice_connection(socket: WebSocket, state: AppState, session_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);

    let orchestrator = AgentOrchestrator::new(
        session_id.clone(),
        (*state.session_config).clone(),
        outbound_tx.clone(),
    );

    // lost the race against a concurrent connect for the same id
    if let Err(reason) = state.registry.insert(&session_id, Arc::clone(&orchestrator)) {
        tracing::warn!(session_id = %session_id, reason = %reason, "Closing duplicate connection");
        if let Ok(json) = Envelope::error("session_rejected", reason.to_string()).to_json() {
            let _ = ws_sender.send(Message::Text(json.into())).await;
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    }
    tracing::info!(session_id = %session_id, "Voice session connected");

    let ready = Envelope::SessionReady {
        session_id: session_id.clone(),
        silence_timeout_ms: state.session_config.silence_timeout_ms,
        min_speech_duration_ms: state.session_config.min_speech_duration_ms,
    };
    let _ = outbound_tx.send(ready).await;
    drop(outbound_tx);

    orchestrator.start(Arc::clone(&state.connector));

    let sid_out = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let json = match envelope.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(session_id = %sid_out, error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                tracing::debug!(session_id = %sid_out, "Client socket closed");
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            () = orchestrator.wait_ended() => {
                tracing::warn!(session_id = %session_id, "Upstream gone for good, closing client");
                break;
            }
        };
        let Some(frame) = frame else { break };
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Client socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                handle_client_text(&orchestrator, &session_id, text.as_str()).await;
            }
            Message::Binary(data) => {
                tracing::warn!(
                    session_id = %session_id,
                    bytes = data.len(),
                    "Dropping binary frame; envelopes are JSON text"
                );
            }
            Message::Close(frame) => {
                tracing::info!(session_id = %session_id, close_frame = ?frame, "Client closed");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Cleanup: dropping the orchestrator's sender lets the writer flush and
    // send Close.
    orchestrator.cleanup().await;
    state.registry.release(&session_id, &orchestrator);
    drop(orchestrator);
    let abort = send_task.abort_handle();
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, send_task).await.is_err() {
        tracing::debug!(session_id = %session_id, "Client writer did not flush in time");
        abort.abort();
    }

    tracing::info!(session_id = %session_id, "Voice session ended");
}

/// Dispatch one client text frame. Malformed input is logged and dropped.
async fn handle_client_text(orchestrator: &AgentOrchestrator, session_id: &str, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Dropping malformed envelope");
            return;
        }
    };

    match envelope {
        Envelope::AudioChunk { data, .. } => match decode_audio(&data) {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                orchestrator.handle_client_audio(&bytes).await;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Dropping undecodable audio");
            }
        },
        Envelope::Interrupt => orchestrator.interrupt().await,
        other => {
            tracing::warn!(
                session_id = %session_id,
                kind = other.kind(),
                "Dropping server-only envelope sent by client"
            );
        }
    }
}
