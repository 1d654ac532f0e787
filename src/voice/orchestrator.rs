//! Per-session turn-taking orchestrator.
//!
//! Owns one upstream connection, one conversation state and the outbound
//! side of the client transport. Client audio is relayed straight through;
//! upstream events drive the state tracker and are turned into envelopes
//! for the client.
//!
//! A lost or refused upstream is reconnected in the background with the
//! session's backoff policy. Once that budget is spent the client gets a
//! `session_ended` error and [`AgentOrchestrator::wait_ended`] resolves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{audio_envelopes, Envelope};
use super::session::SessionConfig;
use super::state::{ConversationEvent, ConversationState, ConversationStateTracker};
use super::upstream::{UpstreamConnector, UpstreamHandle};
use super::VoiceEvent;
use crate::error::VoiceError;

/// What happened to one chunk of client audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded,
    /// Upstream not ready, gone, or refusing audio; the chunk is lost.
    Dropped,
}

struct TurnState {
    tracker: ConversationStateTracker,
    /// Audio of a cancelled or failed response is swallowed until the next
    /// `response.created`.
    suppress_output: bool,
    /// Next `seq` for outbound audio.
    out_seq: u64,
    /// When the current turn entered processing.
    awaiting_since: Option<Instant>,
}

pub struct AgentOrchestrator {
    session_id: String,
    config: SessionConfig,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<Envelope>>>,
    upstream: parking_lot::RwLock<Option<Arc<dyn UpstreamHandle>>>,
    // held across outbound sends so envelopes leave in decision order
    turn: Mutex<TurnState>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    ready: watch::Sender<bool>,
    ended: watch::Sender<bool>,
    closed: AtomicBool,
    relayed: AtomicU64,
}

impl AgentOrchestrator {
    /// Create an orchestrator without touching the upstream yet.
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            session_id: session_id.into(),
            config,
            outbound: parking_lot::Mutex::new(Some(outbound)),
            upstream: parking_lot::RwLock::new(None),
            turn: Mutex::new(TurnState {
                tracker: ConversationStateTracker::new(),
                suppress_output: false,
                out_seq: 0,
                awaiting_since: None,
            }),
            task: parking_lot::Mutex::new(None),
            ready,
            ended,
            closed: AtomicBool::new(false),
            relayed: AtomicU64::new(0),
        })
    }

    /// Connect the upstream in the background and pump its events. Returns
    /// immediately; client audio arriving before the upstream is ready is
    /// dropped.
    pub fn start(self: &Arc<Self>, connector: Arc<dyn UpstreamConnector>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(connector).await });

        let mut slot = self.task.lock();
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
        } else if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.upstream.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the upstream is connected, or with `false` if the
    /// session closes first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            if self.is_closed() || rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Resolves once the upstream can no longer be reconnected. The caller
    /// is expected to close the client transport.
    pub async fn wait_ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub async fn state(&self) -> ConversationState {
        self.turn.lock().await.tracker.state().clone()
    }

    // ── Client-facing operations ─────────────────────────────────

    /// Relay one chunk of client audio. Never buffers, reorders or waits for
    /// an upstream response.
    pub async fn handle_client_audio(&self, bytes: &[u8]) -> RelayOutcome {
        if self.is_closed() {
            return RelayOutcome::Dropped;
        }
        let upstream = self.upstream.read().clone();
        let Some(upstream) = upstream else {
            let err = VoiceError::Relay("upstream not ready".into());
            tracing::warn!(
                session_id = %self.session_id,
                bytes = bytes.len(),
                error = %err,
                "Dropping client audio"
            );
            return RelayOutcome::Dropped;
        };

        match upstream.send_audio(bytes).await {
            Ok(()) => {
                let n = self.relayed.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n.is_multiple_of(50) {
                    tracing::debug!(
                        session_id = %self.session_id,
                        chunk = n,
                        bytes = bytes.len(),
                        "Relayed client audio"
                    );
                }
                RelayOutcome::Forwarded
            }
            Err(e) => {
                let err = VoiceError::Relay(e.to_string());
                tracing::warn!(
                    session_id = %self.session_id,
                    bytes = bytes.len(),
                    error = %err,
                    "Dropping client audio"
                );
                RelayOutcome::Dropped
            }
        }
    }

    /// Client-side barge-in. Ignored unless a response is in flight.
    pub async fn interrupt(&self) {
        let mut turn = self.turn.lock().await;
        if turn.tracker.state().is_responding {
            self.barge_in(&mut turn, "client").await;
        } else {
            tracing::debug!(
                session_id = %self.session_id,
                state = %turn.tracker.label(),
                "Interrupt ignored: no response in flight"
            );
        }
    }

    /// Tear down the upstream and background task. Only the first call does
    /// anything; returns whether this call did the teardown.
    pub async fn cleanup(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let upstream = self.upstream.write().take();
        if let Some(upstream) = upstream {
            upstream.close().await;
        }
        self.ready.send_replace(false);
        // closes the client writer once queued envelopes are flushed
        self.outbound.lock().take();
        tracing::info!(session_id = %self.session_id, "Orchestrator cleaned up");
        true
    }

    // ── Upstream side ────────────────────────────────────────────

    async fn run(self: Arc<Self>, connector: Arc<dyn UpstreamConnector>) {
        let policy = &self.config.reconnect;
        // consecutive attempts that produced no usable upstream
        let mut failures: u32 = 0;

        loop {
            if failures > 0 {
                let delay = policy.delay_for_retry(failures);
                tracing::info!(
                    session_id = %self.session_id,
                    attempt = failures + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting upstream"
                );
                tokio::time::sleep(delay).await;
            }
            if self.is_closed() {
                return;
            }

            tracing::info!(
                session_id = %self.session_id,
                upstream = connector.name(),
                model = %self.config.model,
                "Connecting upstream"
            );
            match connector.connect(&self.session_id, &self.config).await {
                Ok(link) => {
                    if self.is_closed() {
                        link.handle.close().await;
                        return;
                    }
                    *self.upstream.write() = Some(Arc::clone(&link.handle));
                    self.ready.send_replace(true);
                    tracing::info!(session_id = %self.session_id, "Upstream ready");

                    let handled = self.pump(link.events).await;
                    if self.is_closed() {
                        return;
                    }
                    self.upstream.write().take();
                    self.ready.send_replace(false);
                    link.handle.close().await;

                    if handled > 0 {
                        failures = 0;
                    }
                    failures += 1;
                    tracing::warn!(
                        session_id = %self.session_id,
                        handled,
                        "Upstream stream ended unexpectedly"
                    );
                    self.fail_turn("upstream_closed", "upstream connection closed")
                        .await;
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        session_id = %self.session_id,
                        attempt = failures,
                        error = %e,
                        "Upstream connection failed"
                    );
                    // one fallback per outage, not per attempt
                    if failures == 1 {
                        self.fail_turn("upstream_unavailable", &format!("{e}")).await;
                    }
                }
            }

            if failures > policy.max_retries {
                tracing::error!(
                    session_id = %self.session_id,
                    attempts = failures,
                    "Upstream reconnect budget spent, ending session"
                );
                self.send(Envelope::error(
                    "session_ended",
                    "voice service unavailable, please reconnect",
                ))
                .await;
                self.ended.send_replace(true);
                return;
            }
        }
    }

    /// Feed upstream events into the session until the stream ends. Returns
    /// how many events were handled.
    async fn pump(&self, mut events: mpsc::Receiver<VoiceEvent>) -> u64 {
        let mut handled = 0;
        loop {
            let deadline = self.turn_deadline().await;
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(session_id = %self.session_id, "Upstream turn timed out");
                        self.fail_turn("turn_timeout", "upstream took too long to respond")
                            .await;
                        continue;
                    }
                },
                None => events.recv().await,
            };

            let Some(event) = next else { break };
            handled += 1;
            self.handle_upstream_event(event).await;
        }
        handled
    }

    async fn turn_deadline(&self) -> Option<Instant> {
        let timeout = self.config.turn_timeout?;
        let turn = self.turn.lock().await;
        turn.awaiting_since.map(|since| since + timeout)
    }

    async fn handle_upstream_event(&self, event: VoiceEvent) {
        match event {
            VoiceEvent::SetupComplete => {
                tracing::debug!(session_id = %self.session_id, "Upstream setup complete");
            }
            VoiceEvent::SpeechStarted => {
                let mut turn = self.turn.lock().await;
                if turn.tracker.state().is_responding {
                    self.barge_in(&mut turn, "upstream").await;
                }
                self.apply(&mut turn, ConversationEvent::SpeechStarted).await;
            }
            VoiceEvent::SpeechStopped => {
                let mut turn = self.turn.lock().await;
                self.apply(&mut turn, ConversationEvent::SpeechStopped).await;
            }
            VoiceEvent::ResponseCreated { .. } => {
                let mut turn = self.turn.lock().await;
                turn.suppress_output = false;
                self.apply(&mut turn, ConversationEvent::ResponseCreated).await;
            }
            VoiceEvent::Audio { data } => {
                let mut turn = self.turn.lock().await;
                if turn.suppress_output {
                    tracing::debug!(
                        session_id = %self.session_id,
                        bytes = data.len(),
                        "Dropping audio of cancelled response"
                    );
                    return;
                }
                self.apply(&mut turn, ConversationEvent::ResponseAudio).await;
                for envelope in audio_envelopes(&data, &mut turn.out_seq) {
                    self.send(envelope).await;
                }
            }
            VoiceEvent::ResponseDone => {
                let mut turn = self.turn.lock().await;
                self.apply(&mut turn, ConversationEvent::ResponseDone).await;
            }
            VoiceEvent::ResponseCancelled => {
                let mut turn = self.turn.lock().await;
                self.apply(&mut turn, ConversationEvent::ResponseCancelled)
                    .await;
            }
            VoiceEvent::InputTranscript { text } => {
                tracing::debug!(session_id = %self.session_id, text = %text, "User said");
            }
            VoiceEvent::OutputTranscript { text } => {
                tracing::trace!(session_id = %self.session_id, text = %text, "Agent transcript");
            }
            VoiceEvent::Error { message } => {
                self.fail_turn("upstream_error", &message).await;
            }
        }
    }

    // ── Turn helpers (caller holds the turn lock) ────────────────

    async fn apply(&self, turn: &mut TurnState, event: ConversationEvent) {
        let Some(transition) = turn.tracker.apply(event) else {
            return;
        };
        turn.awaiting_since = if transition.to.is_awaiting_response() {
            turn.awaiting_since.or_else(|| Some(Instant::now()))
        } else {
            None
        };
        tracing::info!(
            session_id = %self.session_id,
            from = %transition.from,
            to = %transition.to,
            event = event.as_str(),
            turn_count = transition.state.turn_count,
            "Conversation state changed"
        );
        self.send(Envelope::state_changed(&transition)).await;
    }

    async fn barge_in(&self, turn: &mut TurnState, source: &str) {
        tracing::info!(
            session_id = %self.session_id,
            source,
            state = %turn.tracker.label(),
            "Barge-in: cancelling response"
        );
        turn.suppress_output = true;
        let upstream = self.upstream.read().clone();
        if let Some(upstream) = upstream {
            if let Err(e) = upstream.cancel_response().await {
                tracing::warn!(session_id = %self.session_id, error = %e, "Cancel request failed");
            }
        }
        self.send(Envelope::Interrupted).await;
        self.apply(turn, ConversationEvent::ResponseCancelled).await;
    }

    async fn fail_turn(&self, code: &str, reason: &str) {
        let err = VoiceError::Turn(format!("{code}: {reason}"));
        tracing::error!(
            session_id = %self.session_id,
            code,
            error = %err,
            "Turn failed, playing fallback audio"
        );
        let mut turn = self.turn.lock().await;
        turn.suppress_output = true;
        self.apply(&mut turn, ConversationEvent::TurnFailed).await;
        turn.awaiting_since = None;

        self.send(Envelope::error(code, reason)).await;
        match &self.config.fallback {
            Some(fallback) => {
                for envelope in fallback.envelopes(&mut turn.out_seq) {
                    self.send(envelope).await;
                }
            }
            None => {
                tracing::warn!(session_id = %self.session_id, "No fallback audio configured");
            }
        }
    }

    async fn send(&self, envelope: Envelope) {
        let kind = envelope.kind();
        let outbound = self.outbound.lock().clone();
        let Some(outbound) = outbound else {
            tracing::debug!(session_id = %self.session_id, kind, "Session closed, dropping envelope");
            return;
        };
        if outbound.send(envelope).await.is_err() {
            tracing::debug!(
                session_id = %self.session_id,
                kind,
                "Transport gone, dropping envelope"
            );
        }
    }
}

impl std::fmt::Debug for AgentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOrchestrator")
            .field("session_id", &self.session_id)
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
