//! In-process upstream driven by the caller.
//!
//! Compiled for unit tests and behind the `scripted` feature for the
//! integration tests. Every connected session exposes a [`ScriptedSession`]
//! through which events are pushed and received audio is inspected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::session::SessionConfig;
use super::upstream::{UpstreamConnector, UpstreamHandle, UpstreamLink};
use super::VoiceEvent;

#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<HashMap<String, ScriptedSession>>,
    gate: Option<Arc<Notify>>,
    fail_connect: bool,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections block until `gate` is notified.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Every connection attempt fails.
    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    /// Connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn session(&self, session_id: &str) -> Option<ScriptedSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Poll until `session_id` has connected.
    pub async fn wait_for_session(&self, session_id: &str) -> ScriptedSession {
        loop {
            if let Some(session) = self.session(session_id) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(
        &self,
        session_id: &str,
        _config: &SessionConfig,
    ) -> anyhow::Result<UpstreamLink> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            anyhow::bail!("scripted upstream refused connection");
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let session = ScriptedSession {
            events: Arc::new(Mutex::new(Some(event_tx))),
            received: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.sessions
            .lock()
            .insert(session_id.to_string(), session.clone());

        Ok(UpstreamLink {
            handle: Arc::new(ScriptedHandle {
                received: Arc::clone(&session.received),
                cancels: Arc::clone(&session.cancels),
                closed: Arc::clone(&session.closed),
            }),
            events: event_rx,
        })
    }
}

/// Caller-side view of one scripted upstream session.
#[derive(Clone)]
pub struct ScriptedSession {
    events: Arc<Mutex<Option<mpsc::Sender<VoiceEvent>>>>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    cancels: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ScriptedSession {
    /// Push one upstream event. Returns false once the session hung up or
    /// the orchestrator stopped listening.
    pub async fn emit(&self, event: VoiceEvent) -> bool {
        let sender = self.events.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drop the event stream, as an upstream that vanished mid-session.
    pub fn hang_up(&self) {
        self.events.lock().take();
    }

    pub fn received_audio(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedHandle {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    cancels: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl UpstreamHandle for ScriptedHandle {
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("scripted upstream closed");
        }
        self.received.lock().push(pcm.to_vec());
        Ok(())
    }

    async fn cancel_response(&self) -> anyhow::Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_audio_and_delivers_events() {
        let connector = ScriptedConnector::new();
        let mut link = connector
            .connect("s1", &SessionConfig::default())
            .await
            .unwrap();
        let session = connector.session("s1").unwrap();

        link.handle.send_audio(&[1, 2]).await.unwrap();
        link.handle.cancel_response().await.unwrap();
        assert_eq!(session.received_audio(), vec![vec![1, 2]]);
        assert_eq!(session.cancel_count(), 1);

        assert!(session.emit(VoiceEvent::SpeechStarted).await);
        assert_eq!(link.events.recv().await, Some(VoiceEvent::SpeechStarted));

        session.hang_up();
        assert_eq!(link.events.recv().await, None);

        link.handle.close().await;
        assert!(session.is_closed());
        assert!(link.handle.send_audio(&[3]).await.is_err());
    }

    #[tokio::test]
    async fn failing_connector_refuses() {
        let connector = ScriptedConnector::failing();
        assert!(connector
            .connect("s1", &SessionConfig::default())
            .await
            .is_err());
        assert!(connector.session("s1").is_none());
        assert_eq!(connector.connect_count(), 1);
    }
}
