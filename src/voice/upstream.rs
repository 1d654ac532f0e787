//! Seam between the orchestrator and the conversational inference service.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::session::SessionConfig;
use super::VoiceEvent;

/// A live upstream session: a control handle plus its event stream.
///
/// The stream ending means the upstream connection is gone.
pub struct UpstreamLink {
    pub handle: Arc<dyn UpstreamHandle>,
    pub events: mpsc::Receiver<VoiceEvent>,
}

#[async_trait]
pub trait UpstreamHandle: Send + Sync {
    /// Append raw audio to the upstream input buffer. Must not wait for any
    /// response.
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Cancel the response currently being generated.
    async fn cancel_response(&self) -> anyhow::Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, session_id: &str, config: &SessionConfig)
        -> anyhow::Result<UpstreamLink>;
}
