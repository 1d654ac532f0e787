//! Pre-recorded error audio played when a turn fails.
//!
//! The clip is raw PCM16LE at the session sample rate, loaded once at
//! startup and shared by every session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use super::events::{audio_envelopes, Envelope};

pub struct FallbackAudio {
    bytes: Arc<[u8]>,
    source: PathBuf,
}

impl FallbackAudio {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read fallback audio {}", path.display()))?;
        if bytes.is_empty() {
            anyhow::bail!("Fallback audio {} is empty", path.display());
        }
        Ok(Self {
            bytes: bytes.into(),
            source: path.to_path_buf(),
        })
    }

    /// Load if configured; a missing or unreadable clip only disables the
    /// fallback.
    pub async fn load_optional(path: Option<&Path>) -> Option<Arc<Self>> {
        let path = path?;
        match Self::load(path).await {
            Ok(audio) => {
                tracing::info!(
                    path = %path.display(),
                    bytes = audio.len(),
                    "Loaded fallback error audio"
                );
                Some(Arc::new(audio))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fallback error audio disabled");
                None
            }
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            source: PathBuf::from("<memory>"),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The clip as `audio_chunk` envelopes continuing `seq`.
    pub fn envelopes(&self, seq: &mut u64) -> Vec<Envelope> {
        audio_envelopes(&self.bytes, seq)
    }
}

impl std::fmt::Debug for FallbackAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackAudio")
            .field("source", &self.source)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}
