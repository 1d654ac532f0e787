//! Ordered playback of synthesized speech.
//!
//! Chunks are played strictly one at a time in arrival order by a single
//! drain task. A chunk that fails to decode or play is logged and skipped.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::VoiceError;
use crate::voice::events::decode_audio;
use crate::voice::session::SAMPLE_RATE;

// ── Output seam ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Decode and play audio. `play` resolves when the chunk has finished.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, VoiceError>;

    async fn play(&self, audio: DecodedAudio) -> Result<(), VoiceError>;

    /// Cut off whatever is currently playing.
    fn stop(&self) {}
}

/// Interpret `bytes` as PCM16LE mono.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<DecodedAudio, VoiceError> {
    if bytes.is_empty() {
        return Err(VoiceError::DecodePlayback("empty audio chunk".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::DecodePlayback(format!(
            "odd PCM16 length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

// ── Queue ────────────────────────────────────────────────────────

#[derive(Debug)]
struct PlaybackItem {
    seq: u64,
    /// Base64 payload exactly as received.
    payload: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub played: u64,
    pub skipped: u64,
    pub cleared: u64,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<PlaybackItem>,
    draining: bool,
    next_seq: u64,
    /// Bumped by `clear()` so an in-flight chunk knows it was cut off.
    generation: u64,
    stats: PlaybackStats,
}

struct Inner {
    sink: Arc<dyn AudioSink>,
    state: Mutex<QueueState>,
    speaking: watch::Sender<bool>,
}

/// Clone-able handle; all clones share one queue.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Inner>,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sink,
                state: Mutex::new(QueueState::default()),
                speaking,
            }),
        }
    }

    /// Queue a base64 audio payload; returns its arrival sequence number.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, payload: impl Into<String>) -> u64 {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.items.push_back(PlaybackItem {
            seq,
            payload: payload.into(),
        });

        if !state.draining {
            state.draining = true;
            self.inner.speaking.send_replace(true);
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
        seq
    }

    /// Drop every queued chunk and stop the one playing. Returns how many
    /// queued chunks were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.generation += 1;
            state.stats.cleared += dropped as u64;
            dropped
        };
        self.inner.sink.stop();
        if dropped > 0 {
            tracing::debug!(dropped, "Playback queue cleared");
        }
        dropped
    }

    /// True while anything is queued or playing.
    pub fn is_speaking(&self) -> bool {
        *self.inner.speaking.borrow()
    }

    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.inner.speaking.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.inner.state.lock().stats
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let (item, generation) = {
            let mut state = inner.state.lock();
            match state.items.pop_front() {
                Some(item) => (item, state.generation),
                None => {
                    state.draining = false;
                    inner.speaking.send_replace(false);
                    return;
                }
            }
        };

        match play_item(&inner, &item).await {
            Ok(()) => {
                let mut state = inner.state.lock();
                if state.generation == generation {
                    state.stats.played += 1;
                }
            }
            Err(e) => {
                tracing::warn!(seq = item.seq, error = %e, "Skipping unplayable audio chunk");
                inner.state.lock().stats.skipped += 1;
            }
        }
    }
}

async fn play_item(inner: &Inner, item: &PlaybackItem) -> Result<(), VoiceError> {
    let bytes =
        decode_audio(&item.payload).map_err(|e| VoiceError::DecodePlayback(e.to_string()))?;
    let audio = inner.sink.decode(&bytes).await?;
    inner.sink.play(audio).await
}

// ── PCM16 sink ───────────────────────────────────────────────────

/// Sink that validates PCM16 and hands decoded chunks to a callback, for
/// wiring into whatever owns the output device.
pub struct Pcm16Sink<F> {
    sample_rate: u32,
    output: F,
}

impl<F> Pcm16Sink<F>
where
    F: Fn(DecodedAudio) + Send + Sync,
{
    pub fn new(output: F) -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            output,
        }
    }
}

#[async_trait]
impl<F> AudioSink for Pcm16Sink<F>
where
    F: Fn(DecodedAudio) + Send + Sync,
{
    async fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, VoiceError> {
        decode_pcm16(bytes, self.sample_rate)
    }

    async fn play(&self, audio: DecodedAudio) -> Result<(), VoiceError> {
        (self.output)(audio);
        Ok(())
    }
}
