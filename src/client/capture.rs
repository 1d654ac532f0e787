//! Microphone capture segmented into utterances.
//!
//! A monitor task samples the input every `monitor_interval_ms`, runs the
//! energy VAD, and when a silence hangover completes hands the recorded
//! segment over as one [`Utterance`]. Recording restarts immediately so
//! nothing said between utterances is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::vad::{rms_energy, VadMonitor, VadTransition};
use crate::config::CaptureConfig;
use crate::error::VoiceError;
use crate::voice::session::SAMPLE_RATE;

const EVENT_BUFFER: usize = 32;

/// Audio kept ahead of the first voiced frame while the VAD is idle.
const PREROLL: Duration = Duration::from_millis(300);

fn preroll_samples() -> usize {
    (u128::from(SAMPLE_RATE) * PREROLL.as_millis() / 1000) as usize
}

// ── Device seam ──────────────────────────────────────────────────

/// An audio input device.
pub trait AudioInput: Send + Sync {
    /// Acquire the device. Permission or hardware failures are
    /// [`VoiceError::CaptureUnavailable`].
    fn open(&self) -> Result<Box<dyn CaptureStream>, VoiceError>;
}

/// A live, acquired input.
pub trait CaptureStream: Send {
    /// Samples captured since the previous call, normalized to -1.0..=1.0.
    /// Everything returned here is also appended to the current segment.
    fn analysis_frame(&mut self) -> Vec<f32>;

    /// Start a fresh recording segment, discarding any previous one.
    fn begin_segment(&mut self);

    /// Drop all but the newest `samples` samples of the current segment.
    /// Called on every idle tick so silence never accumulates.
    fn retain_recent(&mut self, samples: usize);

    /// Finish the current segment and return it as PCM16LE bytes.
    fn finish_segment(&mut self) -> Vec<u8>;

    /// Release the device.
    fn close(&mut self) {}
}

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Monotonic across the lifetime of the capture client.
    pub seq: u64,
    /// PCM16LE mono.
    pub audio: Vec<u8>,
    pub speech: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    SpeechStart,
    SpeechEnd(Utterance),
    /// Speech too short to be an utterance; its segment was dropped.
    SpeechDiscarded { speech: Duration },
}

// ── Client ───────────────────────────────────────────────────────

struct RunningCapture {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct AudioCaptureClient {
    config: CaptureConfig,
    input: Arc<dyn AudioInput>,
    running: Option<RunningCapture>,
    next_seq: Arc<AtomicU64>,
}

impl AudioCaptureClient {
    pub fn new(config: CaptureConfig, input: Arc<dyn AudioInput>) -> Self {
        Self {
            config,
            input,
            running: None,
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Replace the config; takes effect on the next `start()`.
    pub fn set_config(&mut self, config: CaptureConfig) {
        self.config = config;
    }

    pub fn is_listening(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Acquire the device and start monitoring.
    pub fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, VoiceError> {
        if self.is_listening() {
            return Err(VoiceError::CaptureUnavailable(
                "capture already running".into(),
            ));
        }

        let mut stream = self.input.open()?;
        stream.begin_segment();

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(monitor_loop(
            stream,
            self.config.clone(),
            event_tx,
            stop_rx,
            Arc::clone(&self.next_seq),
        ));
        self.running = Some(RunningCapture { stop_tx, task });

        tracing::info!(
            threshold = self.config.silence_threshold,
            hangover_ms = self.config.silence_timeout_ms,
            interval_ms = self.config.monitor_interval_ms,
            "Capture started"
        );
        Ok(event_rx)
    }

    /// Stop monitoring and release the device. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.stop_tx.send(());
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "Capture task ended abnormally");
        }
        tracing::info!("Capture stopped");
    }
}

async fn monitor_loop(
    mut stream: Box<dyn CaptureStream>,
    config: CaptureConfig,
    events: mpsc::Sender<CaptureEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    next_seq: Arc<AtomicU64>,
) {
    let mut vad = VadMonitor::new(
        config.silence_threshold,
        Duration::from_millis(config.silence_timeout_ms),
    );
    let min_speech = Duration::from_millis(config.min_speech_duration_ms);
    let preroll = preroll_samples();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.monitor_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let energy = rms_energy(&stream.analysis_frame());
                let now = tokio::time::Instant::now().into_std();

                let transition = vad.observe(energy, now);
                if !vad.in_speech() && transition.is_none() {
                    stream.retain_recent(preroll);
                }

                let event = match transition {
                    None => continue,
                    Some(VadTransition::SpeechStarted) => {
                        tracing::debug!(energy, "Speech started");
                        CaptureEvent::SpeechStart
                    }
                    Some(VadTransition::SpeechEnded { speech }) => {
                        let audio = stream.finish_segment();
                        stream.begin_segment();
                        if speech < min_speech {
                            tracing::debug!(
                                speech_ms = speech.as_millis() as u64,
                                "Discarding short noise burst"
                            );
                            CaptureEvent::SpeechDiscarded { speech }
                        } else {
                            let seq = next_seq.fetch_add(1, Ordering::SeqCst);
                            tracing::debug!(
                                seq,
                                bytes = audio.len(),
                                speech_ms = speech.as_millis() as u64,
                                "Utterance finalized"
                            );
                            CaptureEvent::SpeechEnd(Utterance { seq, audio, speech })
                        }
                    }
                };

                if let CaptureEvent::SpeechEnd(_) = event {
                    // utterances are never shed; wait for room or a stop
                    tokio::select! {
                        sent = events.send(event) => {
                            if sent.is_err() {
                                tracing::debug!("Capture consumer gone, stopping monitor");
                                break;
                            }
                        }
                        _ = &mut stop_rx => break,
                    }
                    continue;
                }

                // markers may be shed so a slow consumer never stalls the monitor
                match events.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(dropped)) => {
                        tracing::warn!(event = ?dropped, "Capture consumer lagging, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::debug!("Capture consumer gone, stopping monitor");
                        break;
                    }
                }
            }
        }
    }

    vad.reset();
    stream.close();
}

// ── Channel-fed input ────────────────────────────────────────────

/// Sender half of a [`ChannelInput`]: push PCM16 frames from whatever owns
/// the hardware (an audio callback thread, a file reader, a test).
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Vec<i16>>,
}

impl FrameSender {
    /// Returns false once the capture stream has been closed.
    pub fn push(&self, frame: Vec<i16>) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// An [`AudioInput`] fed through a channel. Opens once; a second open while
/// the first stream lives reports the device as busy.
pub struct ChannelInput {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<i16>>>>,
}

impl ChannelInput {
    pub fn new() -> (Self, FrameSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            FrameSender { tx },
        )
    }
}

impl AudioInput for ChannelInput {
    fn open(&self) -> Result<Box<dyn CaptureStream>, VoiceError> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| VoiceError::CaptureUnavailable("input device busy or closed".into()))?;
        Ok(Box::new(ChannelStream {
            rx,
            segment: Vec::new(),
        }))
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Vec<i16>>,
    segment: Vec<i16>,
}

impl CaptureStream for ChannelStream {
    fn analysis_frame(&mut self) -> Vec<f32> {
        let mut frame = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            frame.extend(chunk.iter().map(|&s| f32::from(s) / 32_768.0));
            self.segment.extend_from_slice(&chunk);
        }
        frame
    }

    fn begin_segment(&mut self) {
        self.segment.clear();
    }

    fn retain_recent(&mut self, samples: usize) {
        if self.segment.len() > samples {
            let excess = self.segment.len() - samples;
            self.segment.drain(..excess);
        }
    }

    fn finish_segment(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.segment)
            .into_iter()
            .flat_map(i16::to_le_bytes)
            .collect()
    }

    fn close(&mut self) {
        self.rx.close();
        self.segment.clear();
    }
}
