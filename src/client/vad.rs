//! Energy-based voice activity detection.
//!
//! State machine: Silence → Speech → Hangover → (hangover elapsed) → Silence.
//! Pure: the caller supplies the energy of each analysis frame and the time
//! it was taken, which keeps the timing properties testable.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadPhase {
    Silence,
    Speech,
    /// Speech went quiet; the utterance ends at `deadline` unless energy
    /// comes back first.
    Hangover { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    /// `speech` spans first to last above-threshold frame.
    SpeechEnded { speech: Duration },
}

#[derive(Debug, Clone)]
pub struct VadMonitor {
    threshold: f32,
    hangover: Duration,
    phase: VadPhase,
    speech_started_at: Option<Instant>,
    last_voiced_at: Option<Instant>,
}

impl VadMonitor {
    pub fn new(threshold: f32, hangover: Duration) -> Self {
        Self {
            threshold,
            hangover,
            phase: VadPhase::Silence,
            speech_started_at: None,
            last_voiced_at: None,
        }
    }

    pub fn phase(&self) -> VadPhase {
        self.phase
    }

    pub fn in_speech(&self) -> bool {
        !matches!(self.phase, VadPhase::Silence)
    }

    /// Feed one analysis frame.
    pub fn observe(&mut self, energy: f32, now: Instant) -> Option<VadTransition> {
        let voiced = energy > self.threshold;

        match self.phase {
            VadPhase::Silence => {
                if !voiced {
                    return None;
                }
                self.phase = VadPhase::Speech;
                self.speech_started_at = Some(now);
                self.last_voiced_at = Some(now);
                Some(VadTransition::SpeechStarted)
            }
            VadPhase::Speech => {
                if voiced {
                    self.last_voiced_at = Some(now);
                } else {
                    self.phase = VadPhase::Hangover {
                        deadline: now + self.hangover,
                    };
                }
                None
            }
            VadPhase::Hangover { deadline } => {
                if voiced {
                    // debounce: the pause was part of the same utterance
                    self.phase = VadPhase::Speech;
                    self.last_voiced_at = Some(now);
                    return None;
                }
                if now < deadline {
                    return None;
                }
                let speech = match (self.speech_started_at, self.last_voiced_at) {
                    (Some(start), Some(last)) => last.saturating_duration_since(start),
                    _ => Duration::ZERO,
                };
                self.reset();
                Some(VadTransition::SpeechEnded { speech })
            }
        }
    }

    /// Back to silence, dropping any pending hangover.
    pub fn reset(&mut self) {
        self.phase = VadPhase::Silence;
        self.speech_started_at = None;
        self.last_voiced_at = None;
    }
}

/// Root-mean-square energy of normalized samples; 0.0 for an empty frame.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
