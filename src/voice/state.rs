//! Conversation-state projection.
//!
//! The upstream emits a noisy stream of lifecycle events. The tracker
//! collapses it into six coarse labels and notifies observers only when the
//! label actually changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Labels ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationLabel {
    Idle,
    Listening,
    Processing,
    Thinking,
    Speaking,
    Waiting,
}

impl ConversationLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Waiting => "waiting",
        }
    }

    /// Who holds the floor while in this label.
    pub fn speaker(self) -> Speaker {
        match self {
            Self::Listening => Speaker::User,
            Self::Thinking | Self::Speaking => Speaker::Agent,
            Self::Idle | Self::Processing | Self::Waiting => Speaker::None,
        }
    }

    /// A response is in flight (barge-in applies).
    pub fn is_responding(self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking)
    }

    /// The user has finished and the agent has not produced audio yet.
    pub fn is_awaiting_response(self) -> bool {
        matches!(self, Self::Processing | Self::Thinking)
    }
}

impl std::fmt::Display for ConversationLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
    None,
}

/// Lifecycle events the orchestrator feeds into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEvent {
    SpeechStarted,
    SpeechStopped,
    ResponseCreated,
    ResponseAudio,
    ResponseDone,
    ResponseCancelled,
    TurnFailed,
}

impl ConversationEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpeechStarted => "speech-started",
            Self::SpeechStopped => "speech-stopped",
            Self::ResponseCreated => "response-created",
            Self::ResponseAudio => "response-audio",
            Self::ResponseDone => "response-done",
            Self::ResponseCancelled => "response-cancelled",
            Self::TurnFailed => "turn-failed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "speech-started" => Some(Self::SpeechStarted),
            "speech-stopped" => Some(Self::SpeechStopped),
            "response-created" => Some(Self::ResponseCreated),
            "response-audio" => Some(Self::ResponseAudio),
            "response-done" => Some(Self::ResponseDone),
            "response-cancelled" => Some(Self::ResponseCancelled),
            "turn-failed" => Some(Self::TurnFailed),
            _ => None,
        }
    }
}

// ── Transition function ──────────────────────────────────────────

/// Next label for `(current, event)`, or `None` when the pair does not move
/// the machine.
pub fn next_label(
    current: ConversationLabel,
    event: ConversationEvent,
) -> Option<ConversationLabel> {
    use ConversationEvent as E;
    use ConversationLabel as L;

    match (current, event) {
        (L::Idle | L::Waiting, E::SpeechStarted) => Some(L::Listening),
        (L::Listening, E::SpeechStopped) => Some(L::Processing),
        (L::Processing, E::ResponseCreated) => Some(L::Thinking),
        (L::Thinking, E::ResponseAudio) => Some(L::Speaking),
        (L::Thinking | L::Speaking, E::ResponseDone) => Some(L::Waiting),
        (L::Processing | L::Thinking | L::Speaking, E::ResponseCancelled) => Some(L::Waiting),
        (L::Listening | L::Processing | L::Thinking | L::Speaking, E::TurnFailed) => {
            Some(L::Waiting)
        }
        _ => None,
    }
}

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationState {
    pub label: ConversationLabel,
    pub current_speaker: Speaker,
    pub is_responding: bool,
    pub turn_count: u64,
    pub last_event_time: DateTime<Utc>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            label: ConversationLabel::Idle,
            current_speaker: Speaker::None,
            is_responding: false,
            turn_count: 0,
            last_event_time: now,
        }
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one event to a state snapshot. Pure: no clock, no observers.
pub fn project(
    state: &ConversationState,
    event: ConversationEvent,
    at: DateTime<Utc>,
) -> ConversationState {
    let mut next = state.clone();
    next.last_event_time = at;
    if let Some(label) = next_label(state.label, event) {
        if event == ConversationEvent::ResponseDone {
            next.turn_count += 1;
        }
        next.label = label;
        next.current_speaker = label.speaker();
        next.is_responding = label.is_responding();
    }
    next
}

/// A label change, as delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub from: ConversationLabel,
    pub to: ConversationLabel,
    pub event: ConversationEvent,
    pub state: ConversationState,
}

type Observer = Box<dyn Fn(&StateTransition) + Send + Sync>;

// ── Tracker ──────────────────────────────────────────────────────

pub struct ConversationStateTracker {
    state: ConversationState,
    observers: Vec<Observer>,
}

impl ConversationStateTracker {
    pub fn new() -> Self {
        Self {
            state: ConversationState::new(),
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn label(&self) -> ConversationLabel {
        self.state.label
    }

    /// Register an observer, called once per label change.
    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn apply(&mut self, event: ConversationEvent) -> Option<StateTransition> {
        self.apply_at(event, Utc::now())
    }

    /// Feed one event. Returns the transition when the label changed.
    pub fn apply_at(
        &mut self,
        event: ConversationEvent,
        at: DateTime<Utc>,
    ) -> Option<StateTransition> {
        let from = self.state.label;
        self.state = project(&self.state, event, at);
        if self.state.label == from {
            return None;
        }

        let transition = StateTransition {
            from,
            to: self.state.label,
            event,
            state: self.state.clone(),
        };
        for observer in &self.observers {
            observer(&transition);
        }
        Some(transition)
    }
}

impl Default for ConversationStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConversationStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStateTracker")
            .field("state", &self.state)
            .field("observers", &self.observers.len())
            .finish()
    }
}
