//! Turn-taking state machine for one conversational turn.
//!
//! `TurnMachine` is pure: it consumes one `TurnEvent` at a time and returns the
//! `Effect`s the orchestrator must run against the providers. All provider events
//! are stamped with the `TurnId` they belong to; anything stamped with an older
//! id is dropped, so a reply from before a reset can never land in the new
//! conversation.

use crate::conversation::{ConversationState, DisplayEntry, Turn};
use crate::error::ErrorKind;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const STATUS_READY: &str = "Press Enter to start listening";
pub const STATUS_LISTENING: &str = "Listening... (Enter to stop)";
pub const STATUS_THINKING: &str = "Thinking...";
pub const STATUS_LOADING_SPEECH: &str = "Loading speech...";
pub const STATUS_SPEAKING: &str = "Speaking...";
pub const STATUS_NO_REPLY: &str = "No reply. Press Enter to try again.";
pub const STATUS_ERROR: &str = "Error. Press Enter to try again.";

/// Identifies one listening session and everything it triggers downstream.
pub type TurnId = u64;

/// Where the controller is in the turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
        }
    }
}

/// Why a capture session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The controller asked the provider to stop (user toggle).
    UserStop,
    /// The provider ended on its own (silence timeout, device closed, ...).
    ProviderStop,
}

/// Which subsystem produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capture,
    Generation,
    Synthesis,
}

/// A user-visible failure that ends the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl TurnFailure {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { stage, kind, message: message.into() }
    }
}

/// Events processed by the machine, one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TogglePressed,
    NewConversation,
    CaptureStarted,
    CaptureInterim(String),
    CaptureFinal(String),
    CaptureEnded(EndReason),
    GenerationChunk(String),
    GenerationDone(String),
    SynthesisStarted,
    SynthesisEnded,
    ErrorOccurred(TurnFailure),
}

/// Where an event came from. User actions are never stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Turn(TurnId),
}

/// Work the orchestrator must start or stop in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartCapture { turn: TurnId },
    StopCapture,
    Generate { turn: TurnId, messages: Vec<Turn> },
    Speak { turn: TurnId, text: String },
    CancelSpeech,
}

/// Observable projection of the machine, published after every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub state: TurnState,
    /// Character expression; mirrors the state.
    pub expression: TurnState,
    pub status: String,
    pub error: Option<String>,
    pub interim: String,
    pub messages: Vec<DisplayEntry>,
    pub playing_audio: bool,
    /// Bumped by every reset, so a renderer can tell a fresh conversation from a shorter one.
    pub conversation: u64,
}

/// The turn controller's state machine.
pub struct TurnMachine {
    state: TurnState,
    turn: TurnId,
    capture_supported: bool,
    transcript: String,
    interim: String,
    status: String,
    error: Option<String>,
    playing_audio: bool,
    conversation: u64,
    history: ConversationState,
}

impl TurnMachine {
    pub fn new(system_prompt: impl Into<String>, capture_supported: bool) -> Self {
        Self {
            state: TurnState::Idle,
            turn: 0,
            capture_supported,
            transcript: String::new(),
            interim: String::new(),
            status: STATUS_READY.to_string(),
            error: None,
            playing_audio: false,
            conversation: 0,
            history: ConversationState::new(system_prompt),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn current_turn(&self) -> TurnId {
        self.turn
    }

    pub fn history(&self) -> &ConversationState {
        &self.history
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            expression: self.state,
            status: self.status.clone(),
            error: self.error.clone(),
            interim: self.interim.clone(),
            messages: self.history.display().entries(),
            playing_audio: self.playing_audio,
            conversation: self.conversation,
        }
    }

    /// Process one event and return the effects to run.
    pub fn handle(&mut self, origin: Origin, event: TurnEvent) -> Vec<Effect> {
        if let Origin::Turn(id) = origin {
            if id != self.turn {
                debug!("Dropping stale {:?} from turn {} (current {})", event, id, self.turn);
                return Vec::new();
            }
        }

        match event {
            TurnEvent::TogglePressed => self.on_toggle(),
            TurnEvent::NewConversation => self.on_new_conversation(),
            TurnEvent::CaptureStarted => {
                if self.state == TurnState::Listening {
                    self.status = STATUS_LISTENING.to_string();
                }
                Vec::new()
            }
            TurnEvent::CaptureInterim(text) => {
                if self.state == TurnState::Listening {
                    self.interim = text;
                }
                Vec::new()
            }
            TurnEvent::CaptureFinal(text) => {
                if self.state == TurnState::Listening {
                    let text = text.trim();
                    if !text.is_empty() {
                        if !self.transcript.is_empty() {
                            self.transcript.push(' ');
                        }
                        self.transcript.push_str(text);
                    }
                    self.interim.clear();
                }
                Vec::new()
            }
            TurnEvent::CaptureEnded(reason) => self.on_capture_ended(reason),
            TurnEvent::GenerationChunk(delta) => {
                if self.state == TurnState::Thinking {
                    self.history.stream_reply(&delta);
                }
                Vec::new()
            }
            TurnEvent::GenerationDone(reply) => self.on_generation_done(reply),
            TurnEvent::SynthesisStarted => {
                if self.state == TurnState::Speaking {
                    self.playing_audio = true;
                    self.status = STATUS_SPEAKING.to_string();
                }
                Vec::new()
            }
            TurnEvent::SynthesisEnded => {
                if self.state == TurnState::Speaking {
                    self.playing_audio = false;
                    self.go_idle(STATUS_READY);
                }
                Vec::new()
            }
            TurnEvent::ErrorOccurred(failure) => self.on_failure(failure),
        }
    }

    fn on_toggle(&mut self) -> Vec<Effect> {
        match self.state {
            TurnState::Idle => {
                if !self.capture_supported {
                    self.error = Some("Speech recognition not supported on this device.".to_string());
                    return Vec::new();
                }
                self.turn += 1;
                self.transcript.clear();
                self.interim.clear();
                self.error = None;
                self.state = TurnState::Listening;
                self.status = STATUS_LISTENING.to_string();
                info!("🎤 Turn {}: listening", self.turn);
                vec![Effect::StartCapture { turn: self.turn }]
            }
            TurnState::Listening => {
                // Stop is idempotent; the decision waits for CaptureEnded.
                self.interim.clear();
                vec![Effect::StopCapture]
            }
            TurnState::Thinking | TurnState::Speaking => {
                debug!("Toggle ignored while {}", self.state.as_str());
                Vec::new()
            }
        }
    }

    fn on_capture_ended(&mut self, reason: EndReason) -> Vec<Effect> {
        if self.state != TurnState::Listening {
            return Vec::new();
        }
        self.interim.clear();

        let transcript = std::mem::take(&mut self.transcript);
        let transcript = transcript.trim();
        if reason != EndReason::UserStop || transcript.is_empty() {
            debug!("Capture ended ({:?}) without a usable transcript", reason);
            self.go_idle(STATUS_READY);
            return Vec::new();
        }

        info!("👤 User: {}", transcript);
        self.history.commit_user(transcript);
        self.history.begin_reply();
        self.state = TurnState::Thinking;
        self.status = STATUS_THINKING.to_string();
        self.error = None;

        vec![Effect::Generate {
            turn: self.turn,
            messages: self.history.conversation().turns().to_vec(),
        }]
    }

    fn on_generation_done(&mut self, reply: String) -> Vec<Effect> {
        if self.state != TurnState::Thinking {
            return Vec::new();
        }
        let reply = reply.trim();
        if reply.is_empty() {
            self.history.discard_reply();
            self.go_idle(STATUS_NO_REPLY);
            return Vec::new();
        }

        info!("🤖 Assistant: {}", reply);
        self.history.commit_reply(reply);
        self.state = TurnState::Speaking;
        self.status = STATUS_LOADING_SPEECH.to_string();

        vec![Effect::Speak {
            turn: self.turn,
            text: reply.to_string(),
        }]
    }

    fn on_failure(&mut self, failure: TurnFailure) -> Vec<Effect> {
        if !failure.kind.is_user_visible() {
            debug!("Absorbed {:?} failure: {}", failure.stage, failure.message);
            return Vec::new();
        }
        if self.state == TurnState::Idle {
            return Vec::new();
        }

        warn!("{:?} failed: {}", failure.stage, failure.message);
        let mut effects = Vec::new();
        match self.state {
            TurnState::Listening => effects.push(Effect::StopCapture),
            TurnState::Thinking => self.history.discard_reply(),
            _ => {}
        }
        self.transcript.clear();
        self.interim.clear();
        self.playing_audio = false;
        self.error = Some(failure.message);
        self.go_idle(STATUS_ERROR);
        effects
    }

    fn on_new_conversation(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state == TurnState::Listening {
            effects.push(Effect::StopCapture);
        }
        effects.push(Effect::CancelSpeech);

        // Anything still in flight belongs to the old conversation.
        self.turn += 1;
        self.conversation += 1;
        self.history.reset();
        self.transcript.clear();
        self.interim.clear();
        self.error = None;
        self.playing_audio = false;
        self.go_idle(STATUS_READY);
        info!("🆕 New conversation");
        effects
    }

    fn go_idle(&mut self, status: &str) {
        self.state = TurnState::Idle;
        self.status = status.to_string();
    }
}
