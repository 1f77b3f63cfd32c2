//! # Parley Voice - Turn-taking voice conversation
//!
//! Sequences three independently failing subsystems into one interruptible
//! conversational turn: speech capture, streaming text generation, and speech
//! synthesis.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Voice Orchestrator                         │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐   │
//! │  │   Capture    │ →  │ Turn Machine │ →  │    Generation    │   │
//! │  │ typed / mic  │    │ (pure FSM)   │    │ (Ollama NDJSON)  │   │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘   │
//! │                             ↓  ↑                  ↓              │
//! │                      ┌──────────────┐    ┌──────────────────┐   │
//! │                      │ SessionView  │    │    Synthesis     │   │
//! │                      │   (watch)    │    │ remote + cache / │   │
//! │                      └──────────────┘    │  speech command  │   │
//! │                                          └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every provider event carries the id of the turn that caused it; the turn
//! machine discards events from any turn but the current one.

pub mod audio;
pub mod capture;
pub mod config;
pub mod conversation;
pub mod ear;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod providers;
pub mod stt;
pub mod synthesis;
pub mod turn;
#[cfg(feature = "device")]
pub mod vad;

pub use audio::{AudioBuffer, AudioSink, CommandSink, PlayOutcome};
#[cfg(feature = "device")]
pub use audio::RodioSink;
pub use capture::{CaptureOptions, CaptureProvider, CaptureSink, TypedCapture};
pub use config::{CaptureBackend, CaptureConfig, GenerationConfig, SynthesisConfig, VoiceConfig};
pub use conversation::{Conversation, ConversationState, DisplayEntry, DisplayList, Role, Turn};
pub use ear::{EarConfig, GapDetector, SpeechSegment, VadState};
#[cfg(feature = "device")]
pub use ear::MicrophoneCapture;
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use generation::{ChatBackend, ChatParams, GenerateParams, NdjsonDecoder, OllamaClient};
pub use orchestrator::{EventTx, OrchestratorConfig, OrchestratorHandle, VoiceOrchestrator};
pub use providers::ProviderSet;
pub use stt::{RemoteStt, SttBackend};
pub use synthesis::{
    CommandSynthesis, Playback, RemoteSynthesis, SynthesisCache, SynthesisCallbacks, SynthesisProvider,
};
pub use turn::{
    Effect, EndReason, Origin, SessionView, Stage, TurnEvent, TurnFailure, TurnId, TurnMachine, TurnState,
};
#[cfg(feature = "device")]
pub use vad::{VadConfig, VadDetector};
