//! Voice Orchestrator - The main coordination layer
//!
//! Drives one `TurnMachine` from a single event queue. User actions arrive through
//! an `OrchestratorHandle`; providers post their events back stamped with the turn
//! they belong to. Generation and synthesis run in spawned tasks so the queue
//! keeps draining while a reply streams or plays.
//!
//! ```text
//!  handle ──toggle/reset──┐
//!                         ▼
//!  capture sink ──▶ [ event queue ] ──▶ TurnMachine ──▶ effects ──▶ providers
//!  generation task ──┘        ▲                 │
//!  synthesis task ───────────┘                 └──▶ watch<SessionView>
//! ```

use crate::capture::{CaptureOptions, CaptureProvider, CaptureSink};
use crate::config::VoiceConfig;
use crate::generation::{ChatBackend, ChatParams};
use crate::synthesis::{Playback, SynthesisCallbacks, SynthesisProvider};
use crate::turn::{Effect, Origin, SessionView, Stage, TurnEvent, TurnFailure, TurnId, TurnMachine};
use crate::conversation::Turn;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sender side of the orchestrator's event queue.
pub type EventTx = mpsc::UnboundedSender<(Origin, TurnEvent)>;

/// Configuration for the voice orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub capture: CaptureOptions,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

impl From<&VoiceConfig> for OrchestratorConfig {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            capture: CaptureOptions {
                language: config.capture.language.clone(),
                continuous: config.capture.continuous,
                interim_results: config.capture.interim_results,
            },
            model: Some(config.generation.model.clone()),
            max_tokens: config.generation.max_tokens,
            temperature: config.generation.temperature,
        }
    }
}

/// Control surface for a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: EventTx,
    view: watch::Receiver<SessionView>,
    shutdown: CancellationToken,
}

impl OrchestratorHandle {
    /// Start listening when idle, stop when listening, ignored otherwise.
    pub fn toggle(&self) {
        self.send(TurnEvent::TogglePressed);
    }

    /// Stop everything and start over with only the system turn.
    pub fn new_conversation(&self) {
        self.send(TurnEvent::NewConversation);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Receiver that sees every published `SessionView`.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> SessionView {
        self.view.borrow().clone()
    }

    fn send(&self, event: TurnEvent) {
        if self.events.send((Origin::User, event)).is_err() {
            debug!("Orchestrator gone; input dropped");
        }
    }
}

/// The main voice orchestration system
///
/// This coordinates:
/// - Speech capture (typed or microphone)
/// - Streaming generation
/// - Synthesis and playback
/// - Conversation history, through the turn machine
pub struct VoiceOrchestrator {
    config: OrchestratorConfig,
    machine: TurnMachine,

    capture: Arc<dyn CaptureProvider>,
    generator: Arc<dyn ChatBackend>,
    synthesis: Arc<dyn SynthesisProvider>,

    events_tx: EventTx,
    events_rx: mpsc::UnboundedReceiver<(Origin, TurnEvent)>,
    view_tx: watch::Sender<SessionView>,
    shutdown: CancellationToken,

    // Sink of the current capture session, so a stop can be marked as user-initiated.
    capture_sink: Option<CaptureSink>,
}

impl VoiceOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        capture: Arc<dyn CaptureProvider>,
        generator: Arc<dyn ChatBackend>,
        synthesis: Arc<dyn SynthesisProvider>,
    ) -> (Self, OrchestratorHandle) {
        let machine = TurnMachine::new(config.system_prompt.clone(), capture.is_supported());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(machine.view());
        let shutdown = CancellationToken::new();

        let handle = OrchestratorHandle {
            events: events_tx.clone(),
            view: view_rx,
            shutdown: shutdown.clone(),
        };

        info!(
            "🎭 Voice Orchestrator ready (synthesis: {}, capture supported: {})",
            synthesis.name(),
            capture.is_supported()
        );

        let orchestrator = Self {
            config,
            machine,
            capture,
            generator,
            synthesis,
            events_tx,
            events_rx,
            view_tx,
            shutdown,
            capture_sink: None,
        };
        (orchestrator, handle)
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events one at a time until `shutdown`.
    pub async fn run(mut self) {
        info!("🚀 Voice Orchestrator started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.events_rx.recv() => match next {
                    Some((origin, event)) => self.step(origin, event),
                    None => break,
                },
            }
        }
        self.stop_providers();
        info!("🛑 Voice Orchestrator stopped");
    }

    fn step(&mut self, origin: Origin, event: TurnEvent) {
        for effect in self.machine.handle(origin, event) {
            self.execute(effect);
        }
        self.view_tx.send_replace(self.machine.view());
    }

    fn execute(&mut self, effect: Effect) {
        debug!("Effect: {:?}", effect);
        match effect {
            Effect::StartCapture { turn } => self.start_capture(turn),
            Effect::StopCapture => self.stop_capture(),
            Effect::Generate { turn, messages } => self.generate(turn, messages),
            Effect::Speak { turn, text } => self.speak(turn, text),
            Effect::CancelSpeech => self.synthesis.cancel(),
        }
    }

    fn start_capture(&mut self, turn: TurnId) {
        let sink = CaptureSink::new(turn, self.events_tx.clone());
        self.capture_sink = Some(sink.clone());
        if let Err(e) = self.capture.start_listening(self.config.capture.clone(), sink.clone()) {
            sink.error(e);
        }
    }

    fn stop_capture(&mut self) {
        if let Some(sink) = &self.capture_sink {
            sink.request_stop();
        }
        self.capture.stop_listening();
    }

    fn generate(&self, turn: TurnId, messages: Vec<Turn>) {
        let generator = Arc::clone(&self.generator);
        let tx = self.events_tx.clone();
        let params = ChatParams {
            messages,
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        tokio::spawn(async move {
            let chunk_tx = tx.clone();
            let mut on_chunk = move |delta: &str| {
                let _ = chunk_tx.send((Origin::Turn(turn), TurnEvent::GenerationChunk(delta.to_string())));
            };
            let event = match generator.chat_stream(params, &mut on_chunk).await {
                Ok(reply) => TurnEvent::GenerationDone(reply),
                Err(e) => TurnEvent::ErrorOccurred(TurnFailure::new(Stage::Generation, e.kind(), e.to_string())),
            };
            let _ = tx.send((Origin::Turn(turn), event));
        });
    }

    fn speak(&self, turn: TurnId, text: String) {
        let synthesis = Arc::clone(&self.synthesis);
        let tx = self.events_tx.clone();

        let post = move |tx: &EventTx, event: TurnEvent| {
            let _ = tx.send((Origin::Turn(turn), event));
        };
        let (start_tx, end_tx) = (tx.clone(), tx.clone());
        synthesis.set_callbacks(SynthesisCallbacks {
            on_start: Some(Arc::new(move || post(&start_tx, TurnEvent::SynthesisStarted))),
            on_end: Some(Arc::new(move || post(&end_tx, TurnEvent::SynthesisEnded))),
            on_boundary: None,
        });

        tokio::spawn(async move {
            match synthesis.speak(&text).await {
                Ok(Playback::Completed) => {}
                Ok(outcome) => {
                    debug!("Synthesis resolved {:?}", outcome);
                    post(&tx, TurnEvent::SynthesisEnded);
                }
                Err(e) => post(
                    &tx,
                    TurnEvent::ErrorOccurred(TurnFailure::new(Stage::Synthesis, e.kind(), e.to_string())),
                ),
            }
        });
    }

    fn stop_providers(&mut self) {
        if self.capture.is_listening() {
            self.stop_capture();
        }
        self.synthesis.cancel();
    }
}
