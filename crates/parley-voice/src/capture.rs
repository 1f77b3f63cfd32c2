//! Capture: continuous speech-to-text sessions.
//!
//! A `CaptureProvider` runs at most one listening session at a time and reports into
//! the `CaptureSink` it was started with. The sink is bound to a single turn, so a
//! provider that reports late can only ever reach the turn that started it.

use crate::error::{VoiceError, VoiceResult};
use crate::orchestrator::EventTx;
use crate::turn::{EndReason, Origin, Stage, TurnEvent, TurnFailure, TurnId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Options for one listening session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub language: String,
    pub continuous: bool,
    pub interim_results: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            continuous: true,
            interim_results: true,
        }
    }
}

/// Speech capture backend.
pub trait CaptureProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Begin a session. Results, errors and the terminal end go to `sink`.
    fn start_listening(&self, options: CaptureOptions, sink: CaptureSink) -> VoiceResult<()>;

    /// Ask the active session to end. Idempotent; the end is reported through the sink.
    fn stop_listening(&self);

    fn is_listening(&self) -> bool;
}

struct SinkInner {
    turn: TurnId,
    tx: EventTx,
    stop_requested: AtomicBool,
    ended: AtomicBool,
}

/// Per-session event sink handed to a `CaptureProvider`.
///
/// Guarantees exactly one `CaptureEnded` per session, stamps it with the right
/// `EndReason`, and swallows cancellations.
#[derive(Clone)]
pub struct CaptureSink {
    inner: Arc<SinkInner>,
}

impl CaptureSink {
    pub fn new(turn: TurnId, tx: EventTx) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                turn,
                tx,
                stop_requested: AtomicBool::new(false),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn turn(&self) -> TurnId {
        self.inner.turn
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Mark the coming end as caller-initiated.
    pub fn request_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) {
        if !self.is_ended() {
            self.post(TurnEvent::CaptureStarted);
        }
    }

    pub fn result(&self, text: &str, is_final: bool) {
        if self.is_ended() {
            debug!("Capture result after end dropped (turn {})", self.inner.turn);
            return;
        }
        let event = if is_final {
            TurnEvent::CaptureFinal(text.to_string())
        } else {
            TurnEvent::CaptureInterim(text.to_string())
        };
        self.post(event);
    }

    pub fn error(&self, err: VoiceError) {
        if matches!(err, VoiceError::Cancelled) || self.is_ended() {
            debug!("Capture error swallowed: {}", err);
            return;
        }
        self.post(TurnEvent::ErrorOccurred(TurnFailure::new(
            Stage::Capture,
            err.kind(),
            err.to_string(),
        )));
    }

    /// Terminal event. Only the first call is delivered.
    pub fn ended(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = if self.stop_requested() {
            EndReason::UserStop
        } else {
            EndReason::ProviderStop
        };
        self.post(TurnEvent::CaptureEnded(reason));
    }

    fn post(&self, event: TurnEvent) {
        if self.inner.tx.send((Origin::Turn(self.inner.turn), event)).is_err() {
            debug!("Capture event dropped: orchestrator gone");
        }
    }
}

/// Line-fed capture for terminals without a microphone.
///
/// Each fed line is a final transcript of the active session; lines fed while no
/// session is active are rejected.
#[derive(Default)]
pub struct TypedCapture {
    session: Mutex<Option<CaptureSink>>,
}

impl TypedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a final transcript. Returns false when not listening.
    pub fn feed(&self, line: &str) -> bool {
        self.with_session(|sink| sink.result(line, true))
    }

    /// Deliver an interim transcript. Returns false when not listening.
    pub fn feed_interim(&self, partial: &str) -> bool {
        self.with_session(|sink| sink.result(partial, false))
    }

    fn with_session(&self, f: impl FnOnce(&CaptureSink)) -> bool {
        match self.session.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sink) => {
                    f(sink);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn take_session(&self) -> Option<CaptureSink> {
        self.session.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl CaptureProvider for TypedCapture {
    fn is_supported(&self) -> bool {
        true
    }

    fn start_listening(&self, options: CaptureOptions, sink: CaptureSink) -> VoiceResult<()> {
        if let Some(previous) = self.take_session() {
            previous.ended();
        }
        info!("⌨️ Typed capture listening (turn {}, {})", sink.turn(), options.language);
        sink.started();
        let mut guard = self
            .session
            .lock()
            .map_err(|e| VoiceError::AudioDevice(format!("capture state poisoned: {}", e)))?;
        *guard = Some(sink);
        Ok(())
    }

    fn stop_listening(&self) {
        if let Some(sink) = self.take_session() {
            sink.ended();
        }
    }

    fn is_listening(&self) -> bool {
        self.session.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}
