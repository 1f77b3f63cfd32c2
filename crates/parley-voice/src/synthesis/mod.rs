//! Synthesis - turn finished reply text into audible speech.
//!
//! Two providers share the `SynthesisProvider` contract:
//! - `RemoteSynthesis`: POSTs text to a synthesis server, decodes the WAV reply,
//!   caches it, and plays it through an `AudioSink`.
//! - `CommandSynthesis`: runs a local speech command (espeak-ng, espeak, say).
//!
//! A new `speak` or a `cancel` stops whatever is in flight; the interrupted call
//! resolves with `Playback::Cancelled` and never reports an error.

mod cache;
mod device;
mod remote;

pub use cache::SynthesisCache;
pub use device::CommandSynthesis;
pub use remote::RemoteSynthesis;

use crate::audio::{AudioBuffer, AudioSink, PlayOutcome};
use crate::error::VoiceResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Called with no arguments when playback starts or ends.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Called with the character offset of the word about to be spoken.
pub type BoundaryCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Playback notifications. Replaced wholesale by `set_callbacks`.
#[derive(Clone, Default)]
pub struct SynthesisCallbacks {
    pub on_start: Option<Callback>,
    pub on_end: Option<Callback>,
    pub on_boundary: Option<BoundaryCallback>,
}

impl SynthesisCallbacks {
    pub(crate) fn started(&self) {
        if let Some(cb) = &self.on_start {
            cb();
        }
    }

    pub(crate) fn ended(&self) {
        if let Some(cb) = &self.on_end {
            cb();
        }
    }
}

/// How a `speak` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    /// Played to the end; `on_end` fired.
    Completed,
    /// Stopped by `cancel` or a newer `speak`.
    Cancelled,
    /// Nothing to say (empty after trimming).
    Skipped,
}

#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_supported(&self) -> bool;

    fn set_callbacks(&self, callbacks: SynthesisCallbacks);

    /// Speak `text`, resolving when playback ends.
    async fn speak(&self, text: &str) -> VoiceResult<Playback>;

    /// Stop any in-flight fetch or playback. Safe to call when idle.
    fn cancel(&self);
}

/// Callbacks shared between `set_callbacks` and the running `speak`.
#[derive(Default)]
pub(crate) struct CallbackSlot(Mutex<SynthesisCallbacks>);

impl CallbackSlot {
    pub(crate) fn set(&self, callbacks: SynthesisCallbacks) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = callbacks;
        }
    }

    pub(crate) fn snapshot(&self) -> SynthesisCallbacks {
        self.0.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

/// Token of the operation in flight. Starting a new one cancels the old one.
#[derive(Default)]
pub(crate) struct Inflight(Mutex<Option<CancellationToken>>);

impl Inflight {
    pub(crate) fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut guard) = self.0.lock() {
            if let Some(previous) = guard.replace(token.clone()) {
                previous.cancel();
            }
        }
        token
    }

    pub(crate) fn cancel(&self) {
        if let Ok(mut guard) = self.0.lock() {
            if let Some(token) = guard.take() {
                token.cancel();
            }
        }
    }
}

/// Play a decoded buffer. The sink fires `on_start` once sound begins; `on_end`
/// follows a natural finish only.
pub(crate) async fn play_buffer(
    sink: &dyn AudioSink,
    audio: Arc<AudioBuffer>,
    cancel: &CancellationToken,
    callbacks: &SynthesisCallbacks,
) -> VoiceResult<Playback> {
    if cancel.is_cancelled() {
        return Ok(Playback::Cancelled);
    }
    let on_start = || callbacks.started();
    match sink.play(audio, cancel, &on_start).await? {
        PlayOutcome::Finished if !cancel.is_cancelled() => {
            callbacks.ended();
            Ok(Playback::Completed)
        }
        _ => Ok(Playback::Cancelled),
    }
}
