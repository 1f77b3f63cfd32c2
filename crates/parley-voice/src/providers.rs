//! Startup selection of the concrete capture, generation and synthesis providers.

use crate::audio::{AudioSink, CommandSink};
use crate::capture::{CaptureProvider, TypedCapture};
use crate::config::{CaptureBackend, SynthesisConfig, VoiceConfig};
use crate::error::VoiceResult;
use crate::generation::{ChatBackend, OllamaClient};
use crate::orchestrator::{OrchestratorConfig, OrchestratorHandle, VoiceOrchestrator};
use crate::synthesis::{CommandSynthesis, RemoteSynthesis, SynthesisProvider};
use std::sync::Arc;
use tracing::{info, warn};

/// The providers one session runs with.
pub struct ProviderSet {
    pub capture: Arc<dyn CaptureProvider>,
    /// Set when capture is typed, so the front-end can feed lines.
    pub typed: Option<Arc<TypedCapture>>,
    pub generator: Arc<dyn ChatBackend>,
    pub synthesis: Arc<dyn SynthesisProvider>,
}

impl ProviderSet {
    pub fn from_config(config: &VoiceConfig) -> VoiceResult<Self> {
        let (capture, typed) = select_capture(config)?;
        let generator: Arc<dyn ChatBackend> = Arc::new(OllamaClient::from_config(&config.generation));
        let synthesis = select_synthesis(&config.synthesis);
        Ok(Self {
            capture,
            typed,
            generator,
            synthesis,
        })
    }

    /// Wire the providers into an orchestrator.
    pub fn into_orchestrator(self, config: &VoiceConfig) -> (VoiceOrchestrator, OrchestratorHandle) {
        VoiceOrchestrator::new(
            OrchestratorConfig::from(config),
            self.capture,
            self.generator,
            self.synthesis,
        )
    }
}

type CaptureChoice = (Arc<dyn CaptureProvider>, Option<Arc<TypedCapture>>);

fn typed_capture() -> CaptureChoice {
    let typed = Arc::new(TypedCapture::new());
    let capture: Arc<dyn CaptureProvider> = typed.clone();
    (capture, Some(typed))
}

#[cfg(feature = "device")]
fn select_capture(config: &VoiceConfig) -> VoiceResult<CaptureChoice> {
    use crate::ear::{EarConfig, MicrophoneCapture};
    use crate::stt::RemoteStt;

    match config.capture.backend {
        CaptureBackend::Typed => Ok(typed_capture()),
        CaptureBackend::Microphone => {
            let stt = Arc::new(RemoteStt::from_config(&config.capture)?);
            let mic = MicrophoneCapture::new(EarConfig::from(&config.capture), stt);
            if mic.is_supported() {
                info!("🎤 Capture: microphone");
                let capture: Arc<dyn CaptureProvider> = Arc::new(mic);
                Ok((capture, None))
            } else {
                warn!("No input device; falling back to typed capture");
                Ok(typed_capture())
            }
        }
    }
}

#[cfg(not(feature = "device"))]
fn select_capture(config: &VoiceConfig) -> VoiceResult<CaptureChoice> {
    if config.capture.backend == CaptureBackend::Microphone {
        warn!("Built without the `device` feature; using typed capture");
    }
    Ok(typed_capture())
}

fn audio_sink(config: &SynthesisConfig) -> VoiceResult<Arc<dyn AudioSink>> {
    #[cfg(feature = "device")]
    {
        if config.player.is_none() {
            match crate::audio::RodioSink::new() {
                Ok(sink) => return Ok(Arc::new(sink)),
                Err(e) => warn!("Rodio output unavailable ({}); trying a player command", e),
            }
        }
    }
    Ok(Arc::new(CommandSink::detect(config.player.as_deref())?))
}

/// Remote synthesis when a server is configured and audio can be played;
/// otherwise the local speech command.
fn select_synthesis(config: &SynthesisConfig) -> Arc<dyn SynthesisProvider> {
    if let Some(url) = &config.server_url {
        match audio_sink(config) {
            Ok(sink) => {
                let remote = RemoteSynthesis::new(url.clone(), config.cache_capacity, sink);
                if remote.is_supported() {
                    return Arc::new(remote);
                }
            }
            Err(e) => warn!("Remote synthesis disabled: {}", e),
        }
    }
    info!("🗣️ Synthesis: device");
    Arc::new(CommandSynthesis::detect(config))
}
