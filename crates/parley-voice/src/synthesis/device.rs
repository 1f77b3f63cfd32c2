//! Device-native synthesis through a local speech command.

use super::{CallbackSlot, Inflight, Playback, SynthesisCallbacks, SynthesisProvider};
use crate::config::SynthesisConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, info, warn};

const CANDIDATES: &[&str] = &["espeak-ng", "espeak", "say"];

/// Baselines the rate/pitch/volume multipliers scale.
const BASE_WPM: f32 = 175.0;
const BASE_PITCH: f32 = 50.0;
const BASE_AMPLITUDE: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Espeak,
    Say,
}

impl Flavor {
    fn of(program: &str) -> Self {
        if program.ends_with("say") {
            Flavor::Say
        } else {
            Flavor::Espeak
        }
    }
}

/// Speaks through espeak-ng, espeak or macOS `say`.
///
/// `on_start` fires once the process is running, `on_end` when it exits cleanly.
/// A command gives no word timing, so `on_boundary` is never called.
pub struct CommandSynthesis {
    program: Option<(PathBuf, Flavor)>,
    voice: Option<String>,
    rate: f32,
    pitch: f32,
    volume: f32,
    inflight: Inflight,
    callbacks: CallbackSlot,
}

impl CommandSynthesis {
    /// Resolve the configured command, or the first candidate on PATH.
    pub fn detect(config: &SynthesisConfig) -> Self {
        let names: Vec<&str> = match config.command.as_deref() {
            Some(name) => vec![name],
            None => CANDIDATES.to_vec(),
        };
        let program = names.iter().find_map(|name| {
            which::which(name)
                .ok()
                .map(|path| (path, Flavor::of(name)))
        });

        match &program {
            Some((path, _)) => info!("🗣️ Device synthesis via {}", path.display()),
            None => warn!("No speech command found (tried {})", names.join(", ")),
        }

        Self {
            program,
            voice: config.voice.clone(),
            rate: config.rate,
            pitch: config.pitch,
            volume: config.volume,
            inflight: Inflight::default(),
            callbacks: CallbackSlot::default(),
        }
    }

    fn args(&self, flavor: Flavor, text: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(voice) = &self.voice {
            args.push("-v".to_string());
            args.push(voice.clone());
        }
        let wpm = (BASE_WPM * self.rate).round().max(1.0) as u32;
        match flavor {
            Flavor::Espeak => {
                args.push("-s".to_string());
                args.push(wpm.to_string());
                args.push("-p".to_string());
                args.push(((BASE_PITCH * self.pitch).round().clamp(0.0, 99.0) as u32).to_string());
                args.push("-a".to_string());
                args.push(((BASE_AMPLITUDE * self.volume).round().clamp(0.0, 200.0) as u32).to_string());
            }
            Flavor::Say => {
                args.push("-r".to_string());
                args.push(wpm.to_string());
            }
        }
        // A leading dash would be read as a flag.
        if text.starts_with('-') {
            args.push(format!(" {}", text));
        } else {
            args.push(text.to_string());
        }
        args
    }
}

#[async_trait]
impl SynthesisProvider for CommandSynthesis {
    fn name(&self) -> &'static str {
        "device"
    }

    fn is_supported(&self) -> bool {
        self.program.is_some()
    }

    fn set_callbacks(&self, callbacks: SynthesisCallbacks) {
        self.callbacks.set(callbacks);
    }

    async fn speak(&self, text: &str) -> VoiceResult<Playback> {
        let (program, flavor) = self.program.as_ref().ok_or_else(|| {
            VoiceError::UnsupportedCapability("Speech synthesis not supported on this device.".to_string())
        })?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(Playback::Skipped);
        }

        let token = self.inflight.begin();
        let callbacks = self.callbacks.snapshot();

        let mut child = tokio::process::Command::new(program)
            .args(self.args(*flavor, text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        callbacks.started();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = child.kill().await;
                debug!("Speech command cancelled");
                Ok(Playback::Cancelled)
            }
            status = child.wait() => {
                let status = status?;
                if token.is_cancelled() {
                    Ok(Playback::Cancelled)
                } else if status.success() {
                    callbacks.ended();
                    Ok(Playback::Completed)
                } else {
                    Err(VoiceError::Playback(format!(
                        "{} exited with {}",
                        program.display(),
                        status
                    )))
                }
            }
        }
    }

    fn cancel(&self) {
        self.inflight.cancel();
    }
}
