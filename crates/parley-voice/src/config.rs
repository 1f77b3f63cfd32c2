//! Runtime configuration for Parley
//!
//! Precedence: built-in defaults < TOML file (`PARLEY_CONFIG`, default `config/parley.toml`)
//! < environment (`PARLEY_` prefix, `__` between sections, e.g. `PARLEY_GENERATION__MODEL`).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "The assistant is a 38 year old bitter man who rages at the world.";
pub const DEFAULT_GENERATION_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_CACHE_CAPACITY: usize = 50;
const DEFAULT_CONFIG_PATH: &str = "config/parley.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Persona prompt; becomes the system turn of every conversation.
    pub system_prompt: String,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub capture: CaptureConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation: GenerationConfig::default(),
            synthesis: SynthesisConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

/// Text generation backend (Ollama-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GENERATION_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Speech synthesis. A `server_url` selects the remote provider; otherwise a local
/// speech command is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub server_url: Option<String>,
    pub cache_capacity: usize,
    /// Speech command override (espeak-ng, espeak, say). Detected on PATH when unset.
    pub command: Option<String>,
    pub voice: Option<String>,
    /// Multipliers around the command's defaults (1.0 = unchanged).
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// WAV player override (aplay, paplay, afplay). Detected on PATH when unset.
    pub player: Option<String>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            command: None,
            voice: None,
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            player: None,
        }
    }
}

/// Which capture provider the front-end drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Lines typed on the terminal are taken as final transcripts.
    Typed,
    /// Microphone + VAD + remote transcription (requires the `device` feature).
    Microphone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    pub language: String,
    pub continuous: bool,
    pub interim_results: bool,
    /// OpenAI-compatible transcription base URL (e.g. https://api.openai.com/v1).
    pub stt_url: String,
    pub stt_api_key: Option<String>,
    pub stt_model: String,
    /// Silence after speech that closes an utterance.
    pub gap_ms: u64,
    /// Utterances shorter than this are dropped.
    pub min_speech_ms: u64,
    /// A listening session longer than this ends on its own.
    pub max_session_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::Typed,
            language: "en-US".to_string(),
            continuous: true,
            interim_results: true,
            stt_url: "https://api.openai.com/v1".to_string(),
            stt_api_key: None,
            stt_model: "whisper-1".to_string(),
            gap_ms: 800,
            min_speech_ms: 200,
            max_session_secs: 60,
        }
    }
}

impl VoiceConfig {
    /// Load from `PARLEY_CONFIG` (or `config/parley.toml`) and the environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit file (skipped if it does not exist) and the environment.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("generation.base_url", DEFAULT_GENERATION_URL)?
            .set_default("generation.model", DEFAULT_MODEL)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: VoiceConfig = built.try_deserialize()?;
        config.validated()
    }

    /// Normalize URLs and reject values the providers cannot work with.
    pub fn validated(mut self) -> VoiceResult<Self> {
        if self.synthesis.cache_capacity == 0 {
            return Err(VoiceError::Config(
                "synthesis.cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.generation.base_url.trim().is_empty() {
            return Err(VoiceError::Config("generation.base_url is empty".to_string()));
        }

        self.generation.base_url = normalize_url(&self.generation.base_url);
        self.capture.stt_url = normalize_url(&self.capture.stt_url);
        self.synthesis.server_url = self
            .synthesis
            .server_url
            .as_deref()
            .map(normalize_url)
            .filter(|u| !u.is_empty());
        self.capture.stt_api_key = self.capture.stt_api_key.filter(|k| !k.trim().is_empty());
        Ok(self)
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_backends() {
        let c = VoiceConfig::default();
        assert_eq!(c.generation.base_url, "http://localhost:11434");
        assert_eq!(c.generation.model, "llama3.2");
        assert_eq!(c.synthesis.cache_capacity, 50);
        assert_eq!(c.capture.language, "en-US");
        assert!(c.capture.continuous && c.capture.interim_results);
        assert_eq!(c.capture.backend, CaptureBackend::Typed);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
system_prompt = "be kind"

[generation]
base_url = "http://gpu-box:11434/"
max_tokens = 128

[synthesis]
server_url = "http://tts.local:8000/"
cache_capacity = 3
"#
        )
        .unwrap();

        let c = VoiceConfig::load_from(file.path()).unwrap();
        assert_eq!(c.system_prompt, "be kind");
        assert_eq!(c.generation.base_url, "http://gpu-box:11434");
        assert_eq!(c.generation.model, "llama3.2");
        assert_eq!(c.generation.max_tokens, Some(128));
        assert_eq!(c.synthesis.server_url.as_deref(), Some("http://tts.local:8000"));
        assert_eq!(c.synthesis.cache_capacity, 3);
    }

    #[test]
    fn missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let c = VoiceConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(c.synthesis.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn zero_cache_is_rejected() {
        let mut c = VoiceConfig::default();
        c.synthesis.cache_capacity = 0;
        assert!(matches!(c.validated(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn blank_server_url_means_device_synthesis() {
        let mut c = VoiceConfig::default();
        c.synthesis.server_url = Some("  ".to_string());
        assert!(c.validated().unwrap().synthesis.server_url.is_none());
    }
}
