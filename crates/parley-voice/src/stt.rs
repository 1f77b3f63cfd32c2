//! **Speech-to-Text (STT)** — turn a captured `SpeechSegment` into text.
//!
//! `RemoteStt` talks to any OpenAI-compatible `/audio/transcriptions` endpoint
//! (OpenAI Whisper, a local whisper server, ...). The segment is uploaded as
//! 16-bit mono WAV.

use crate::audio::AudioBuffer;
use crate::config::CaptureConfig;
use crate::ear::SpeechSegment;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Backend that converts one utterance to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Returns an empty string when nothing intelligible was said.
    async fn transcribe(&self, segment: &SpeechSegment) -> VoiceResult<String>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// OpenAI-compatible transcription API.
#[derive(Debug, Clone)]
pub struct RemoteStt {
    base_url: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
    client: reqwest::Client,
}

impl RemoteStt {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            language: None,
            client,
        })
    }

    pub fn from_config(config: &CaptureConfig) -> VoiceResult<Self> {
        let mut stt = Self::new(&config.stt_url, config.stt_api_key.clone(), &config.stt_model)?;
        // The API wants ISO-639-1 ("en"), not a locale ("en-US").
        stt.language = config
            .language
            .split(['-', '_'])
            .next()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_lowercase());
        Ok(stt)
    }
}

#[async_trait]
impl SttBackend for RemoteStt {
    async fn transcribe(&self, segment: &SpeechSegment) -> VoiceResult<String> {
        if segment.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = AudioBuffer::new(segment.samples.clone(), segment.sample_rate, 1).to_wav_bytes()?;
        let url = format!("{}/audio/transcriptions", self.base_url);

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let mut request = self.client.post(&url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::status(status, format!("STT API error {}: {}", status, body)));
        }

        let json: TranscriptionResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Decode(format!("invalid transcription response: {}", e)))?;
        debug!("Transcribed {:?} of speech", segment.duration);
        Ok(json.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_is_reduced_to_language() {
        let config = CaptureConfig {
            language: "en-US".to_string(),
            ..Default::default()
        };
        let stt = RemoteStt::from_config(&config).unwrap();
        assert_eq!(stt.language.as_deref(), Some("en"));
        assert_eq!(stt.base_url, "https://api.openai.com/v1");
    }

    #[tokio::test]
    async fn empty_segment_skips_the_request() {
        let stt = RemoteStt::new("http://127.0.0.1:9", None, "whisper-1").unwrap();
        let text = stt.transcribe(&SpeechSegment::new(Vec::new(), 16000)).await.unwrap();
        assert!(text.is_empty());
    }
}
