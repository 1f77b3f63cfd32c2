//! Remote synthesis server: `POST {base}/synthesize {"text": ...}` answers with WAV bytes.

use super::{play_buffer, CallbackSlot, Inflight, Playback, SynthesisCache, SynthesisCallbacks, SynthesisProvider};
use crate::audio::{AudioBuffer, AudioSink};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SYNTHESIZE_PATH: &str = "/synthesize";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

pub struct RemoteSynthesis {
    base_url: String,
    client: reqwest::Client,
    sink: Arc<dyn AudioSink>,
    cache: Mutex<SynthesisCache>,
    inflight: Inflight,
    callbacks: CallbackSlot,
}

impl RemoteSynthesis {
    pub fn new(base_url: impl Into<String>, cache_capacity: usize, sink: Arc<dyn AudioSink>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        info!("🗣️ Remote synthesis at {} (cache {})", base_url, cache_capacity);
        Self {
            base_url,
            client: reqwest::Client::new(),
            sink,
            cache: Mutex::new(SynthesisCache::new(cache_capacity)),
            inflight: Inflight::default(),
            callbacks: CallbackSlot::default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of cached utterances.
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cache_get(&self, text: &str) -> Option<Arc<AudioBuffer>> {
        self.cache.lock().ok().and_then(|c| c.get(text))
    }

    fn cache_insert(&self, text: &str, audio: Arc<AudioBuffer>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(text.to_string(), audio);
        }
    }

    /// Fetch and decode one utterance.
    async fn fetch(&self, text: &str) -> VoiceResult<AudioBuffer> {
        let url = format!("{}{}", self.base_url, SYNTHESIZE_PATH);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let is_json = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("application/json"))
                .unwrap_or(false);
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::status(
                status.as_u16(),
                error_message(status.as_u16(), is_json, &body),
            ));
        }

        let bytes = response.bytes().await?;
        AudioBuffer::from_wav_bytes(&bytes).map_err(|e| match e {
            VoiceError::Decode(msg) => VoiceError::Decode(format!("TTS server returned {}", msg)),
            other => other,
        })
    }
}

/// Message for a failed synthesis response: the JSON `error` field, the plain-text
/// body, or a generic status line.
fn error_message(status: u16, is_json: bool, body: &str) -> String {
    let fallback = format!("TTS server error {}", status);
    if is_json {
        return serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .filter(|e| !e.is_empty())
            .unwrap_or(fallback);
    }
    if body.is_empty() {
        fallback
    } else {
        body.to_string()
    }
}

#[async_trait]
impl SynthesisProvider for RemoteSynthesis {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn is_supported(&self) -> bool {
        !self.base_url.is_empty()
    }

    fn set_callbacks(&self, callbacks: SynthesisCallbacks) {
        self.callbacks.set(callbacks);
    }

    async fn speak(&self, text: &str) -> VoiceResult<Playback> {
        if !self.is_supported() {
            return Err(VoiceError::UnsupportedCapability(
                "TTS server URL not configured".to_string(),
            ));
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(Playback::Skipped);
        }

        let token = self.inflight.begin();
        self.sink.stop();
        let callbacks = self.callbacks.snapshot();

        let audio = match self.cache_get(text) {
            Some(audio) => {
                debug!("Synthesis cache hit ({} chars)", text.len());
                audio
            }
            None => {
                let fetched = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(Playback::Cancelled),
                    fetched = self.fetch(text) => fetched?,
                };
                if token.is_cancelled() {
                    return Ok(Playback::Cancelled);
                }
                let audio = Arc::new(fetched);
                self.cache_insert(text, Arc::clone(&audio));
                audio
            }
        };

        play_buffer(self.sink.as_ref(), audio, &token, &callbacks).await
    }

    fn cancel(&self) {
        self.inflight.cancel();
        self.sink.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_field_wins() {
        assert_eq!(error_message(503, true, r#"{"error":"voice not loaded"}"#), "voice not loaded");
    }

    #[test]
    fn unusable_json_falls_back_to_status() {
        assert_eq!(error_message(500, true, "{}"), "TTS server error 500");
        assert_eq!(error_message(500, true, "not json"), "TTS server error 500");
    }

    #[test]
    fn text_body_is_used_verbatim() {
        assert_eq!(error_message(400, false, "text too long"), "text too long");
        assert_eq!(error_message(502, false, ""), "TTS server error 502");
    }
}
