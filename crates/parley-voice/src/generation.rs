//! **Generation** — streaming chat against an Ollama-compatible backend.
//!
//! `chat_stream` posts the whole conversation to `/api/chat` and reads the
//! newline-delimited JSON reply as it arrives, handing each content delta to the
//! caller. `NdjsonDecoder` does the line framing; it works on bytes so a UTF-8
//! sequence split across reads is reassembled before decoding.

use crate::config::{GenerationConfig, DEFAULT_GENERATION_URL, DEFAULT_MODEL};
use crate::conversation::Turn;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// One chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub messages: Vec<Turn>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatParams {
    pub fn new(messages: Vec<Turn>) -> Self {
        Self { messages, ..Default::default() }
    }
}

/// Single-prompt completion request (`/api/generate`).
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Text generation backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stream a reply. Every non-empty delta goes to `on_chunk`; resolves with the
    /// concatenation of all deltas.
    async fn chat_stream(
        &self,
        params: ChatParams,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> VoiceResult<String>;

    /// Cheap reachability probe.
    async fn is_available(&self) -> bool;
}

#[derive(Debug, Serialize, Default)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl ModelOptions {
    fn from_params(max_tokens: Option<u32>, temperature: Option<f32>) -> Option<Self> {
        if max_tokens.is_none() && temperature.is_none() {
            return None;
        }
        Some(Self { num_predict: max_tokens, temperature })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ModelOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ModelOptions>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Splits a byte stream into complete, non-blank lines.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// The trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Parsed content of one stream line.
enum LineOutcome {
    Delta(String),
    Done(String),
}

fn parse_chat_line(line: &str) -> VoiceResult<LineOutcome> {
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| VoiceError::MalformedFragment(format!("{}: {}", e, line)))?;
    if let Some(err) = chunk.error {
        return Err(VoiceError::Transport {
            status: None,
            message: format!("Ollama error: {}", err),
        });
    }
    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok(if chunk.done {
        LineOutcome::Done(content)
    } else {
        LineOutcome::Delta(content)
    })
}

/// Ollama REST client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: None,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        let mut client = Self::new(&config.base_url).with_model(&config.model);
        client.max_tokens = config.max_tokens;
        client.temperature = config.temperature;
        client
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn options(&self, max_tokens: Option<u32>, temperature: Option<f32>) -> Option<ModelOptions> {
        ModelOptions::from_params(max_tokens.or(self.max_tokens), temperature.or(self.temperature))
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> VoiceResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(VoiceError::status(status, format!("Ollama error {}: {}", status, text)));
        }
        Ok(response)
    }

    /// Non-streaming chat.
    pub async fn chat(&self, params: ChatParams) -> VoiceResult<String> {
        let model = params.model.as_deref().unwrap_or(&self.model);
        let body = ChatRequest {
            model,
            messages: &params.messages,
            stream: false,
            options: self.options(params.max_tokens, params.temperature),
        };
        let response = self.post_json("/api/chat", &body).await?;
        let chunk: ChatChunk = response
            .json()
            .await
            .map_err(|e| VoiceError::Decode(format!("invalid chat response: {}", e)))?;
        Ok(chunk.message.map(|m| m.content).unwrap_or_default())
    }

    /// Single-prompt completion.
    pub async fn generate(&self, params: GenerateParams) -> VoiceResult<String> {
        let model = params.model.as_deref().unwrap_or(&self.model);
        let body = GenerateRequest {
            model,
            prompt: &params.prompt,
            stream: false,
            system: params.system_prompt.as_deref().filter(|s| !s.is_empty()),
            options: self.options(params.max_tokens, params.temperature),
        };
        let response = self.post_json("/api/generate", &body).await?;
        let data: GenerateResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Decode(format!("invalid generate response: {}", e)))?;
        Ok(data.response)
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_GENERATION_URL)
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    async fn chat_stream(
        &self,
        params: ChatParams,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> VoiceResult<String> {
        let model = params.model.as_deref().unwrap_or(&self.model);
        let body = ChatRequest {
            model,
            messages: &params.messages,
            stream: true,
            options: self.options(params.max_tokens, params.temperature),
        };
        info!("🧠 Generating with {} ({} messages)", model, params.messages.len());

        let response = self.post_json("/api/chat", &body).await?;
        let mut stream = response.bytes_stream();
        let mut decoder = NdjsonDecoder::new();
        let mut full = String::new();
        let mut done = false;

        let mut emit = |content: &str, full: &mut String| {
            if !content.is_empty() {
                full.push_str(content);
                on_chunk(content);
            }
        };

        'read: while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            for line in decoder.push(&bytes) {
                match parse_chat_line(&line) {
                    Ok(LineOutcome::Delta(content)) => emit(&content, &mut full),
                    Ok(LineOutcome::Done(content)) => {
                        emit(&content, &mut full);
                        done = true;
                        break 'read;
                    }
                    Err(VoiceError::MalformedFragment(e)) => {
                        debug!("Skipping malformed stream line: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(line) = decoder.finish().filter(|_| !done) {
            match parse_chat_line(&line) {
                Ok(LineOutcome::Delta(content)) | Ok(LineOutcome::Done(content)) => {
                    emit(&content, &mut full)
                }
                Err(VoiceError::MalformedFragment(e)) => {
                    debug!("Skipping malformed trailing line: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Generation finished ({} chars)", full.len());
        Ok(full)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("Generation backend probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_reads_are_reassembled() {
        let mut d = NdjsonDecoder::new();
        assert!(d.push(br#"{"message":{"content":"Hel"#).is_empty());
        let lines = d.push(b"\"}}\n{\"done\":true}\n");
        assert_eq!(lines, vec![r#"{"message":{"content":"Hel"}}"#, r#"{"done":true}"#]);
        assert!(d.finish().is_none());
    }

    #[test]
    fn split_utf8_sequence_survives() {
        let line = "{\"message\":{\"content\":\"caf\u{e9}\"}}\n".as_bytes();
        let cut = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut d = NdjsonDecoder::new();
        assert!(d.push(&line[..cut]).is_empty());
        let lines = d.push(&line[cut..]);
        assert!(lines[0].contains("café"));
    }

    #[test]
    fn blank_lines_are_ignored_and_tail_is_kept() {
        let mut d = NdjsonDecoder::new();
        assert!(d.push(b"\n  \r\n").is_empty());
        assert!(d.push(br#"{"done":true}"#).is_empty());
        assert_eq!(d.finish().as_deref(), Some(r#"{"done":true}"#));
    }

    #[test]
    fn malformed_line_is_a_fragment_error() {
        assert!(matches!(parse_chat_line("{nope"), Err(VoiceError::MalformedFragment(_))));
        assert!(matches!(
            parse_chat_line(r#"{"error":"model not found"}"#),
            Err(VoiceError::Transport { .. })
        ));
    }

    #[test]
    fn options_only_sent_when_set() {
        let client = OllamaClient::default();
        let body = ChatRequest {
            model: "m",
            messages: &[Turn::user("hi")],
            stream: true,
            options: client.options(None, None),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("options").is_none());

        let json = serde_json::to_value(ModelOptions::from_params(Some(64), None)).unwrap();
        assert_eq!(json, serde_json::json!({"num_predict": 64}));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        assert_eq!(OllamaClient::new("http://host:11434/").base_url(), "http://host:11434");
    }
}
