//! Voice Activity Detection using WebRTC VAD.
//!
//! The detector is not `Send`; create it on the thread that feeds it.

use crate::error::{VoiceError, VoiceResult};
use tracing::info;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

fn vad_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn vad_rate(rate: u32) -> VoiceResult<SampleRate> {
    match rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

/// Speech/silence classifier over fixed 30ms frames.
pub struct VadDetector {
    vad: Vad,
    chunk_size: usize,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        if config.mode > 3 {
            return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", config.mode)));
        }
        let rate = vad_rate(config.sample_rate)?;

        // WebRTC VAD accepts 10, 20 or 30ms frames.
        let chunk_size = (config.sample_rate as usize * 30) / 1000;
        let vad = Vad::new_with_rate_and_mode(rate, vad_mode(config.mode));
        info!("🎙️ WebRTC VAD ready ({}Hz, mode {}, {} samples/frame)", config.sample_rate, config.mode, chunk_size);

        Ok(Self { vad, chunk_size })
    }

    /// Classify one frame of exactly `chunk_size` samples.
    pub fn is_speech(&mut self, audio: &[f32]) -> VoiceResult<bool> {
        if audio.len() != self.chunk_size {
            return Err(VoiceError::AudioDevice(format!(
                "VAD expected {} samples, got {}",
                self.chunk_size,
                audio.len()
            )));
        }
        let frame: Vec<i16> = audio
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        self.vad
            .is_voice_segment(&frame)
            .map_err(|_| VoiceError::AudioDevice("VAD processing failed".to_string()))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
