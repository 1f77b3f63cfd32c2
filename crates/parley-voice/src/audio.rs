//! Decoded audio buffers and the output side of playback.
//!
//! `AudioBuffer` is what the synthesis cache stores: PCM decoded once with hound.
//! An `AudioSink` plays a buffer to completion or until stopped. Without the
//! `device` feature playback goes through a player command (`CommandSink`); with
//! it, through rodio on the default output device (`RodioSink`).

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Interleaved PCM, normalized to -1.0..1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self { samples, sample_rate, channels }
    }

    /// Decode a WAV body (integer or float PCM).
    pub fn from_wav_bytes(bytes: &[u8]) -> VoiceResult<Self> {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(VoiceError::Decode("invalid audio: empty format".to_string()));
        }

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        if samples.is_empty() {
            return Err(VoiceError::Decode("invalid audio: no samples".to_string()));
        }

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    /// Encode as 16-bit PCM WAV.
    pub fn to_wav_bytes(&self) -> VoiceResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &s in &self.samples {
                writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as f64 / f64::from(self.channels.max(1));
        Duration::from_secs_f64(frames / f64::from(self.sample_rate.max(1)))
    }
}

/// How a `play` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Finished,
    Stopped,
}

/// Audio output. One buffer plays at a time.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `audio` until it finishes, `cancel` fires, or `stop` is called.
    /// `on_start` runs once output has actually begun; never on a failure before that.
    async fn play(
        &self,
        audio: Arc<AudioBuffer>,
        cancel: &CancellationToken,
        on_start: &(dyn Fn() + Send + Sync),
    ) -> VoiceResult<PlayOutcome>;

    /// Stop whatever is playing now.
    fn stop(&self);
}

/// Remembers the token of the playback in progress so `stop` can reach it.
#[derive(Default)]
struct CurrentPlayback(Mutex<Option<CancellationToken>>);

impl CurrentPlayback {
    fn begin(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        if let Ok(mut guard) = self.0.lock() {
            if let Some(previous) = guard.replace(token.clone()) {
                previous.cancel();
            }
        }
        token
    }

    fn stop(&self) {
        if let Ok(mut guard) = self.0.lock() {
            if let Some(token) = guard.take() {
                token.cancel();
            }
        }
    }
}

const PLAYERS: &[(&str, &[&str])] = &[
    ("aplay", &["-q"]),
    ("paplay", &[]),
    ("afplay", &[]),
    ("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
];

/// Plays buffers by writing a temporary WAV and running a player command.
pub struct CommandSink {
    program: PathBuf,
    args: Vec<String>,
    current: CurrentPlayback,
}

impl CommandSink {
    /// Use `preferred` if given, otherwise the first known player found on PATH.
    pub fn detect(preferred: Option<&str>) -> VoiceResult<Self> {
        if let Some(name) = preferred {
            let program = which::which(name).map_err(|e| {
                VoiceError::UnsupportedCapability(format!("audio player '{}' not found: {}", name, e))
            })?;
            let args = PLAYERS
                .iter()
                .find(|(p, _)| *p == name)
                .map(|(_, a)| a.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default();
            return Ok(Self::new(program, args));
        }

        for (name, args) in PLAYERS {
            if let Ok(program) = which::which(name) {
                return Ok(Self::new(program, args.iter().map(|s| s.to_string()).collect()));
            }
        }
        Err(VoiceError::UnsupportedCapability(
            "no audio player found (tried aplay, paplay, afplay, ffplay)".to_string(),
        ))
    }

    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        info!("🔊 Command playback via {}", program.display());
        Self {
            program,
            args,
            current: CurrentPlayback::default(),
        }
    }
}

#[async_trait]
impl AudioSink for CommandSink {
    async fn play(
        &self,
        audio: Arc<AudioBuffer>,
        cancel: &CancellationToken,
        on_start: &(dyn Fn() + Send + Sync),
    ) -> VoiceResult<PlayOutcome> {
        let token = self.current.begin(cancel);

        let mut file = tempfile::Builder::new()
            .prefix("parley-")
            .suffix(".wav")
            .tempfile()?;
        file.write_all(&audio.to_wav_bytes()?)?;
        file.flush()?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        on_start();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = child.kill().await;
                debug!("Playback stopped");
                Ok(PlayOutcome::Stopped)
            }
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(PlayOutcome::Finished)
                } else {
                    Err(VoiceError::Playback(format!(
                        "{} exited with {}",
                        self.program.display(),
                        status
                    )))
                }
            }
        }
    }

    fn stop(&self) {
        self.current.stop();
    }
}

#[cfg(feature = "device")]
pub use rodio_sink::RodioSink;

#[cfg(feature = "device")]
mod rodio_sink {
    use super::*;
    use rodio::{OutputStream, OutputStreamHandle, Sink};
    use std::sync::mpsc as std_mpsc;
    use std::thread;

    /// In-process playback on the default output device.
    ///
    /// The `OutputStream` is !Send on some platforms, so it lives on a parked thread
    /// for the lifetime of the sink; playback only needs the handle.
    pub struct RodioSink {
        handle: OutputStreamHandle,
        playing: Mutex<Option<Arc<Sink>>>,
        current: CurrentPlayback,
        _keepalive: std_mpsc::Sender<()>,
    }

    impl RodioSink {
        pub fn new() -> VoiceResult<Self> {
            let (handle_tx, handle_rx) = std_mpsc::channel();
            let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();

            thread::spawn(move || match OutputStream::try_default() {
                Ok((_stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Park until the sink is dropped.
                    let _ = keepalive_rx.recv();
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            });

            let handle = handle_rx
                .recv()
                .map_err(|e| VoiceError::Playback(format!("output thread died: {}", e)))??;
            info!("🔊 Rodio playback ready");

            Ok(Self {
                handle,
                playing: Mutex::new(None),
                current: CurrentPlayback::default(),
                _keepalive: keepalive_tx,
            })
        }
    }

    #[async_trait]
    impl AudioSink for RodioSink {
        async fn play(
            &self,
            audio: Arc<AudioBuffer>,
            cancel: &CancellationToken,
            on_start: &(dyn Fn() + Send + Sync),
        ) -> VoiceResult<PlayOutcome> {
            let token = self.current.begin(cancel);

            let sink = Arc::new(
                Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?,
            );
            sink.append(rodio::buffer::SamplesBuffer::new(
                audio.channels,
                audio.sample_rate,
                audio.samples.clone(),
            ));
            if let Ok(mut guard) = self.playing.lock() {
                if let Some(previous) = guard.replace(Arc::clone(&sink)) {
                    previous.stop();
                }
            }
            on_start();

            let waiter = Arc::clone(&sink);
            let done = tokio::task::spawn_blocking(move || waiter.sleep_until_end());

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    sink.stop();
                    Ok(PlayOutcome::Stopped)
                }
                joined = done => {
                    joined.map_err(|e| VoiceError::Playback(e.to_string()))?;
                    if token.is_cancelled() {
                        Ok(PlayOutcome::Stopped)
                    } else {
                        Ok(PlayOutcome::Finished)
                    }
                }
            }
        }

        fn stop(&self) {
            self.current.stop();
            if let Ok(mut guard) = self.playing.lock() {
                if let Some(sink) = guard.take() {
                    sink.stop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tone() -> AudioBuffer {
        let samples = (0..1600)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        AudioBuffer::new(samples, 16000, 1)
    }

    #[test]
    fn wav_survives_encode_and_decode() {
        let original = tone();
        let decoded = AudioBuffer::from_wav_bytes(&original.to_wav_bytes().unwrap()).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples.len(), original.samples.len());
        for (a, b) in decoded.samples.iter().zip(&original.samples) {
            assert!((a - b).abs() < 1e-3);
        }
        assert_eq!(decoded.duration(), Duration::from_millis(100));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = AudioBuffer::from_wav_bytes(b"definitely not a wav").unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
        assert!(err.to_string().starts_with("invalid audio"));
    }

    #[test]
    fn missing_player_is_unsupported() {
        let err = CommandSink::detect(Some("parley-no-such-player")).err().unwrap();
        assert!(matches!(err, VoiceError::UnsupportedCapability(_)));
    }

    #[tokio::test]
    async fn stop_cancels_command_playback() {
        // A slow player; the wav path lands in $0 and is ignored.
        let Ok(program) = which::which("sh") else { return };
        let sink = Arc::new(CommandSink::new(
            program,
            vec!["-c".to_string(), "sleep 5".to_string()],
        ));
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let playing = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                let on_start = move || {
                    started.fetch_add(1, Ordering::SeqCst);
                };
                sink.play(Arc::new(tone()), &cancel, &on_start).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        sink.stop();

        let outcome = tokio::time::timeout(Duration::from_secs(2), playing)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PlayOutcome::Stopped);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn player_that_fails_to_spawn_never_reports_start() {
        let sink = CommandSink::new(PathBuf::from("/nonexistent/parley-player"), Vec::new());
        let started = AtomicUsize::new(0);
        let on_start = || {
            started.fetch_add(1, Ordering::SeqCst);
        };

        let result = sink.play(Arc::new(tone()), &CancellationToken::new(), &on_start).await;
        assert!(matches!(result, Err(VoiceError::Io(_))));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
