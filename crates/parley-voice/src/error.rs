//! Error types for the Parley voice core

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while capturing, generating or synthesizing a turn
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("{0}")]
    UnsupportedCapability(String),

    /// Non-success HTTP status or network failure. `message` is already user-readable.
    #[error("{message}")]
    Transport { status: Option<u16>, message: String },

    #[error("{0}")]
    Decode(String),

    #[error("Malformed stream fragment: {0}")]
    MalformedFragment(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the turn machine to decide what reaches the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedCapability,
    TransportError,
    DecodeError,
    MalformedStreamFragment,
    CancelledOperation,
    Other,
}

impl ErrorKind {
    /// Malformed fragments and cancellations are absorbed; everything else ends the turn.
    pub fn is_user_visible(self) -> bool {
        !matches!(self, ErrorKind::MalformedStreamFragment | ErrorKind::CancelledOperation)
    }
}

impl VoiceError {
    /// Build a transport error carrying an HTTP status.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        VoiceError::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::UnsupportedCapability(_) => ErrorKind::UnsupportedCapability,
            VoiceError::Transport { .. } => ErrorKind::TransportError,
            VoiceError::Decode(_) => ErrorKind::DecodeError,
            VoiceError::MalformedFragment(_) => ErrorKind::MalformedStreamFragment,
            VoiceError::Cancelled => ErrorKind::CancelledOperation,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_user_visible(&self) -> bool {
        self.kind().is_user_visible()
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Decode(format!("invalid audio: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_and_fragments_are_absorbed() {
        assert!(!VoiceError::Cancelled.is_user_visible());
        assert!(!VoiceError::MalformedFragment("{".into()).is_user_visible());
        assert!(VoiceError::Decode("bad".into()).is_user_visible());
        assert!(VoiceError::status(500, "boom").is_user_visible());
    }

    #[test]
    fn every_kind_but_two_reaches_the_user() {
        assert!(!ErrorKind::CancelledOperation.is_user_visible());
        assert!(!ErrorKind::MalformedStreamFragment.is_user_visible());
        for kind in [
            ErrorKind::UnsupportedCapability,
            ErrorKind::TransportError,
            ErrorKind::DecodeError,
            ErrorKind::Other,
        ] {
            assert!(kind.is_user_visible(), "{:?}", kind);
        }
    }

    #[test]
    fn transport_message_is_shown_verbatim() {
        let err = VoiceError::status(503, "voice model not loaded");
        assert_eq!(err.to_string(), "voice model not loaded");
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }
}
