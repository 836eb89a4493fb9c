//! Error types for the companion runtime.

use crate::models::ArtifactKind;

/// Top-level error type.
///
/// Variants follow the component boundary that raises them so callers can
/// decide between a blocking prompt and a transient banner without string
/// matching (see [`CompanionError::presentation`]).
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Network transfer for a model artifact did not complete successfully.
    #[error("download failed for {artifact}: {message}")]
    Download {
        artifact: ArtifactKind,
        message: String,
    },

    /// A downloaded archive could not be decompressed.
    #[error("extraction failed for {artifact}: {message}")]
    Extraction {
        artifact: ArtifactKind,
        message: String,
    },

    /// An engine failed to initialise from its on-disk artifact.
    #[error("failed to load {artifact}: {message}")]
    Load {
        artifact: ArtifactKind,
        message: String,
    },

    /// Microphone access was refused.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Failure while streaming a completion.
    #[error("inference error: {0}")]
    Inference(String),

    /// Failure during speech playback.
    #[error("speech synthesis error: {0}")]
    SpeechSynthesis(String),

    /// Failure inside the speech recognizer.
    #[error("speech recognition error: {0}")]
    Recognition(String),

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// A second operation was attempted while one is already in flight.
    #[error("busy: {0}")]
    Busy(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// How an error should be surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// Requires acknowledgment before the user can continue (setup-time).
    Modal,
    /// Non-blocking notice; the turn loop keeps running.
    Banner,
    /// Logged only.
    Silent,
}

impl CompanionError {
    /// Convenience constructor for [`CompanionError::Load`].
    pub fn load(artifact: ArtifactKind, message: impl Into<String>) -> Self {
        Self::Load {
            artifact,
            message: message.into(),
        }
    }

    /// Whether the user can recover without changing device settings.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::PermissionDenied | Self::Config(_))
    }

    /// Map the error to a presentation style.
    pub fn presentation(&self) -> Presentation {
        match self {
            Self::Download { .. }
            | Self::Extraction { .. }
            | Self::Load { .. }
            | Self::PermissionDenied
            | Self::Config(_) => Presentation::Modal,
            Self::Inference(_)
            | Self::SpeechSynthesis(_)
            | Self::Recognition(_)
            | Self::Store(_) => Presentation::Banner,
            Self::Busy(_) | Self::Io(_) | Self::Channel(_) => Presentation::Silent,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CompanionError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn setup_errors_are_modal() {
        let err = CompanionError::Download {
            artifact: ArtifactKind::Tts,
            message: "HTTP 404".into(),
        };
        assert_eq!(err.presentation(), Presentation::Modal);
        assert!(err.is_recoverable());
        assert_eq!(
            CompanionError::PermissionDenied.presentation(),
            Presentation::Modal
        );
        assert!(!CompanionError::PermissionDenied.is_recoverable());
    }

    #[test]
    fn runtime_errors_are_banners() {
        assert_eq!(
            CompanionError::Inference("boom".into()).presentation(),
            Presentation::Banner
        );
        assert_eq!(
            CompanionError::SpeechSynthesis("no device".into()).presentation(),
            Presentation::Banner
        );
    }

    #[test]
    fn display_names_the_artifact() {
        let err = CompanionError::load(ArtifactKind::Llm, "bad magic");
        assert_eq!(err.to_string(), "failed to load language model: bad magic");
    }
}
