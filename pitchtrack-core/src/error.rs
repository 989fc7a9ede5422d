//! Error types for the detection pipeline.
//!
//! None of these ever escape the real-time path: estimation failures degrade
//! to "no frequency this block" and transport failures drop the payload.

use thiserror::Error;

/// Invalid detector configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A size parameter that must be non-zero was zero.
    #[error("{name} must be greater than zero")]
    ZeroSize {
        /// Name of the offending field.
        name: &'static str,
    },

    /// The sample rate was not a positive, finite number.
    #[error("sample rate must be positive and finite, got {0}")]
    InvalidSampleRate(f32),

    /// The accepted frequency band is empty.
    #[error("frequency range is empty: min {min} Hz >= max {max} Hz")]
    EmptyFrequencyRange {
        /// Lower bound in Hz.
        min: f32,
        /// Upper bound in Hz.
        max: f32,
    },

    /// Configuration JSON could not be parsed.
    #[error("configuration JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to bring up an external pitch detector.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The backend is not available in this build.
    #[error("{0} backend not compiled in")]
    Unavailable(&'static str),

    /// The backend exists but could not be constructed.
    #[error("failed to instantiate {backend}: {reason}")]
    Instantiate {
        /// Backend name.
        backend: &'static str,
        /// Human readable cause.
        reason: String,
    },

    /// The loader thread could not be spawned or went away without answering.
    #[error("loader thread lost: {0}")]
    LoaderLost(String),
}

/// Failure of a single estimate call on an external detector.
#[derive(Debug, Clone, Error)]
pub enum EstimateError {
    /// The detector was built for a fixed window size.
    #[error("window of {got} samples does not match detector size {expected}")]
    WindowSize {
        /// Size the detector was built for.
        expected: usize,
        /// Size of the window offered.
        got: usize,
    },

    /// The backend failed internally.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A batch or message could not be handed to the other context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The bounded channel is full.
    #[error("channel full")]
    Full,
    /// The receiving side has gone away.
    #[error("channel disconnected")]
    Disconnected,
}

impl<T> From<crossbeam_channel::TrySendError<T>> for TransportError {
    fn from(err: crossbeam_channel::TrySendError<T>) -> Self {
        match err {
            crossbeam_channel::TrySendError::Full(_) => TransportError::Full,
            crossbeam_channel::TrySendError::Disconnected(_) => TransportError::Disconnected,
        }
    }
}

/// A wire message could not be decoded.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Not valid JSON or not an object of the expected shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// An `audio` message without a usable sample array.
    #[error("audio message without samples")]
    MissingAudio,
}
