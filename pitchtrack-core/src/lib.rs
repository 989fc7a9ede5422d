// pitchtrack-core/src/lib.rs

//! The core logic of the real-time pitch tracker.
//! This crate is responsible for pitch estimation, onset detection and
//! throttled delivery of results. It is completely headless: it opens no
//! audio devices and installs no logging subscriber.
//!
//! Two pipeline variants are provided:
//! - [`processor::PitchProcessor`], which runs inside the audio callback and
//!   analyses a ring-buffered window after every render block, and
//! - the [`worker`] variant, where the callback only forwards fixed-size
//!   batches to a detection thread.
//!
//! [`batch::BatchProcessor`] is a lighter in-callback variant that analyses
//! each accumulated batch directly.

pub mod accumulator;
pub mod adapter;
pub mod autocorr;
pub mod batch;
pub mod config;
pub mod error;
pub mod message;
pub mod onset;
pub mod processor;
pub mod publish;
pub mod ring;
pub mod worker;

pub use adapter::{DetectorLoader, ExternalAdapter, LoadStatus, PitchDetector};
pub use config::{DetectorConfig, TuningUpdate};
pub use message::{ControlMessage, OutputMessage, WorkerMessage};
pub use processor::{PitchProcessor, ProcessorHost};

/// Result of analysing one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisResult {
    /// Estimated fundamental frequency in Hz, `None` for silence or no pitch.
    pub frequency_hz: Option<f32>,
    /// Mean square of the block.
    pub energy: f32,
    /// Root-mean-square of the block.
    pub rms: f32,
    /// Whether this block started a new note.
    pub onset: bool,
    /// Onset time in seconds since the session started. Set together with
    /// `onset` by the ring-buffer processor; the batch processor stamps every
    /// result with its batch end time.
    pub onset_time_secs: Option<f64>,
}
