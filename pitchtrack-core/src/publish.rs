//! Rate limiting of analysis results towards the consumer.
//!
//! Onsets go out immediately. Everything else goes out on a fixed cadence
//! measured in sample frames, giving a steady low-rate stream of pitch and
//! energy updates. Only the latest result is ever delivered.

use crate::AnalysisResult;

/// Decides which per-block results reach the consumer.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: usize,
    frames_since_publish: usize,
}

impl Throttle {
    /// Creates a throttle publishing at least every `interval` frames. The
    /// very first block is always published.
    pub fn new(interval: usize) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            frames_since_publish: interval,
        }
    }

    /// Offers the result computed for a block of `block_len` frames. Returns
    /// it when it should be published.
    ///
    /// Onset publishes do not restart the cadence.
    pub fn offer(&mut self, result: AnalysisResult, block_len: usize) -> Option<AnalysisResult> {
        let due = self.frames_since_publish >= self.interval;
        if due {
            self.frames_since_publish = 0;
        }
        self.frames_since_publish += block_len;

        (due || result.onset).then_some(result)
    }
}
