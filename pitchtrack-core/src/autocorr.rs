//! # Autocorrelation Pitch Estimator
//!
//! Lag-domain peak picking on the unnormalised autocorrelation of a trimmed
//! window. The steps are:
//!
//! 1. RMS gate: quiet windows are silence, not errors.
//! 2. Edge trim: skip leading and trailing samples until the signal first
//!    drops below the trim threshold, which cuts transients at the window
//!    boundaries.
//! 3. Autocorrelation over every lag of the trimmed slice.
//! 4. Walk past the zero-lag peak to the first local minimum, then take the
//!    largest value from there on as the period.
//! 5. Convert to Hz and reject anything outside the plausible range.
//!
//! The cost is O(n²) in the window length. Noisy input yields `None` rather
//! than a made-up frequency.

use crate::config::AutocorrParams;

/// Root-mean-square of a block of samples. Empty input has zero RMS.
pub fn rms(samples: &[f32]) -> f32 {
    mean_square(samples).sqrt()
}

/// Mean of the squared samples, the per-block energy used by the onset
/// detector. Empty input has zero energy.
pub fn mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64) as f32
}

/// Autocorrelation estimator with a reusable correlation buffer, so repeated
/// calls with the same window size do not allocate.
#[derive(Debug, Clone)]
pub struct AutocorrEstimator {
    params: AutocorrParams,
    correlation: Vec<f64>,
}

impl AutocorrEstimator {
    /// Creates an estimator, reserving room for windows up to `max_window`.
    pub fn new(params: AutocorrParams, max_window: usize) -> Self {
        Self {
            params,
            correlation: Vec::with_capacity(max_window),
        }
    }

    /// Estimates the fundamental frequency of `window` in Hz.
    pub fn detect(&mut self, window: &[f32], sample_rate: f32) -> Option<f32> {
        let size = window.len();
        if size == 0 || rms(window) < self.params.silence_threshold {
            return None;
        }

        let (r1, r2) = trim_points(window, self.params.trim_threshold);
        if r2 <= r1 || r2 - r1 < self.params.min_slice_len {
            return None;
        }
        let slice = &window[r1..r2];
        let n = slice.len();

        self.correlation.clear();
        self.correlation.extend((0..n).map(|lag| {
            slice[..n - lag]
                .iter()
                .zip(&slice[lag..])
                .map(|(&a, &b)| a as f64 * b as f64)
                .sum::<f64>()
        }));
        let c = &self.correlation;

        // Skip the zero-lag peak and its decay.
        let mut d = 0;
        while d + 1 < n && c[d] > c[d + 1] {
            d += 1;
        }

        let mut max_value = -1.0;
        let mut period = None;
        for (lag, &value) in c.iter().enumerate().skip(d) {
            if value > max_value {
                max_value = value;
                period = Some(lag);
            }
        }

        let period = period.filter(|&lag| lag > 0)?;
        let frequency = sample_rate / period as f32;
        if frequency > self.params.max_frequency || frequency < self.params.min_frequency {
            return None;
        }
        Some(frequency)
    }
}

/// Finds the trimmed range `[r1, r2)` of a window. Each edge is searched
/// over the first (last) half only; when no quiet sample is found there the
/// default edge is kept (`0` and `size - 1`).
fn trim_points(window: &[f32], threshold: f32) -> (usize, usize) {
    let size = window.len();
    let half = size.div_ceil(2);

    let r1 = window[..half]
        .iter()
        .position(|s| s.abs() < threshold)
        .unwrap_or(0);
    let r2 = (1..half)
        .find(|&i| window[size - i].abs() < threshold)
        .map_or(size - 1, |i| size - i);

    (r1, r2)
}
