//! # Detector Configuration
//!
//! All tunables of the pipeline live in [`DetectorConfig`]. The defaults are
//! the empirical constants the detector was tuned with on recorded practice
//! audio; they are defaults, not invariants.
//!
//! Configuration is supplied once at construction and can be changed at run
//! time through [`TuningUpdate`] and [`DetectorConfig::set_sample_rate`]. The
//! processor applies such changes between blocks only.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sample rate assumed when none (or an unusable one) is supplied.
pub const DEFAULT_SAMPLE_RATE: f32 = 44_100.0;

/// Size of one render quantum delivered by the audio callback.
pub const RENDER_QUANTUM: usize = 128;

/// Parameters of the lag-domain autocorrelation estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutocorrParams {
    /// Windows with an RMS below this are treated as silence.
    pub silence_threshold: f32,
    /// Amplitude below which a sample counts as a trim point at the window edges.
    pub trim_threshold: f32,
    /// Smallest trimmed slice that is still analysed.
    pub min_slice_len: usize,
    /// Lowest accepted frequency in Hz.
    pub min_frequency: f32,
    /// Highest accepted frequency in Hz.
    pub max_frequency: f32,
}

impl Default for AutocorrParams {
    fn default() -> Self {
        Self {
            silence_threshold: 0.01,
            trim_threshold: 0.2,
            min_slice_len: 16,
            min_frequency: 50.0,
            max_frequency: 20_000.0,
        }
    }
}

/// Parameters of the energy-ratio onset detector besides threshold and gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OnsetParams {
    /// Number of per-block energies averaged.
    pub history_len: usize,
    /// Minimum time between two onsets in seconds.
    pub refractory_secs: f32,
    /// Number of past onset times kept for diagnostics.
    pub onset_history_len: usize,
}

impl Default for OnsetParams {
    fn default() -> Self {
        Self {
            history_len: 8,
            refractory_secs: 0.05,
            onset_history_len: 64,
        }
    }
}

/// Complete detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Sample rate of the incoming audio in Hz.
    pub sample_rate: f32,
    /// Relative rise of the latest block energy over the rolling average
    /// needed to flag an onset.
    pub onset_threshold: f32,
    /// Minimum block RMS for a block to count as signal.
    pub rms_gate: f32,
    /// Capacity of the analysis ring buffer.
    pub ring_size: usize,
    /// Batch size of the frame accumulator (worker and batch variants).
    pub batch_size: usize,
    /// Cadence of non-onset publishes, in sample frames.
    pub publish_interval: usize,
    /// Autocorrelation estimator parameters.
    pub autocorr: AutocorrParams,
    /// Onset detector parameters.
    pub onset: OnsetParams,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            onset_threshold: 0.15,
            rms_gate: 0.001,
            ring_size: 2048,
            batch_size: 1024,
            publish_interval: RENDER_QUANTUM * 4,
            autocorr: AutocorrParams::default(),
            onset: OnsetParams::default(),
        }
    }
}

impl DetectorConfig {
    /// Default configuration at the given sample rate.
    pub fn with_sample_rate(sample_rate: f32) -> Self {
        let mut config = Self::default();
        config.set_sample_rate(Some(sample_rate as f64));
        config
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: DetectorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty-printed JSON form, suitable for saving next to a session.
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks the structural parameters. Threshold and gate are not
    /// constrained, any finite value is accepted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        let sizes = [
            ("ringSize", self.ring_size),
            ("batchSize", self.batch_size),
            ("publishInterval", self.publish_interval),
            ("onset.historyLen", self.onset.history_len),
            ("onset.onsetHistoryLen", self.onset.onset_history_len),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::ZeroSize { name });
            }
        }
        if self.autocorr.min_frequency >= self.autocorr.max_frequency {
            return Err(ConfigError::EmptyFrequencyRange {
                min: self.autocorr.min_frequency,
                max: self.autocorr.max_frequency,
            });
        }
        Ok(())
    }

    /// Applies the sample rate from an init message. Missing, zero or
    /// otherwise unusable values select [`DEFAULT_SAMPLE_RATE`].
    pub fn set_sample_rate(&mut self, sample_rate: Option<f64>) {
        self.sample_rate = match sample_rate {
            Some(rate) if rate.is_finite() && rate > 0.0 => rate as f32,
            _ => DEFAULT_SAMPLE_RATE,
        };
    }

    /// Minimum number of frames between two onsets at the current sample rate.
    pub fn refractory_frames(&self) -> u64 {
        (self.onset.refractory_secs * self.sample_rate).round().max(0.0) as u64
    }
}

/// Runtime adjustment of the onset parameters. Absent fields keep the
/// current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningUpdate {
    /// New onset threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset_threshold: Option<f32>,
    /// New RMS gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms_gate: Option<f32>,
}

impl TuningUpdate {
    /// True when the update carries no field at all.
    pub fn is_empty(&self) -> bool {
        self.onset_threshold.is_none() && self.rms_gate.is_none()
    }

    /// Writes the present, finite fields into `config`.
    pub fn apply(&self, config: &mut DetectorConfig) {
        if let Some(threshold) = self.onset_threshold.filter(|v| v.is_finite()) {
            config.onset_threshold = threshold;
        }
        if let Some(gate) = self.rms_gate.filter(|v| v.is_finite()) {
            config.rms_gate = gate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tuning_update_is_a_no_op() {
        let mut config = DetectorConfig::default();
        config.onset_threshold = 0.3;
        config.rms_gate = 0.02;
        let before = config.clone();

        let update = TuningUpdate::default();
        assert!(update.is_empty());
        update.apply(&mut config);

        assert_eq!(config, before);
    }

    #[test]
    fn partial_tuning_update_keeps_other_field() {
        let mut config = DetectorConfig::default();
        TuningUpdate {
            onset_threshold: Some(0.5),
            rms_gate: None,
        }
        .apply(&mut config);

        assert_eq!(config.onset_threshold, 0.5);
        assert_eq!(config.rms_gate, 0.001);
    }

    #[test]
    fn non_finite_tuning_values_are_ignored() {
        let mut config = DetectorConfig::default();
        TuningUpdate {
            onset_threshold: Some(f32::NAN),
            rms_gate: Some(f32::INFINITY),
        }
        .apply(&mut config);

        assert_eq!(config.onset_threshold, 0.15);
        assert_eq!(config.rms_gate, 0.001);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = DetectorConfig::from_json(r#"{ "sampleRate": 48000, "onset": { "historyLen": 4 } }"#)
            .expect("valid config");

        assert_eq!(config.sample_rate, 48_000.0);
        assert_eq!(config.onset.history_len, 4);
        assert_eq!(config.onset.refractory_secs, 0.05);
        assert_eq!(config.ring_size, 2048);
        assert_eq!(config.autocorr, AutocorrParams::default());
    }

    #[test]
    fn json_round_trip_preserves_config() {
        let mut config = DetectorConfig::with_sample_rate(48_000.0);
        config.publish_interval = 256;
        let json = config.to_json_pretty().expect("serializable");
        assert_eq!(DetectorConfig::from_json(&json).expect("parses"), config);
    }

    #[test]
    fn validate_rejects_zero_ring() {
        let config = DetectorConfig {
            ring_size: 0,
            ..DetectorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSize { name: "ringSize" })
        ));
    }

    #[test]
    fn validate_rejects_inverted_frequency_range() {
        let mut config = DetectorConfig::default();
        config.autocorr.min_frequency = 1000.0;
        config.autocorr.max_frequency = 100.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyFrequencyRange { .. })
        ));
    }

    #[test]
    fn unusable_sample_rate_falls_back_to_default() {
        let mut config = DetectorConfig::default();
        config.set_sample_rate(Some(0.0));
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        config.set_sample_rate(None);
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        config.set_sample_rate(Some(48_000.0));
        assert_eq!(config.sample_rate, 48_000.0);
    }

    #[test]
    fn refractory_frames_follow_sample_rate() {
        assert_eq!(DetectorConfig::with_sample_rate(44_100.0).refractory_frames(), 2205);
        assert_eq!(DetectorConfig::with_sample_rate(48_000.0).refractory_frames(), 2400);
    }
}
