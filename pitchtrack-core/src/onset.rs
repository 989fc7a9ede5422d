//! # Onset Detection
//!
//! Adaptive-threshold onset detector on per-block energy. A block starts a
//! new note when it is above the RMS gate, its energy exceeds the rolling
//! average of recent blocks by the onset threshold, and the refractory period
//! since the previous onset has passed.
//!
//! This is deliberately simple: sustained tones and very soft attacks can go
//! unnoticed. It is not a spectral-flux detector.

use std::collections::VecDeque;

use crate::config::DetectorConfig;

/// Bounded FIFO of recent block energies.
#[derive(Debug, Clone)]
pub struct EnergyHistory {
    values: VecDeque<f32>,
    max_len: usize,
}

impl EnergyHistory {
    /// Creates an empty history holding at most `max_len` values (at least one).
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            values: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    /// Appends a value, evicting the oldest one on overflow.
    pub fn push(&mut self, energy: f32) {
        self.values.push_back(energy);
        while self.values.len() > self.max_len {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<f32> {
        self.values.back().copied()
    }

    /// Mean of the stored values, zero when empty.
    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }
}

/// A detected onset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Onset {
    /// Absolute frame index of the onset (end of the triggering block).
    pub frame: u64,
    /// `frame / sample_rate`.
    pub time_secs: f64,
}

/// Energy-ratio onset detector with refractory period.
#[derive(Debug, Clone)]
pub struct OnsetDetector {
    history: EnergyHistory,
    last_onset_frame: Option<u64>,
    onsets: VecDeque<f64>,
    onset_history_len: usize,
}

impl OnsetDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        let onset_history_len = config.onset.onset_history_len.max(1);
        Self {
            history: EnergyHistory::new(config.onset.history_len),
            last_onset_frame: None,
            onsets: VecDeque::with_capacity(onset_history_len),
            onset_history_len,
        }
    }

    /// Feeds the energy and RMS of one block. `frame` is the absolute frame
    /// count after the block.
    pub fn observe(
        &mut self,
        energy: f32,
        rms: f32,
        frame: u64,
        config: &DetectorConfig,
    ) -> Option<Onset> {
        self.history.push(energy);
        let average = self.history.average();
        let last = self.history.last().unwrap_or(energy);

        if rms < config.rms_gate || last <= average * (1.0 + config.onset_threshold) {
            return None;
        }

        let refractory = config.refractory_frames();
        if let Some(previous) = self.last_onset_frame {
            if frame.saturating_sub(previous) <= refractory {
                return None;
            }
        }

        self.last_onset_frame = Some(frame);
        let time_secs = frame as f64 / config.sample_rate as f64;
        self.onsets.push_back(time_secs);
        while self.onsets.len() > self.onset_history_len {
            self.onsets.pop_front();
        }
        Some(Onset { frame, time_secs })
    }

    pub fn last_onset_frame(&self) -> Option<u64> {
        self.last_onset_frame
    }

    /// Recent onset times in seconds, oldest first.
    pub fn onset_times(&self) -> impl Iterator<Item = f64> + '_ {
        self.onsets.iter().copied()
    }

    pub fn history(&self) -> &EnergyHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u64 = 128;

    /// Drives the detector with one energy per block, returning the block
    /// indices that produced an onset.
    fn run(energies: &[f32], config: &DetectorConfig) -> Vec<usize> {
        let mut detector = OnsetDetector::new(config);
        energies
            .iter()
            .enumerate()
            .filter_map(|(block, &energy)| {
                let frame = (block as u64 + 1) * BLOCK;
                detector
                    .observe(energy, energy.sqrt(), frame, config)
                    .map(|_| block)
            })
            .collect()
    }

    #[test]
    fn history_is_bounded() {
        let mut history = EnergyHistory::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            history.push(value);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.average(), 3.0);
        assert_eq!(history.last(), Some(4.0));
    }

    #[test]
    fn silence_never_triggers() {
        let config = DetectorConfig::default();
        assert!(run(&[0.0; 100], &config).is_empty());
    }

    #[test]
    fn spikes_inside_refractory_window_trigger_once() {
        let config = DetectorConfig::default();
        // 2205 frames of refractory period is a little over 17 blocks.
        let mut energies = vec![0.0; 40];
        energies[10] = 0.25;
        energies[15] = 0.25;
        assert_eq!(run(&energies, &config), vec![10]);
    }

    #[test]
    fn spikes_outside_refractory_window_trigger_twice() {
        let config = DetectorConfig::default();
        let mut energies = vec![0.0; 60];
        energies[10] = 0.25;
        energies[40] = 0.25;
        assert_eq!(run(&energies, &config), vec![10, 40]);
    }

    #[test]
    fn refractory_boundary_is_exclusive() {
        let config = DetectorConfig::default();
        let mut detector = OnsetDetector::new(&config);
        detector.observe(0.0, 0.0, 872, &config);
        assert!(detector.observe(0.25, 0.5, 1000, &config).is_some());
        for frame in [1100, 1200] {
            detector.observe(0.0, 0.0, frame, &config);
        }
        // Exactly 2205 frames later is still inside the refractory period.
        assert!(detector.observe(0.25, 0.5, 1000 + 2205, &config).is_none());
        assert!(detector.observe(0.0, 0.0, 3300, &config).is_none());
        assert!(detector.observe(0.25, 0.5, 3400, &config).is_some());
    }

    #[test]
    fn quiet_blocks_below_gate_do_not_trigger() {
        let mut config = DetectorConfig::default();
        config.rms_gate = 0.1;
        let mut energies = vec![0.0; 20];
        // RMS 0.05 stays below the gate even though it is a clear rise.
        energies[5] = 0.0025;
        assert!(run(&energies, &config).is_empty());
    }

    #[test]
    fn sustained_tone_triggers_only_at_start() {
        let config = DetectorConfig::default();
        let mut energies = vec![0.0; 8];
        energies.extend(std::iter::repeat(0.2).take(100));
        assert_eq!(run(&energies, &config), vec![8]);
    }

    #[test]
    fn onset_time_and_history() {
        let config = DetectorConfig::default();
        let mut detector = OnsetDetector::new(&config);
        detector.observe(0.0, 0.0, 43_972, &config);
        let onset = detector.observe(0.25, 0.5, 44_100, &config).expect("onset");
        assert_eq!(onset.frame, 44_100);
        assert!((onset.time_secs - 1.0).abs() < 1e-9);
        assert_eq!(detector.onset_times().collect::<Vec<_>>(), vec![onset.time_secs]);
        assert_eq!(detector.last_onset_frame(), Some(44_100));
    }

    #[test]
    fn onset_history_is_bounded() {
        let mut config = DetectorConfig::default();
        config.onset.onset_history_len = 2;
        let mut detector = OnsetDetector::new(&config);
        let mut frame = 0;
        for _ in 0..5 {
            frame += 10_000;
            detector.observe(0.0, 0.0, frame - 128, &config);
            detector.observe(0.25, 0.5, frame, &config);
        }
        assert_eq!(detector.onset_times().count(), 2);
    }
}
