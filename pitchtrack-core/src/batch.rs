//! In-callback batch processor.
//!
//! A lighter alternative to [`PitchProcessor`](crate::processor::PitchProcessor):
//! samples are collected into fixed-size batches and each full batch is
//! analysed on its own. There is no ring buffer, no throttle and no external
//! detector. Onsets compare the batch RMS with the previous batch only.

use tracing::debug;

use crate::AnalysisResult;
use crate::accumulator::FrameAccumulator;
use crate::autocorr::{self, AutocorrEstimator};
use crate::config::DetectorConfig;
use crate::error::{ConfigError, TransportError};
use crate::message::ControlMessage;

#[derive(Debug)]
pub struct BatchProcessor {
    config: DetectorConfig,
    accumulator: FrameAccumulator,
    estimator: AutocorrEstimator,
    previous_rms: f32,
}

impl BatchProcessor {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            accumulator: FrameAccumulator::new(config.batch_size),
            estimator: AutocorrEstimator::new(config.autocorr.clone(), config.batch_size),
            previous_rms: 0.0,
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Batches analysed so far.
    pub fn batches(&self) -> u64 {
        self.accumulator.delivered()
    }

    /// Applies init and tuning messages. Reload requests are ignored, there
    /// is no external detector here.
    pub fn apply(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Init { sample_rate } => self.config.set_sample_rate(sample_rate),
            ControlMessage::Tuning(update) => update.apply(&mut self.config),
            ControlMessage::Reload => debug!("batch processor has no external detector"),
        }
    }

    /// Takes one callback block and calls `emit` once per completed batch.
    /// Every result carries the batch end time in `onset_time_secs`.
    pub fn ingest<F>(&mut self, block: &[f32], mut emit: F) -> usize
    where
        F: FnMut(AnalysisResult),
    {
        let config = &self.config;
        let estimator = &mut self.estimator;
        let previous_rms = &mut self.previous_rms;
        let mut end_frame = self.accumulator.delivered() * self.accumulator.batch_size() as u64;

        self.accumulator
            .ingest(block, &mut |batch: Vec<f32>| -> Result<(), TransportError> {
                end_frame += batch.len() as u64;
                let energy = autocorr::mean_square(&batch);
                let rms = energy.sqrt();
                let onset = rms > config.rms_gate && rms > *previous_rms * (1.0 + config.onset_threshold);
                *previous_rms = rms;

                emit(AnalysisResult {
                    frequency_hz: estimator.detect(&batch, config.sample_rate),
                    energy,
                    rms,
                    onset,
                    onset_time_secs: Some(end_frame as f64 / config.sample_rate as f64),
                });
                Ok(())
            })
    }
}
