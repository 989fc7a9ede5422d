//! # In-Callback Pitch Processor
//!
//! [`PitchProcessor`] is the whole pipeline for one audio session, meant to
//! be driven from the audio callback:
//!
//! block → ring buffer → {estimator, onset detector} → throttle → consumer
//!
//! Configuration changes and reload requests are applied between blocks via
//! [`PitchProcessor::apply`]. [`ProcessorHost`] wires a processor to
//! channels: it drains control messages at the start of each block and posts
//! results without ever blocking.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace};

use crate::AnalysisResult;
use crate::adapter::{self, DetectorLoader, ExternalAdapter, LoadStatus};
use crate::autocorr::{self, AutocorrEstimator};
use crate::config::DetectorConfig;
use crate::error::{ConfigError, TransportError};
use crate::message::{ControlMessage, OutputMessage};
use crate::onset::OnsetDetector;
use crate::publish::Throttle;
use crate::ring::RingBuffer;

/// Stateful pitch and onset detector for one audio session.
#[derive(Debug)]
pub struct PitchProcessor {
    config: DetectorConfig,
    ring: RingBuffer,
    window: Vec<f32>,
    estimator: AutocorrEstimator,
    onset: OnsetDetector,
    throttle: Throttle,
    adapter: ExternalAdapter,
    pending_spawn_failure: Option<LoadStatus>,
    frames_processed: u64,
    failed_blocks: u64,
}

impl PitchProcessor {
    /// Creates a processor with the default external detector loader and
    /// starts loading it in the background.
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        let loader = adapter::default_loader(config.ring_size);
        Self::with_loader(config, loader)
    }

    /// Creates a processor with the given loader and starts loading it in
    /// the background. The loader thread is created here, so later reloads
    /// from the audio callback never spawn one.
    pub fn with_loader(
        config: DetectorConfig,
        loader: Arc<dyn DetectorLoader>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut processor = Self {
            ring: RingBuffer::new(config.ring_size),
            window: vec![0.0; config.ring_size],
            estimator: AutocorrEstimator::new(config.autocorr.clone(), config.ring_size),
            onset: OnsetDetector::new(&config),
            throttle: Throttle::new(config.publish_interval),
            adapter: ExternalAdapter::with_background_loader(loader),
            pending_spawn_failure: None,
            frames_processed: 0,
            failed_blocks: 0,
            config,
        };
        processor.pending_spawn_failure = processor.adapter.start_loading();
        Ok(processor)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Total frames ingested so far.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Blocks whose estimation panicked and produced no frequency.
    pub fn failed_blocks(&self) -> u64 {
        self.failed_blocks
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn adapter(&self) -> &ExternalAdapter {
        &self.adapter
    }

    /// Recent onset times in seconds, oldest first.
    pub fn onset_times(&self) -> impl Iterator<Item = f64> + '_ {
        self.onset.onset_times()
    }

    /// Applies a control message. Returns a status if applying it settled a
    /// load attempt immediately.
    pub fn apply(&mut self, message: ControlMessage) -> Option<LoadStatus> {
        match message {
            ControlMessage::Init { sample_rate } => {
                self.config.set_sample_rate(sample_rate);
                debug!(sample_rate = self.config.sample_rate, "processor initialised");
                None
            }
            ControlMessage::Tuning(update) => {
                update.apply(&mut self.config);
                debug!(
                    onset_threshold = self.config.onset_threshold,
                    rms_gate = self.config.rms_gate,
                    "tuning applied"
                );
                None
            }
            ControlMessage::Reload => self.adapter.start_loading(),
        }
    }

    /// Non-blocking check for the outcome of a pending load attempt. Each
    /// attempt reports once.
    pub fn poll_status(&mut self) -> Option<LoadStatus> {
        self.pending_spawn_failure
            .take()
            .or_else(|| self.adapter.poll())
    }

    /// Analyses one render block. Returns the result when the throttle lets
    /// it through. Empty blocks are ignored.
    pub fn ingest(&mut self, block: &[f32]) -> Option<AnalysisResult> {
        if block.is_empty() {
            return None;
        }

        let energy = autocorr::mean_square(block);
        let rms = energy.sqrt();
        self.ring.write(block);

        let now_frame = self.frames_processed + block.len() as u64;
        let onset = self.onset.observe(energy, rms, now_frame, &self.config);

        let frequency_hz = match panic::catch_unwind(AssertUnwindSafe(|| self.estimate(block))) {
            Ok(freq) => freq,
            Err(_) => {
                self.failed_blocks += 1;
                trace!("estimation panicked, no result this block");
                None
            }
        };

        let result = AnalysisResult {
            frequency_hz,
            energy,
            rms,
            onset: onset.is_some(),
            onset_time_secs: onset.map(|o| o.time_secs),
        };

        let published = self.throttle.offer(result, block.len());
        self.frames_processed = now_frame;
        published
    }

    /// Full ring window once available, the raw block before that. The
    /// external detector gets first try.
    fn estimate(&mut self, block: &[f32]) -> Option<f32> {
        let sample_rate = self.config.sample_rate;
        let window: &[f32] = if self.ring.is_full() {
            self.ring.snapshot_into(&mut self.window);
            &self.window
        } else {
            block
        };
        self.adapter
            .estimate(window, sample_rate)
            .or_else(|| self.estimator.detect(window, sample_rate))
    }
}

/// A processor bound to its message channels.
///
/// Control messages are drained at the start of every block so they take
/// effect between blocks. Output goes through `try_send`; when the consumer
/// falls behind, messages are dropped rather than stalling the callback.
#[derive(Debug)]
pub struct ProcessorHost {
    processor: PitchProcessor,
    control: Receiver<ControlMessage>,
    output: Sender<OutputMessage>,
    dropped: u64,
}

impl ProcessorHost {
    pub fn new(
        processor: PitchProcessor,
        control: Receiver<ControlMessage>,
        output: Sender<OutputMessage>,
    ) -> Self {
        Self {
            processor,
            control,
            output,
            dropped: 0,
        }
    }

    pub fn processor(&self) -> &PitchProcessor {
        &self.processor
    }

    /// Messages the output channel refused.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Runs one block through the processor.
    pub fn process(&mut self, block: &[f32]) {
        while let Ok(message) = self.control.try_recv() {
            if let Some(status) = self.processor.apply(message) {
                self.post(status.into());
            }
        }
        if let Some(status) = self.processor.poll_status() {
            self.post(status.into());
        }
        if let Some(result) = self.processor.ingest(block) {
            self.post(result.into());
        }
    }

    fn post(&mut self, message: OutputMessage) {
        if let Err(err) = self.output.try_send(message) {
            self.dropped += 1;
            trace!(err = %TransportError::from(err), "dropping output message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::adapter::UnavailableLoader;
    use crate::config::TuningUpdate;

    fn processor() -> PitchProcessor {
        PitchProcessor::with_loader(
            DetectorConfig::default(),
            Arc::new(UnavailableLoader("none")),
        )
        .expect("valid config")
    }

    #[test]
    fn rejects_invalid_config() {
        let config = DetectorConfig {
            batch_size: 0,
            ..DetectorConfig::default()
        };
        assert!(PitchProcessor::with_loader(config, Arc::new(UnavailableLoader("none"))).is_err());
    }

    #[test]
    fn silence_publishes_null_frequency() {
        let mut processor = processor();
        let result = processor.ingest(&[0.0; 128]).expect("first block publishes");
        assert_eq!(result.frequency_hz, None);
        assert!(!result.onset);
        assert_eq!(result.rms, 0.0);
    }

    #[test]
    fn empty_block_is_ignored() {
        let mut processor = processor();
        assert!(processor.ingest(&[]).is_none());
        assert_eq!(processor.frames_processed(), 0);
    }

    #[test]
    fn tuning_is_applied_between_blocks() {
        let mut processor = processor();
        processor.apply(ControlMessage::Tuning(TuningUpdate {
            onset_threshold: Some(0.4),
            rms_gate: None,
        }));
        assert_eq!(processor.config().onset_threshold, 0.4);
        assert_eq!(processor.config().rms_gate, 0.001);

        processor.apply(ControlMessage::Tuning(TuningUpdate::default()));
        assert_eq!(processor.config().onset_threshold, 0.4);
        assert_eq!(processor.config().rms_gate, 0.001);
    }

    #[test]
    fn init_sets_sample_rate() {
        let mut processor = processor();
        processor.apply(ControlMessage::Init {
            sample_rate: Some(48_000.0),
        });
        assert_eq!(processor.config().sample_rate, 48_000.0);
    }

    #[test]
    fn host_drains_control_before_block() {
        let (control_tx, control_rx) = crossbeam_channel::bounded(8);
        let (output_tx, output_rx) = crossbeam_channel::bounded(8);
        let mut host = ProcessorHost::new(processor(), control_rx, output_tx);

        control_tx
            .send(ControlMessage::Tuning(TuningUpdate {
                onset_threshold: None,
                rms_gate: Some(0.5),
            }))
            .unwrap();
        host.process(&[0.0; 128]);

        assert_eq!(host.processor().config().rms_gate, 0.5);
        let analyses = output_rx
            .try_iter()
            .filter(|m| matches!(m, OutputMessage::Analysis(_)))
            .count();
        assert_eq!(analyses, 1);
    }

    #[test]
    fn host_drops_output_when_consumer_is_full() {
        let (_control_tx, control_rx) = crossbeam_channel::bounded(1);
        let (output_tx, _output_rx) = crossbeam_channel::bounded(1);
        let mut host = ProcessorHost::new(processor(), control_rx, output_tx);

        for _ in 0..16 {
            host.process(&[0.0; 128]);
        }
        assert!(host.dropped() > 0);
    }

    fn statuses_until_answered(
        host: &mut ProcessorHost,
        output: &Receiver<OutputMessage>,
    ) -> Vec<LoadStatus> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            host.process(&[0.0; 128]);
            let statuses: Vec<LoadStatus> = output
                .try_iter()
                .filter_map(|m| match m {
                    OutputMessage::Status(status) => Some(status),
                    OutputMessage::Analysis(_) => None,
                })
                .collect();
            if !statuses.is_empty() {
                return statuses;
            }
            assert!(Instant::now() < deadline, "load never answered");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn reloads_are_answered_between_blocks() {
        let (control_tx, control_rx) = crossbeam_channel::bounded(8);
        let (output_tx, output_rx) = crossbeam_channel::bounded(64);
        let mut host = ProcessorHost::new(processor(), control_rx, output_tx);
        assert_eq!(statuses_until_answered(&mut host, &output_rx).len(), 1);

        for _ in 0..3 {
            control_tx.send(ControlMessage::Reload).unwrap();
            let statuses = statuses_until_answered(&mut host, &output_rx);
            assert_eq!(statuses.len(), 1);
            assert!(!statuses[0].ok);
        }
        assert_eq!(host.processor().adapter().attempts(), 4);
    }
}
