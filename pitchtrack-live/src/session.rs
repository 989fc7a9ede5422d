//! # Analysis Session
//!
//! Builds one of the three pipelines and splits it into the part that runs
//! inside the audio callback ([`BlockCallback`]) and the part the main thread
//! keeps ([`Session`]): control input and the stream of output messages.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use pitchtrack_core::accumulator::FrameAccumulator;
use pitchtrack_core::adapter;
use pitchtrack_core::batch::BatchProcessor;
use pitchtrack_core::error::TransportError;
use pitchtrack_core::worker::{self, Forwarder, WorkerHandle};
use pitchtrack_core::{ControlMessage, DetectorConfig, OutputMessage, PitchProcessor, ProcessorHost};
use tracing::{debug, info, trace};

use crate::options::PipelineKind;

/// Capacity of the control and output channels.
const CHANNEL_CAPACITY: usize = 1024;

/// Main-thread side of a running pipeline.
pub struct Session {
    control: Option<Sender<ControlMessage>>,
    output: Receiver<OutputMessage>,
    worker: Option<WorkerHandle>,
}

/// Callback side of a running pipeline. Re-blocks whatever the audio source
/// delivers into render blocks of a fixed size.
pub struct BlockCallback {
    reblocker: FrameAccumulator,
    stage: Stage,
}

enum Stage {
    Processor(ProcessorHost),
    Worker(Forwarder),
    Simple {
        processor: BatchProcessor,
        control: Receiver<ControlMessage>,
        output: Sender<OutputMessage>,
    },
}

impl Session {
    /// Starts a pipeline for audio at `sample_rate`.
    ///
    /// # Arguments
    /// * `kind` - Which pipeline to run
    /// * `config` - Detector configuration
    /// * `sample_rate` - Rate of the audio source, sent as the init message
    /// * `block_size` - Render block length seen by the pipeline
    /// * `worker_queue` - Queue length between forwarder and worker
    pub fn start(
        kind: PipelineKind,
        config: DetectorConfig,
        sample_rate: u32,
        block_size: usize,
        worker_queue: usize,
    ) -> Result<(Session, BlockCallback)> {
        let init = ControlMessage::Init {
            sample_rate: Some(sample_rate as f64),
        };
        info!(?kind, sample_rate, block_size, "starting session");

        let (session, stage) = match kind {
            PipelineKind::Processor => {
                let (control_tx, control_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
                let (output_tx, output_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
                let mut processor =
                    PitchProcessor::new(config).context("invalid detector configuration")?;
                processor.apply(init);
                let host = ProcessorHost::new(processor, control_rx, output_tx);
                (
                    Session {
                        control: Some(control_tx),
                        output: output_rx,
                        worker: None,
                    },
                    Stage::Processor(host),
                )
            }
            PipelineKind::Worker => {
                config.validate().context("invalid detector configuration")?;
                let loader = adapter::default_loader(config.batch_size);
                let handle = worker::spawn_worker(config, loader, worker_queue)
                    .context("failed to spawn detection worker")?;
                handle
                    .send(init)
                    .context("detection worker refused init")?;
                let forwarder = handle.forwarder();
                (
                    Session {
                        control: None,
                        output: handle.receiver().clone(),
                        worker: Some(handle),
                    },
                    Stage::Worker(forwarder),
                )
            }
            PipelineKind::Simple => {
                let (control_tx, control_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
                let (output_tx, output_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
                let mut processor =
                    BatchProcessor::new(config).context("invalid detector configuration")?;
                processor.apply(init);
                (
                    Session {
                        control: Some(control_tx),
                        output: output_rx,
                        worker: None,
                    },
                    Stage::Simple {
                        processor,
                        control: control_rx,
                        output: output_tx,
                    },
                )
            }
        };

        let callback = BlockCallback {
            reblocker: FrameAccumulator::new(block_size),
            stage,
        };
        Ok((session, callback))
    }

    /// Output messages produced so far or later.
    pub fn output(&self) -> &Receiver<OutputMessage> {
        &self.output
    }

    /// Forwards a control message to the pipeline without blocking.
    pub fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        match (&self.control, &self.worker) {
            (Some(control), _) => control.try_send(message).map_err(TransportError::from),
            (None, Some(worker)) => worker.send(message),
            (None, None) => Err(TransportError::Disconnected),
        }
    }

    /// Ends the session once the callback has been dropped. Returns output
    /// still in flight.
    pub fn finish(self) -> Vec<OutputMessage> {
        match self.worker {
            Some(worker) => {
                let mut remaining: Vec<OutputMessage> = self.output.try_iter().collect();
                remaining.extend(worker.finish());
                remaining
            }
            None => self.output.try_iter().collect(),
        }
    }
}

impl BlockCallback {
    /// Takes samples from the audio source in whatever chunk size it uses.
    pub fn process(&mut self, samples: &[f32]) {
        let stage = &mut self.stage;
        self.reblocker
            .ingest(samples, &mut |block: Vec<f32>| -> Result<(), TransportError> {
                stage.process(&block);
                Ok(())
            });
    }
}

impl Stage {
    fn process(&mut self, block: &[f32]) {
        match self {
            Stage::Processor(host) => host.process(block),
            Stage::Worker(forwarder) => {
                forwarder.process(block);
            }
            Stage::Simple {
                processor,
                control,
                output,
            } => {
                while let Ok(message) = control.try_recv() {
                    debug!(?message, "control message");
                    processor.apply(message);
                }
                processor.ingest(block, |result| {
                    if let Err(err) = output.try_send(result.into()) {
                        trace!(err = %TransportError::from(err), "dropping output message");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / 44_100.0).sin())
            .collect()
    }

    fn run(kind: PipelineKind, samples: &[f32]) -> Vec<OutputMessage> {
        let (session, mut callback) =
            Session::start(kind, DetectorConfig::default(), 44_100, 128, 64).expect("session starts");
        let mut messages = Vec::new();
        // Odd chunk size so the re-blocker has work to do.
        for chunk in samples.chunks(1000) {
            callback.process(chunk);
            messages.extend(session.output().try_iter());
        }
        drop(callback);
        messages.extend(session.finish());
        messages
    }

    fn last_frequency(messages: &[OutputMessage]) -> Option<f32> {
        messages.iter().rev().find_map(|m| match m {
            OutputMessage::Analysis(analysis) => analysis.freq,
            OutputMessage::Status(_) => None,
        })
    }

    #[test]
    fn every_pipeline_reports_the_tone() {
        let samples = tone(440.0, 22_050);
        for kind in [PipelineKind::Processor, PipelineKind::Worker, PipelineKind::Simple] {
            let messages = run(kind, &samples);
            let freq = last_frequency(&messages).unwrap_or_else(|| panic!("{kind:?}: no pitch"));
            assert!((freq - 440.0).abs() < 440.0 * 0.02, "{kind:?}: got {freq}");
        }
    }

    #[test]
    fn simple_pipeline_answers_every_batch() {
        let messages = run(PipelineKind::Simple, &vec![0.0; 1024 * 5]);
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn worker_pipeline_reports_status_first() {
        let tones = [220.0, 440.0, 880.0];
        let samples: Vec<f32> = tones.iter().flat_map(|&freq| tone(freq, 1024)).collect();
        let messages = run(PipelineKind::Worker, &samples);
        assert!(matches!(messages.first(), Some(OutputMessage::Status(_))));
        let found: Vec<f32> = messages
            .iter()
            .filter_map(|m| match m {
                OutputMessage::Analysis(analysis) => analysis.freq,
                OutputMessage::Status(_) => None,
            })
            .collect();
        assert_eq!(found.len(), 3, "got {found:?}");
        for (freq, expected) in found.iter().zip(tones) {
            assert!((freq - expected).abs() < expected * 0.02, "got {found:?}");
        }
    }

    #[test]
    fn control_reaches_the_simple_pipeline() {
        let (session, mut callback) =
            Session::start(PipelineKind::Simple, DetectorConfig::default(), 44_100, 128, 64).unwrap();
        session
            .send(ControlMessage::Tuning(pitchtrack_core::TuningUpdate {
                onset_threshold: None,
                rms_gate: Some(10.0),
            }))
            .unwrap();
        let mut samples = vec![0.0; 1024];
        samples.extend(tone(440.0, 1024));
        callback.process(&samples);

        let onsets = session
            .output()
            .try_iter()
            .filter(|m| matches!(m, OutputMessage::Analysis(a) if a.onset))
            .count();
        assert_eq!(onsets, 0);
    }
}
