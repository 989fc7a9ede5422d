//! # Worker Pipeline
//!
//! The heavier variant: the audio callback does nothing but batch samples,
//! and detection runs on a dedicated thread.
//!
//! ## Pieces
//! - [`Forwarder`]: lives in the callback, accumulates fixed-size batches and
//!   hands each one to the worker with `try_send`. A full queue drops the
//!   batch.
//! - [`DetectionWorker`]: the per-batch logic. It loads the external detector
//!   with a blocking call and answers every batch with one frequency-only
//!   analysis.
//! - [`spawn_worker`]: runs a `DetectionWorker` on its own thread and returns
//!   a [`WorkerHandle`] for talking to it and shutting it down.
//!
//! Batches are answered in arrival order. The worker never reports onsets.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::accumulator::FrameAccumulator;
use crate::adapter::{DetectorLoader, ExternalAdapter, LoadStatus};
use crate::autocorr::AutocorrEstimator;
use crate::config::DetectorConfig;
use crate::error::TransportError;
use crate::message::{Analysis, ControlMessage, OutputMessage, WorkerMessage};

/// Batches callback blocks for the worker.
#[derive(Debug)]
pub struct Forwarder {
    accumulator: FrameAccumulator,
    to_worker: Sender<WorkerMessage>,
}

impl Forwarder {
    pub fn new(batch_size: usize, to_worker: Sender<WorkerMessage>) -> Self {
        Self {
            accumulator: FrameAccumulator::new(batch_size),
            to_worker,
        }
    }

    /// Takes one callback block. Returns the number of batches it completed.
    pub fn process(&mut self, block: &[f32]) -> usize {
        let to_worker = &self.to_worker;
        self.accumulator
            .ingest(block, &mut |batch: Vec<f32>| -> Result<(), TransportError> {
                to_worker
                    .try_send(WorkerMessage::Audio(batch))
                    .map_err(TransportError::from)
            })
    }

    /// Batches the worker accepted.
    pub fn forwarded(&self) -> u64 {
        self.accumulator.delivered()
    }

    /// Batches dropped because the worker queue was full or gone.
    pub fn dropped(&self) -> u64 {
        self.accumulator.dropped()
    }
}

/// Detection state owned by the worker thread.
#[derive(Debug)]
pub struct DetectionWorker {
    config: DetectorConfig,
    adapter: ExternalAdapter,
    estimator: AutocorrEstimator,
    batches: u64,
}

impl DetectionWorker {
    pub fn new(config: DetectorConfig, loader: Arc<dyn DetectorLoader>) -> Self {
        Self {
            estimator: AutocorrEstimator::new(config.autocorr.clone(), config.batch_size),
            adapter: ExternalAdapter::new(loader),
            batches: 0,
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Batches analysed so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Loads the external detector on the calling thread.
    pub fn load(&mut self) -> LoadStatus {
        self.adapter.load_blocking()
    }

    /// Handles one message. Audio yields an analysis; a reload yields the
    /// status of the new attempt.
    pub fn handle(&mut self, message: WorkerMessage) -> Option<OutputMessage> {
        match message {
            WorkerMessage::Audio(batch) => Some(self.analyse(&batch).into()),
            WorkerMessage::Control(ControlMessage::Init { sample_rate }) => {
                self.config.set_sample_rate(sample_rate);
                debug!(sample_rate = self.config.sample_rate, "worker initialised");
                None
            }
            WorkerMessage::Control(ControlMessage::Tuning(update)) => {
                update.apply(&mut self.config);
                None
            }
            WorkerMessage::Control(ControlMessage::Reload) => Some(self.load().into()),
        }
    }

    /// External detector first, autocorrelation otherwise.
    pub fn analyse(&mut self, batch: &[f32]) -> OutputMessage {
        self.batches += 1;
        let sample_rate = self.config.sample_rate;
        let freq = self
            .adapter
            .estimate(batch, sample_rate)
            .or_else(|| self.estimator.detect(batch, sample_rate));
        OutputMessage::Analysis(Analysis::frequency_only(freq))
    }
}

/// Handle to a running worker thread. Dropping it stops the worker without
/// answering queued batches; [`finish`](Self::finish) answers them first.
#[derive(Debug)]
pub struct WorkerHandle {
    to_worker: Sender<WorkerMessage>,
    from_worker: Receiver<OutputMessage>,
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
    batch_size: usize,
}

impl WorkerHandle {
    /// A forwarder feeding this worker, for the audio callback.
    pub fn forwarder(&self) -> Forwarder {
        Forwarder::new(self.batch_size, self.to_worker.clone())
    }

    /// Queues a control message without blocking.
    pub fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        self.to_worker
            .try_send(message.into())
            .map_err(TransportError::from)
    }

    /// Output of the worker: the load status first, then one analysis per batch.
    pub fn receiver(&self) -> &Receiver<OutputMessage> {
        &self.from_worker
    }

    /// Lets the worker answer everything queued, then waits for it. Returns
    /// the output not yet received. Every [`Forwarder`] must be dropped first.
    pub fn finish(self) -> Vec<OutputMessage> {
        let WorkerHandle {
            to_worker,
            from_worker,
            shutdown_tx,
            thread_handle,
            ..
        } = self;
        drop(to_worker);
        let remaining: Vec<OutputMessage> = from_worker.iter().collect();
        drop(shutdown_tx);
        if let Some(handle) = thread_handle {
            if handle.join().is_err() {
                warn!("[WORKER] detection thread panicked");
            }
        }
        remaining
    }
}

/// Starts a detection worker on its own thread.
///
/// The thread loads the external detector first and posts the resulting
/// status, then answers batches until shut down or until every sender is
/// gone.
///
/// # Arguments
/// * `config` - Detector configuration; `batch_size` sets the batch length
/// * `loader` - Builds the external detector
/// * `queue_len` - Capacity of the inbound and outbound queues
///
/// # Returns
/// * `Ok(handle)` - Handle to the running worker
/// * `Err(e)` - The thread could not be spawned
pub fn spawn_worker(
    config: DetectorConfig,
    loader: Arc<dyn DetectorLoader>,
    queue_len: usize,
) -> std::io::Result<WorkerHandle> {
    let (to_worker, worker_rx) = crossbeam_channel::bounded::<WorkerMessage>(queue_len.max(1));
    let (worker_tx, from_worker) = crossbeam_channel::bounded::<OutputMessage>(queue_len.max(1));
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let batch_size = config.batch_size;

    let thread_handle = thread::Builder::new()
        .name("pitch-worker".to_owned())
        .spawn(move || run_worker(DetectionWorker::new(config, loader), worker_rx, worker_tx, shutdown_rx))?;

    Ok(WorkerHandle {
        to_worker,
        from_worker,
        shutdown_tx,
        thread_handle: Some(thread_handle),
        batch_size,
    })
}

fn run_worker(
    mut worker: DetectionWorker,
    inbox: Receiver<WorkerMessage>,
    outbox: Sender<OutputMessage>,
    shutdown_rx: Receiver<()>,
) {
    info!("[WORKER] loading external detector");
    let status = worker.load();
    if outbox.send(status.into()).is_err() {
        return;
    }

    loop {
        crossbeam_channel::select! {
            recv(inbox) -> msg => match msg {
                Ok(message) => {
                    if let Some(output) = worker.handle(message) {
                        if outbox.send(output).is_err() {
                            debug!("[WORKER] output channel closed");
                            break;
                        }
                    }
                }
                Err(_) => {
                    debug!("[WORKER] input channel closed");
                    break;
                }
            },
            recv(shutdown_rx) -> _ => {
                debug!("[WORKER] received shutdown signal");
                break;
            },
        }
    }
    info!(batches = worker.batches(), "[WORKER] finished");
}
