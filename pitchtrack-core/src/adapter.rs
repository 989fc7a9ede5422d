//! # External Detector Adapter
//!
//! Delegates estimation to a more accurate pitch detector when one can be
//! brought up, without ever holding up sample processing.
//!
//! A [`DetectorLoader`] builds a boxed [`PitchDetector`]. The adapter runs the
//! loader on one long-lived background thread, created with the adapter, and
//! picks the outcome up with a non-blocking [`ExternalAdapter::poll`] between
//! blocks. Requesting or polling an attempt never spawns a thread. Every
//! attempt that is not superseded yields exactly one [`LoadStatus`]. Until a
//! detector is ready, and for every window it fails on, callers use the
//! built-in autocorrelation estimator.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::autocorr::AutocorrEstimator;
use crate::error::{EstimateError, LoadError};

/// Capability interface of any pitch estimator.
pub trait PitchDetector: Send {
    /// Estimates the fundamental frequency of `window` in Hz. `Ok(None)`
    /// means no pitch was found.
    fn estimate(&mut self, window: &[f32], sample_rate: f32) -> Result<Option<f32>, EstimateError>;
}

impl PitchDetector for AutocorrEstimator {
    fn estimate(&mut self, window: &[f32], sample_rate: f32) -> Result<Option<f32>, EstimateError> {
        Ok(self.detect(window, sample_rate))
    }
}

/// Builds an external detector. Loading may block; it never runs on the
/// audio thread.
pub trait DetectorLoader: Send + Sync {
    /// Short backend name used in status reports.
    fn name(&self) -> &'static str;

    fn load(&self) -> Result<Box<dyn PitchDetector>, LoadError>;
}

/// Outcome of one load attempt, reported to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStatus {
    pub backend: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadStatus {
    fn from_outcome(backend: &str, outcome: &Result<Box<dyn PitchDetector>, LoadError>) -> Self {
        Self {
            backend: backend.to_owned(),
            ok: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        }
    }
}

type LoadOutcome = Result<Box<dyn PitchDetector>, LoadError>;

/// Runs the loader, turning a panic into a failed attempt.
fn guarded_load(loader: &dyn DetectorLoader) -> LoadOutcome {
    panic::catch_unwind(AssertUnwindSafe(|| loader.load())).unwrap_or_else(|_| {
        Err(LoadError::Instantiate {
            backend: loader.name(),
            reason: "loader panicked".to_owned(),
        })
    })
}

/// The long-lived thread that runs load attempts for one adapter. A wake-up
/// loads for the latest attempt number; wake-ups that arrive while one is
/// already queued are coalesced.
struct LoaderThread {
    wake: Sender<()>,
    latest: Arc<AtomicU64>,
    answers: Receiver<(u64, LoadOutcome)>,
}

impl LoaderThread {
    fn spawn(loader: Arc<dyn DetectorLoader>) -> std::io::Result<Self> {
        let (wake, wake_rx) = crossbeam_channel::bounded::<()>(1);
        let (answer_tx, answers) = crossbeam_channel::bounded(1);
        let latest = Arc::new(AtomicU64::new(0));
        let requested = Arc::clone(&latest);
        let backend = loader.name();

        thread::Builder::new()
            .name(format!("{backend}-loader"))
            .spawn(move || {
                for () in wake_rx.iter() {
                    let attempt = requested.load(Ordering::Acquire);
                    debug!(backend, attempt, "loading external pitch detector");
                    if answer_tx.send((attempt, guarded_load(loader.as_ref()))).is_err() {
                        break;
                    }
                }
                trace!(backend, "loader thread exiting");
            })?;

        Ok(Self {
            wake,
            latest,
            answers,
        })
    }
}

/// Holds the external detector, or the attempt to get one.
pub struct ExternalAdapter {
    loader: Arc<dyn DetectorLoader>,
    detector: Option<Box<dyn PitchDetector>>,
    background: Result<LoaderThread, String>,
    awaiting: Option<u64>,
    attempts: u64,
    failed_windows: u64,
}

impl std::fmt::Debug for ExternalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalAdapter")
            .field("backend", &self.loader.name())
            .field("ready", &self.detector.is_some())
            .field("loading", &self.awaiting.is_some())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl ExternalAdapter {
    /// Creates an adapter that only loads on the calling thread, through
    /// [`load_blocking`](Self::load_blocking). Nothing is loaded yet.
    pub fn new(loader: Arc<dyn DetectorLoader>) -> Self {
        Self {
            loader,
            detector: None,
            background: Err("adapter has no background loader".to_owned()),
            awaiting: None,
            attempts: 0,
            failed_windows: 0,
        }
    }

    /// Creates an adapter with its own loader thread, for callers that must
    /// never block or spawn, such as the audio callback. Nothing is loaded
    /// until [`start_loading`](Self::start_loading). If the thread cannot be
    /// spawned, every attempt reports that failure.
    pub fn with_background_loader(loader: Arc<dyn DetectorLoader>) -> Self {
        let backend = loader.name();
        let mut adapter = Self::new(Arc::clone(&loader));
        adapter.background = LoaderThread::spawn(loader).map_err(|err| {
            warn!(backend, %err, "could not spawn loader thread");
            err.to_string()
        });
        adapter
    }

    pub fn backend(&self) -> &'static str {
        self.loader.name()
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_some()
    }

    /// Load attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Windows the external detector could not answer.
    pub fn failed_windows(&self) -> u64 {
        self.failed_windows
    }

    /// Asks the loader thread for a new attempt without blocking. A pending
    /// attempt is superseded and its outcome discarded. Returns a failure
    /// status right away if there is no loader thread to ask.
    pub fn start_loading(&mut self) -> Option<LoadStatus> {
        self.attempts += 1;
        let attempt = self.attempts;
        let requested = match &self.background {
            Ok(thread) => {
                thread.latest.store(attempt, Ordering::Release);
                match thread.wake.try_send(()) {
                    Ok(()) | Err(TrySendError::Full(())) => Ok(()),
                    Err(TrySendError::Disconnected(())) => Err("loader thread exited".to_owned()),
                }
            }
            Err(reason) => Err(reason.clone()),
        };

        match requested {
            Ok(()) => {
                self.awaiting = Some(attempt);
                None
            }
            Err(reason) => {
                self.awaiting = None;
                Some(self.settle(Err(LoadError::LoaderLost(reason))))
            }
        }
    }

    /// Loads on the calling thread. For contexts that may block, such as
    /// the detection worker.
    pub fn load_blocking(&mut self) -> LoadStatus {
        self.attempts += 1;
        self.awaiting = None;
        let outcome = guarded_load(self.loader.as_ref());
        self.settle(outcome)
    }

    /// Picks up the outcome of the pending attempt without blocking.
    pub fn poll(&mut self) -> Option<LoadStatus> {
        let awaiting = self.awaiting?;
        loop {
            let received = match &self.background {
                Ok(thread) => thread.answers.try_recv(),
                Err(_) => Err(TryRecvError::Disconnected),
            };
            match received {
                Ok((attempt, outcome)) if attempt == awaiting => {
                    self.awaiting = None;
                    return Some(self.settle(outcome));
                }
                Ok((attempt, _)) => trace!(attempt, "discarding superseded load outcome"),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.awaiting = None;
                    let lost = LoadError::LoaderLost("loader exited without an answer".to_owned());
                    return Some(self.settle(Err(lost)));
                }
            }
        }
    }

    fn settle(&mut self, outcome: LoadOutcome) -> LoadStatus {
        let status = LoadStatus::from_outcome(self.loader.name(), &outcome);
        match outcome {
            Ok(detector) => {
                info!(backend = self.loader.name(), "external pitch detector ready");
                self.detector = Some(detector);
            }
            Err(err) => {
                warn!(backend = self.loader.name(), %err, "external pitch detector unavailable");
                self.detector = None;
            }
        }
        status
    }

    /// Asks the external detector for a frequency. `None` means the caller
    /// should fall back for this window: no detector, an error, a panic, or
    /// no usable value.
    pub fn estimate(&mut self, window: &[f32], sample_rate: f32) -> Option<f32> {
        let detector = self.detector.as_mut()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.estimate(window, sample_rate)));
        match outcome {
            Ok(Ok(Some(freq))) if freq.is_finite() && freq > 0.0 => Some(freq),
            Ok(Ok(_)) => None,
            Ok(Err(err)) => {
                self.failed_windows += 1;
                trace!(%err, "external estimate failed");
                None
            }
            Err(_) => {
                self.failed_windows += 1;
                trace!("external estimate panicked");
                None
            }
        }
    }
}

/// Loader for a backend that is not part of this build.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableLoader(pub &'static str);

impl DetectorLoader for UnavailableLoader {
    fn name(&self) -> &'static str {
        self.0
    }

    fn load(&self) -> Result<Box<dyn PitchDetector>, LoadError> {
        Err(LoadError::Unavailable(self.0))
    }
}

/// The loader used when none is given, for windows of `window_size`
/// samples: the McLeod backend when the `mcleod` feature is on.
pub fn default_loader(window_size: usize) -> Arc<dyn DetectorLoader> {
    #[cfg(feature = "mcleod")]
    {
        Arc::new(mcleod::McLeodLoader::new(window_size))
    }
    #[cfg(not(feature = "mcleod"))]
    {
        let _ = window_size;
        Arc::new(UnavailableLoader("mcleod"))
    }
}

#[cfg(feature = "mcleod")]
pub use mcleod::{McLeodBackend, McLeodLoader};

#[cfg(feature = "mcleod")]
mod mcleod {
    use pitch_detection::detector::PitchDetector as _;
    use pitch_detection::detector::mcleod::McLeodDetector;

    use super::{DetectorLoader, PitchDetector};
    use crate::error::{EstimateError, LoadError};

    /// Builds [`McLeodBackend`]s for a fixed window size.
    #[derive(Debug, Clone)]
    pub struct McLeodLoader {
        pub window_size: usize,
        pub power_threshold: f32,
        pub clarity_threshold: f32,
    }

    impl McLeodLoader {
        pub fn new(window_size: usize) -> Self {
            Self {
                window_size,
                power_threshold: 5.0,
                clarity_threshold: 0.7,
            }
        }
    }

    impl DetectorLoader for McLeodLoader {
        fn name(&self) -> &'static str {
            "mcleod"
        }

        fn load(&self) -> Result<Box<dyn PitchDetector>, LoadError> {
            if self.window_size < 4 {
                return Err(LoadError::Instantiate {
                    backend: "mcleod",
                    reason: format!("window of {} samples is too small", self.window_size),
                });
            }
            Ok(Box::new(McLeodBackend {
                detector: McLeodDetector::new(self.window_size, self.window_size / 2),
                size: self.window_size,
                power_threshold: self.power_threshold,
                clarity_threshold: self.clarity_threshold,
            }))
        }
    }

    /// McLeod pitch method from the `pitch-detection` crate.
    pub struct McLeodBackend {
        detector: McLeodDetector<f32>,
        size: usize,
        power_threshold: f32,
        clarity_threshold: f32,
    }

    impl PitchDetector for McLeodBackend {
        fn estimate(
            &mut self,
            window: &[f32],
            sample_rate: f32,
        ) -> Result<Option<f32>, EstimateError> {
            if window.len() != self.size {
                return Err(EstimateError::WindowSize {
                    expected: self.size,
                    got: window.len(),
                });
            }
            let pitch = self.detector.get_pitch(
                window,
                sample_rate.round() as usize,
                self.power_threshold,
                self.clarity_threshold,
            );
            Ok(pitch.map(|p| p.frequency))
        }
    }
}
