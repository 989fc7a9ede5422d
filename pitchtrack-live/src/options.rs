//! Command line options.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use pitchtrack_core::config::RENDER_QUANTUM;
use pitchtrack_core::{DetectorConfig, TuningUpdate};

pub const USAGE: &str = "usage: pitchtrack-live [--worker | --simple] [--config FILE.json] \
[--onset-threshold X] [--rms-gate Y] [--block N] [WAV_FILE]";

/// Which pipeline runs behind the audio callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Ring buffer, onset detection and throttled publishing in the callback.
    Processor,
    /// Callback forwards batches to a detection thread.
    Worker,
    /// Callback analyses fixed batches directly.
    Simple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub pipeline: PipelineKind,
    pub config_path: Option<PathBuf>,
    pub tuning: TuningUpdate,
    pub block_size: usize,
    pub wav_file: Option<PathBuf>,
    pub help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pipeline: PipelineKind::Processor,
            config_path: None,
            tuning: TuningUpdate::default(),
            block_size: RENDER_QUANTUM,
            wav_file: None,
            help: false,
        }
    }
}

impl Options {
    /// Parses the arguments following the program name.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Options::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => options.help = true,
                "--worker" => options.set_pipeline(PipelineKind::Worker)?,
                "--simple" => options.set_pipeline(PipelineKind::Simple)?,
                "--config" => options.config_path = Some(PathBuf::from(value(&mut args, &arg)?)),
                "--onset-threshold" => {
                    options.tuning.onset_threshold = Some(number(&mut args, &arg)?);
                }
                "--rms-gate" => options.tuning.rms_gate = Some(number(&mut args, &arg)?),
                "--block" => {
                    let raw = value(&mut args, &arg)?;
                    options.block_size = raw
                        .parse()
                        .with_context(|| format!("--block expects a sample count, got {raw:?}"))?;
                    if options.block_size == 0 {
                        bail!("--block must be greater than zero");
                    }
                }
                flag if flag.starts_with('-') => bail!("unknown option {flag}\n{USAGE}"),
                path => {
                    if options.wav_file.is_some() {
                        bail!("only one WAV file can be analysed at a time");
                    }
                    options.wav_file = Some(PathBuf::from(path));
                }
            }
        }
        Ok(options)
    }

    fn set_pipeline(&mut self, pipeline: PipelineKind) -> Result<()> {
        if self.pipeline != PipelineKind::Processor && self.pipeline != pipeline {
            bail!("--worker and --simple are mutually exclusive");
        }
        self.pipeline = pipeline;
        Ok(())
    }

    /// Loads the configuration file, if any, and applies the command line
    /// tuning on top.
    pub fn detector_config(&self) -> Result<DetectorConfig> {
        let mut config = match &self.config_path {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                DetectorConfig::from_json(&json)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => DetectorConfig::default(),
        };
        self.tuning.apply(&mut config);
        Ok(config)
    }
}

fn value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{flag} expects a value"))
}

fn number<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<f32> {
    let raw = value(args, flag)?;
    let parsed: f32 = raw
        .parse()
        .with_context(|| format!("{flag} expects a number, got {raw:?}"))?;
    if !parsed.is_finite() {
        bail!("{flag} must be finite");
    }
    Ok(parsed)
}
