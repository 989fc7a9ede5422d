// pitchtrack-live/src/main.rs

//! Command line host for the pitch tracker.
//!
//! Analyses the default microphone (or a WAV file) and writes every output
//! message as one JSON line on stdout. Logs go to stderr. In microphone mode
//! each line read from stdin is a control message; end of input stops the
//! session.

mod options;
mod session;
mod wav;

#[cfg(feature = "capture")]
mod capture;

use std::io::{self, Write};
use std::path::Path;

use anyhow::Result;
use pitchtrack_core::{DetectorConfig, OutputMessage};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::options::{Options, USAGE};
use crate::session::Session;

/// File input is fed in chunks of this many samples.
const FILE_CHUNK: usize = 4096;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::parse(std::env::args().skip(1))?;
    if options.help {
        eprintln!("{USAGE}");
        return Ok(());
    }
    let config = options.detector_config()?;
    debug!(?config, "detector configuration");

    match &options.wav_file {
        Some(path) => analyse_file(path, &options, config),
        None => run_microphone(&options, config),
    }
}

fn write_message(out: &mut impl Write, message: &OutputMessage) -> Result<()> {
    writeln!(out, "{}", message.to_json()?)?;
    out.flush()?;
    Ok(())
}

fn analyse_file(path: &Path, options: &Options, config: DetectorConfig) -> Result<()> {
    let recording = wav::read_wav(path)?;
    info!(
        file = %path.display(),
        sample_rate = recording.sample_rate,
        samples = recording.samples.len(),
        "analysing file"
    );

    // Nothing may be dropped for a file, so the worker queue holds it all.
    let worker_queue = recording.samples.len() / config.batch_size.max(1) + 8;
    let (session, mut callback) = Session::start(
        options.pipeline,
        config,
        recording.sample_rate,
        options.block_size,
        worker_queue,
    )?;

    let mut out = io::stdout().lock();
    for chunk in recording.samples.chunks(FILE_CHUNK) {
        callback.process(chunk);
        for message in session.output().try_iter() {
            write_message(&mut out, &message)?;
        }
    }
    drop(callback);
    for message in session.finish() {
        write_message(&mut out, &message)?;
    }
    Ok(())
}

#[cfg(feature = "capture")]
fn run_microphone(options: &Options, config: DetectorConfig) -> Result<()> {
    use anyhow::Context;
    use pitchtrack_core::ControlMessage;
    use tracing::warn;

    let device = capture::InputDevice::open_default()?;
    let (session, callback) =
        Session::start(options.pipeline, config, device.sample_rate(), options.block_size, 64)?;
    let stream = device.start(callback)?;

    let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlMessage>();
    std::thread::Builder::new()
        .name("stdin-control".to_owned())
        .spawn(move || {
            for line in io::stdin().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let messages = match ControlMessage::from_json(&line) {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(%err, "ignoring control line");
                        continue;
                    }
                };
                if messages.into_iter().any(|message| control_tx.send(message).is_err()) {
                    break;
                }
            }
            debug!("[STDIN] end of input");
        })
        .context("spawning stdin reader")?;

    info!("listening; close stdin to stop");
    let mut out = io::stdout().lock();
    loop {
        crossbeam_channel::select! {
            recv(session.output()) -> msg => match msg {
                Ok(message) => write_message(&mut out, &message)?,
                Err(_) => {
                    warn!("pipeline output closed");
                    break;
                }
            },
            recv(control_rx) -> msg => match msg {
                Ok(message) => {
                    if let Err(err) = session.send(message) {
                        warn!(%err, "control message dropped");
                    }
                }
                Err(_) => break,
            },
        }
    }

    info!("stopping");
    drop(stream);
    for message in session.finish() {
        write_message(&mut out, &message)?;
    }
    Ok(())
}

#[cfg(not(feature = "capture"))]
fn run_microphone(_options: &Options, _config: DetectorConfig) -> Result<()> {
    anyhow::bail!("built without microphone capture; pass a WAV file\n{USAGE}")
}
