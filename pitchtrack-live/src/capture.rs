//! # Microphone Capture
//!
//! Opens the default input device with CPAL and drives a [`BlockCallback`]
//! from its audio callback.
//!
//! ## Features
//! - Default input device, 32-bit float format
//! - Sample rate as close to 44.1 kHz as the device allows
//! - Mono preferred; multichannel input is mixed down in the callback

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;
use tracing::{error, info};

use crate::session::BlockCallback;

/// Sample rate asked of the device.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// An input device with its chosen stream configuration.
pub struct InputDevice {
    device: cpal::Device,
    config: cpal::StreamConfig,
}

impl InputDevice {
    /// Selects the default input device and a float configuration.
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;

        info!(device = %device.name().unwrap_or_else(|_| "<unnamed>".to_owned()), "using audio input device");

        let configs = device
            .supported_input_configs()
            .context("querying input configurations")?
            .collect::<Vec<_>>();
        let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE)
            .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

        let rate = TARGET_SAMPLE_RATE.clamp(
            supported_config.min_sample_rate().0,
            supported_config.max_sample_rate().0,
        );
        let config: cpal::StreamConfig = supported_config.with_sample_rate(cpal::SampleRate(rate)).into();
        info!(sample_rate = rate, channels = config.channels, "selected input format");

        Ok(Self { device, config })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Builds and starts the input stream. The stream stops when dropped.
    pub fn start(self, mut callback: BlockCallback) -> Result<cpal::Stream> {
        let channels = self.config.channels.max(1) as usize;
        let mut mono: Vec<f32> = Vec::new();

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if channels == 1 {
                        callback.process(data);
                    } else {
                        mono.clear();
                        mono.extend(
                            data.chunks_exact(channels)
                                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                        );
                        callback.process(&mono);
                    }
                },
                |err| error!(%err, "[AUDIO] stream error"),
                None,
            )
            .context("building input stream")?;

        stream.play().context("starting input stream")?;
        Ok(stream)
    }
}

/// Picks an f32 configuration, mono first, then by distance to `target_rate`.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let min = c.min_sample_rate().0;
            let max = c.max_sample_rate().0;
            let distance = if (min..=max).contains(&target_rate) {
                0
            } else {
                min.abs_diff(target_rate).min(max.abs_diff(target_rate))
            };
            (c.channels() != 1, distance)
        })
}
