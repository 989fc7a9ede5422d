//! WAV file input.

use std::path::Path;

use anyhow::{Context, Result, bail};

/// A decoded recording, mixed down to mono.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Reads a WAV file. Integer formats are scaled to [-1, 1]; multichannel
/// files are averaged per frame.
pub fn read_wav(path: &Path) -> Result<Recording> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        bail!("{} declares no channels", path.display());
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("decoding {}", path.display()))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 * scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("decoding {}", path.display()))?
        }
    };

    Ok(Recording {
        sample_rate: spec.sample_rate,
        samples: mix_down(&interleaved, spec.channels as usize),
    })
}

/// Averages interleaved frames into one channel.
pub fn mix_down(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pitchtrack-{}-{name}", std::process::id()))
    }

    #[test]
    fn mixes_stereo_frames() {
        assert_eq!(mix_down(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(mix_down(&[0.25, 0.75], 1), vec![0.25, 0.75]);
    }

    #[test]
    fn reads_sixteen_bit_stereo() {
        let path = temp_path("stereo16.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..4 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let recording = read_wav(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(recording.sample_rate, 48_000);
        assert_eq!(recording.samples.len(), 4);
        assert!(recording.samples.iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn reads_float_mono() {
        let path = temp_path("mono32.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for sample in [0.5f32, -0.5, 0.0] {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let recording = read_wav(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(recording.samples, vec![0.5, -0.5, 0.0]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(read_wav(Path::new("/nonexistent/take.wav")).is_err());
    }
}
