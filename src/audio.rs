//! Waveform(s) -> fixed-size log-mel grid.

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::{
    config::{DatasetConfig, FALLBACK_FRAMES},
    decode::{load_waveform_at, remove_dc},
    fbank::log_mel_fbank,
    grid::FeatureGrid,
};

#[derive(Debug, Clone)]
pub struct AudioExtractor {
    num_mel_bins: usize,
    target_length: usize,
    resample_to: Option<u32>,
}

impl AudioExtractor {
    pub fn new(num_mel_bins: usize, target_length: usize, resample_to: Option<u32>) -> Self {
        Self { num_mel_bins, target_length, resample_to }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.num_mel_bins, config.target_length, config.resample_to)
    }

    /// Returns a `[target_length, num_mel_bins]` grid for one waveform, or for the blend
    /// `lambda * primary + (1 - lambda) * secondary` when a secondary is given.
    ///
    /// Never fails: an unreadable input turns into a `[1024, num_mel_bins]` placeholder
    /// before length normalization. Longer grids keep their first `target_length` frames.
    pub fn extract(&self, primary: &Path, secondary: Option<(&Path, f64)>) -> FeatureGrid {
        let grid = match self.try_fbank(primary, secondary) {
            Ok(grid) => grid,
            Err(e) => {
                warn!(path = %primary.display(), error = %e, "audio load failed, using placeholder");
                FeatureGrid::placeholder(FALLBACK_FRAMES, self.num_mel_bins)
            }
        };
        grid.pad_or_truncate(self.target_length)
    }

    fn try_fbank(&self, primary: &Path, secondary: Option<(&Path, f64)>) -> Result<FeatureGrid> {
        let mut wav = load_waveform_at(primary, self.resample_to)?;
        wav.remove_dc();
        if let Some((path, lambda)) = secondary {
            let mut other = load_waveform_at(path, self.resample_to)?;
            other.remove_dc();
            wav.samples = mix_waveforms(wav.samples, other.samples, lambda);
        }
        log_mel_fbank(&wav.samples, wav.sample_rate, self.num_mel_bins)
    }
}

/// Blends two DC-free waveforms and removes the DC offset of the result.
///
/// The secondary is always fitted to the primary's length: zero-padded when it is shorter,
/// truncated when it is longer. The blend therefore never outlasts the primary.
pub fn mix_waveforms(primary: Vec<f32>, mut secondary: Vec<f32>, lambda: f64) -> Vec<f32> {
    secondary.resize(primary.len(), 0.0);
    let lambda = lambda as f32;
    let mut mixed: Vec<f32> = primary
        .iter()
        .zip(&secondary)
        .map(|(&a, &b)| lambda * a + (1.0 - lambda) * b)
        .collect();
    remove_dc(&mut mixed);
    mixed
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use hound::{SampleFormat, WavSpec, WavWriter};

    use super::*;
    use crate::config::PLACEHOLDER_FILL;

    fn write_tone(path: &Path, samples: usize) {
        let spec = WavSpec { channels: 1, sample_rate: 16000, bits_per_sample: 16, sample_format: SampleFormat::Int };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..samples {
            let s = (2.0 * PI * 440.0 * i as f32 / 16000.0).sin() * 0.5;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    // Sample count that yields exactly `frames` filterbank frames at 16 kHz.
    fn samples_for(frames: usize) -> usize {
        400 + (frames - 1) * 160
    }

    #[test]
    fn short_audio_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_tone(&path, samples_for(500));

        let grid = AudioExtractor::new(128, 1024, None).extract(&path, None);
        assert_eq!(grid.shape(), [1024, 128]);
        assert!(grid.row(499).iter().any(|&v| v != 0.0));
        assert!((500..1024).all(|r| grid.row(r).iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn long_audio_keeps_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.wav");
        write_tone(&path, samples_for(2000));

        let full = AudioExtractor::new(64, 2000, None).extract(&path, None);
        let cropped = AudioExtractor::new(64, 1024, None).extract(&path, None);
        assert_eq!(cropped.shape(), [1024, 64]);
        assert_eq!(cropped.as_slice(), &full.as_slice()[..1024 * 64]);
    }

    #[test]
    fn missing_file_becomes_placeholder() {
        let grid = AudioExtractor::new(128, 1024, None).extract(Path::new("/no/such.wav"), None);
        assert_eq!(grid.shape(), [1024, 128]);
        assert!(grid.as_slice().iter().all(|&v| v == PLACEHOLDER_FILL));
    }

    #[test]
    fn bad_secondary_also_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.wav");
        write_tone(&path, samples_for(100));
        let grid = AudioExtractor::new(32, 1024, None).extract(&path, Some((Path::new("/no/such.wav"), 0.5)));
        assert!(grid.row(0).iter().all(|&v| v == PLACEHOLDER_FILL));
    }

    #[test]
    fn secondary_is_fitted_to_primary() {
        let padded = mix_waveforms(vec![1.0, 1.0, 1.0, 1.0], vec![1.0, 1.0], 0.5);
        assert_eq!(padded.len(), 4);
        // Before DC removal: [1, 1, 0.5, 0.5].
        assert_eq!(padded, vec![0.25, 0.25, -0.25, -0.25]);

        let truncated = mix_waveforms(vec![0.0, 0.0], vec![1.0, 3.0, 5.0], 0.5);
        assert_eq!(truncated, vec![-0.5, 0.5]);
    }

    #[test]
    fn lambda_one_keeps_primary() {
        let mixed = mix_waveforms(vec![-1.0, 1.0], vec![5.0, 7.0], 1.0);
        assert_eq!(mixed, vec![-1.0, 1.0]);
    }
}
