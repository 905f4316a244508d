//! Kaldi-compatible log-mel filterbank features.
//!
//! Framing follows Kaldi's `snip_edges` convention: only frames that fit entirely inside the
//! signal are produced, each `FRAME_LENGTH_MS` long and `FRAME_SHIFT_MS` apart. Every frame has
//! its DC offset removed, is pre-emphasised, windowed with a symmetric Hanning window and
//! zero-padded to the next power of two before the power spectrum is taken. Triangular filters
//! are spaced evenly on the mel scale `1127 ln(1 + f / 700)` between 20 Hz and Nyquist.

use std::f32::consts::PI;

use anyhow::{ensure, Context, Result};
use rustfft::{num_complex::Complex, FftPlanner};

use crate::{
    config::{FRAME_LENGTH_MS, FRAME_SHIFT_MS, MEL_LOW_FREQ, PREEMPHASIS_COEFF},
    grid::FeatureGrid,
};

fn mel_scale(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

/// Symmetric Hanning window, `0.5 - 0.5 cos(2 pi n / (N - 1))`.
fn hanning(len: usize) -> Vec<f32> {
    if len == 1 {
        return vec![1.0];
    }
    let denom = (len - 1) as f32;
    (0..len).map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / denom).cos()).collect()
}

/// `[num_bins][padded_len / 2 + 1]` triangular weights. The Nyquist column is always zero.
fn mel_banks(num_bins: usize, padded_len: usize, sample_rate: f32) -> Vec<Vec<f32>> {
    let num_fft_bins = padded_len / 2;
    let nyquist = 0.5 * sample_rate;
    let fft_bin_width = sample_rate / padded_len as f32;

    let mel_low = mel_scale(MEL_LOW_FREQ);
    let mel_high = mel_scale(nyquist);
    let mel_delta = (mel_high - mel_low) / (num_bins + 1) as f32;

    (0..num_bins)
        .map(|bin| {
            let left = mel_low + bin as f32 * mel_delta;
            let center = left + mel_delta;
            let right = center + mel_delta;
            let mut weights = vec![0.0; num_fft_bins + 1];
            for (i, w) in weights.iter_mut().take(num_fft_bins).enumerate() {
                let mel = mel_scale(fft_bin_width * i as f32);
                let up = (mel - left) / (center - left);
                let down = (right - mel) / (right - center);
                *w = up.min(down).max(0.0);
            }
            weights
        })
        .collect()
}

/// Computes a `[frames, num_bins]` log-mel grid from a mono signal.
///
/// Fails if the signal is shorter than a single frame or the sample rate cannot hold the
/// lowest filter.
pub fn log_mel_fbank(samples: &[f32], sample_rate: u32, num_bins: usize) -> Result<FeatureGrid> {
    let sr = sample_rate as f64;
    let shift = (sr * FRAME_SHIFT_MS / 1000.0) as usize;
    let frame_len = (sr * FRAME_LENGTH_MS / 1000.0) as usize;
    ensure!(shift > 0 && frame_len > 1, "sample rate {} is too low for framing", sample_rate);
    ensure!(
        0.5 * (sample_rate as f32) > MEL_LOW_FREQ,
        "sample rate {} leaves no room above {} Hz",
        sample_rate,
        MEL_LOW_FREQ
    );
    ensure!(
        samples.len() >= frame_len,
        "signal of {} samples is shorter than one {}-sample frame",
        samples.len(),
        frame_len
    );

    let num_frames = 1 + (samples.len() - frame_len) / shift;
    let padded_len = frame_len.next_power_of_two();
    let window = hanning(frame_len);
    let banks = mel_banks(num_bins, padded_len, sample_rate as f32);
    let fft = FftPlanner::<f32>::new().plan_fft_forward(padded_len);

    let mut buffer = vec![Complex::new(0.0f32, 0.0); padded_len];
    let mut frame = vec![0.0f32; frame_len];
    let mut power = vec![0.0f32; padded_len / 2 + 1];
    let mut out = Vec::with_capacity(num_frames * num_bins);

    for f in 0..num_frames {
        frame.copy_from_slice(&samples[f * shift..f * shift + frame_len]);

        let mean = frame.iter().sum::<f32>() / frame_len as f32;
        for s in frame.iter_mut() {
            *s -= mean;
        }
        for i in (1..frame_len).rev() {
            frame[i] -= PREEMPHASIS_COEFF * frame[i - 1];
        }
        frame[0] -= PREEMPHASIS_COEFF * frame[0];

        for (slot, (&s, &w)) in buffer.iter_mut().zip(frame.iter().zip(&window)) {
            *slot = Complex::new(s * w, 0.0);
        }
        for slot in buffer[frame_len..].iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }
        fft.process(&mut buffer);

        for (p, c) in power.iter_mut().zip(&buffer) {
            *p = c.norm_sqr();
        }
        for bank in &banks {
            let energy: f32 = bank.iter().zip(&power).map(|(w, p)| w * p).sum();
            out.push(energy.max(f32::EPSILON).ln());
        }
    }

    FeatureGrid::from_vec(num_frames, num_bins, out).context("filterbank produced a ragged grid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n).map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin()).collect()
    }

    #[test]
    fn frame_count_follows_snip_edges() {
        // 1 s at 16 kHz: 400-sample frames every 160 samples.
        let grid = log_mel_fbank(&tone(440.0, 16000, 16000), 16000, 128).unwrap();
        assert_eq!(grid.shape(), [1 + (16000 - 400) / 160, 128]);

        let grid = log_mel_fbank(&tone(440.0, 16000, 400 + 499 * 160), 16000, 64).unwrap();
        assert_eq!(grid.shape(), [500, 64]);
    }

    #[test]
    fn tone_energy_lands_in_low_bins() {
        let grid = log_mel_fbank(&tone(300.0, 16000, 8000), 16000, 40).unwrap();
        let row = grid.row(10);
        let peak = row.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).unwrap().0;
        assert!(peak < 10, "peak bin {}", peak);
    }

    #[test]
    fn too_short_signal_fails() {
        assert!(log_mel_fbank(&[0.0; 100], 16000, 128).is_err());
    }

    #[test]
    fn banks_are_triangles() {
        let banks = mel_banks(23, 512, 16000.0);
        assert_eq!(banks.len(), 23);
        for bank in &banks {
            assert_eq!(bank.len(), 257);
            assert_eq!(bank[256], 0.0);
            assert!(bank.iter().all(|&w| (0.0..=1.0 + 1e-5).contains(&w)));
            assert!(bank.iter().any(|&w| w > 0.0));
        }
    }

    #[test]
    fn silence_hits_the_floor() {
        let grid = log_mel_fbank(&vec![0.0; 16000], 16000, 8).unwrap();
        assert!(grid.as_slice().iter().all(|&v| v == f32::EPSILON.ln()));
    }
}
