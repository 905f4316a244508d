//! SpecAugment-style masking, additive noise and input normalization.
//!
//! Only the audio grid is augmented. The piano roll is normalized with the corpus constants
//! and the image tensor is left exactly as the visual loader produced it.

use rand::Rng;

use crate::{
    config::{DatasetConfig, PIANO_ROLL_MEAN, PIANO_ROLL_STD},
    grid::FeatureGrid,
};

/// Picks a mask `[start, end)` on an axis of `size`, at most `max_width` wide.
///
/// Width and start are both drawn as floats and floored, so the mask can be empty.
fn mask_span(size: usize, max_width: usize, rng: &mut impl Rng) -> (usize, usize) {
    let width = rng.random::<f64>() * max_width as f64;
    let start = rng.random::<f64>() * (size as f64 - width);
    let start = start.max(0.0) as usize;
    let end = (start + width as usize).min(size);
    (start, end)
}

/// Zeroes one random band of up to `max_width` mel bins across all frames.
pub fn frequency_mask(grid: &mut FeatureGrid, max_width: usize, rng: &mut impl Rng) {
    if max_width == 0 {
        return;
    }
    let (start, end) = mask_span(grid.cols(), max_width, rng);
    let cols = grid.cols();
    for row in grid.as_mut_slice().chunks_mut(cols) {
        row[start..end].fill(0.0);
    }
}

/// Zeroes one random run of up to `max_width` frames.
pub fn time_mask(grid: &mut FeatureGrid, max_width: usize, rng: &mut impl Rng) {
    if max_width == 0 {
        return;
    }
    let (start, end) = mask_span(grid.rows(), max_width, rng);
    let cols = grid.cols();
    grid.as_mut_slice()[start * cols..end * cols].fill(0.0);
}

/// Adds uniform noise scaled by a random factor in `[0, 0.1)`, then rolls the frames by a
/// random offset in `(-rows, rows)`.
pub fn add_noise(grid: &mut FeatureGrid, rng: &mut impl Rng) {
    let scale = rng.random::<f32>() / 10.0;
    for v in grid.as_mut_slice() {
        *v += rng.random::<f32>() * scale;
    }
    let rows = grid.rows() as i64;
    if rows > 0 {
        let shift = rng.random_range(-rows..rows);
        grid.roll_rows(shift as isize);
    }
}

fn standardize(grid: &mut FeatureGrid, mean: f32, std: f32) {
    for v in grid.as_mut_slice() {
        *v = (*v - mean) / std;
    }
}

/// The post-extraction stage applied to every example.
#[derive(Debug, Clone)]
pub struct Augmenter {
    freqm: usize,
    timem: usize,
    noise: bool,
    // `None` when normalization is skipped.
    audio_stats: Option<(f32, f32)>,
}

impl Augmenter {
    pub fn new(freqm: usize, timem: usize, noise: bool, audio_stats: Option<(f32, f32)>) -> Self {
        Self { freqm, timem, noise, audio_stats }
    }

    /// Fails only if normalization is on and no stats can be resolved.
    pub fn from_config(config: &DatasetConfig) -> crate::Result<Self> {
        let audio_stats = if config.skip_norm {
            None
        } else {
            let (mean, std) = config.norm_stats()?;
            Some((mean as f32, std as f32))
        };
        Ok(Self::new(config.freqm, config.timem, config.noise, audio_stats))
    }

    /// Masks, normalizes, then adds noise. With normalization skipped, both grids keep their
    /// raw values apart from masking and noise on the audio grid.
    pub fn apply(&self, audio: &mut FeatureGrid, piano_roll: &mut FeatureGrid, rng: &mut impl Rng) {
        frequency_mask(audio, self.freqm, rng);
        time_mask(audio, self.timem, rng);

        if let Some((mean, std)) = self.audio_stats {
            standardize(audio, mean, std);
            standardize(piano_roll, PIANO_ROLL_MEAN, PIANO_ROLL_STD);
        }

        if self.noise {
            add_noise(audio, rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn zero_cols(grid: &FeatureGrid) -> Vec<usize> {
        (0..grid.cols()).filter(|&c| (0..grid.rows()).all(|r| grid.get(r, c) == 0.0)).collect()
    }

    fn zero_rows(grid: &FeatureGrid) -> Vec<usize> {
        (0..grid.rows()).filter(|&r| grid.row(r).iter().all(|&v| v == 0.0)).collect()
    }

    #[test]
    fn zero_width_masks_do_nothing() {
        let mut grid = FeatureGrid::filled(10, 8, 1.0);
        let mut rng = StdRng::seed_from_u64(0);
        frequency_mask(&mut grid, 0, &mut rng);
        time_mask(&mut grid, 0, &mut rng);
        assert_eq!(grid, FeatureGrid::filled(10, 8, 1.0));
    }

    #[test]
    fn masks_are_contiguous_bands() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let mut grid = FeatureGrid::filled(100, 64, 1.0);
            frequency_mask(&mut grid, 24, &mut rng);
            let cols = zero_cols(&grid);
            assert!(cols.len() < 24);
            assert!(cols.windows(2).all(|w| w[1] == w[0] + 1));
            assert!(zero_rows(&grid).is_empty());

            let mut grid = FeatureGrid::filled(100, 64, 1.0);
            time_mask(&mut grid, 48, &mut rng);
            let rows = zero_rows(&grid);
            assert!(rows.len() < 48);
            assert!(rows.windows(2).all(|w| w[1] == w[0] + 1));
        }
    }

    #[test]
    fn normalizes_both_grids() {
        let augmenter = Augmenter::new(0, 0, false, Some((-4.0, 2.0)));
        let mut audio = FeatureGrid::filled(2, 2, 0.0);
        let mut roll = FeatureGrid::filled(2, 128, PIANO_ROLL_MEAN + PIANO_ROLL_STD);
        augmenter.apply(&mut audio, &mut roll, &mut StdRng::seed_from_u64(0));
        assert!(audio.as_slice().iter().all(|&v| v == 2.0));
        assert!(roll.as_slice().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn skip_norm_leaves_grids_untouched() {
        let augmenter = Augmenter::new(0, 0, false, None);
        let mut audio = FeatureGrid::filled(3, 4, -7.5);
        let mut roll = FeatureGrid::filled(3, 128, 64.0);
        augmenter.apply(&mut audio, &mut roll, &mut StdRng::seed_from_u64(0));
        assert_eq!(audio, FeatureGrid::filled(3, 4, -7.5));
        assert_eq!(roll, FeatureGrid::filled(3, 128, 64.0));
    }

    #[test]
    fn noise_rolls_frames_within_range() {
        // One marked row; after the roll it must still be a single marked row.
        for seed in 0..20 {
            let mut grid = FeatureGrid::zeros(7, 3);
            grid.as_mut_slice()[..3].fill(100.0);
            add_noise(&mut grid, &mut StdRng::seed_from_u64(seed));
            let marked: Vec<usize> = (0..7).filter(|&r| grid.get(r, 0) >= 100.0).collect();
            assert_eq!(marked.len(), 1);
            assert!(grid.row(marked[0]).iter().all(|&v| v >= 100.0));
        }
    }

    #[test]
    fn noise_is_small_and_keeps_shape() {
        let mut grid = FeatureGrid::filled(50, 4, 1.0);
        add_noise(&mut grid, &mut StdRng::seed_from_u64(5));
        assert_eq!(grid.shape(), [50, 4]);
        assert!(grid.as_slice().iter().all(|&v| (1.0..1.1).contains(&v)));
    }
}
