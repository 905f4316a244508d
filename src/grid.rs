//! Fixed-shape feature containers handed to the model.

use rand::Rng;

use crate::config::PLACEHOLDER_FILL;

/// A row-major `[rows, cols]` grid. Rows are time frames, columns are mel bins or pitches.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureGrid {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl FeatureGrid {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self { rows, cols, data: vec![value; rows * cols] }
    }

    /// The grid that stands in for an input that could not be loaded.
    pub fn placeholder(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, PLACEHOLDER_FILL)
    }

    /// Wraps flat row-major data. Returns `None` if the length does not match the shape.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Zero-pads at the end or keeps the first `target` rows.
    pub fn pad_or_truncate(mut self, target: usize) -> Self {
        self.data.resize(target * self.cols, 0.0);
        self.rows = target;
        self
    }

    /// Zero-pads at the end, or keeps a random contiguous window of `target` rows.
    ///
    /// The window start is drawn from `0..rows - target`, so the very last window is never
    /// chosen.
    pub fn pad_or_random_window(self, target: usize, rng: &mut impl Rng) -> Self {
        let start = random_window_start(self.rows, target, rng);
        if start == 0 {
            return self.pad_or_truncate(target);
        }
        let data = self.data[start * self.cols..(start + target) * self.cols].to_vec();
        Self { rows: target, cols: self.cols, data }
    }

    /// Circularly shifts rows by `shift`: row `i` moves to row `(i + shift) mod rows`.
    pub fn roll_rows(&mut self, shift: isize) {
        if self.rows == 0 {
            return;
        }
        let offset = shift.rem_euclid(self.rows as isize) as usize;
        self.data.rotate_right(offset * self.cols);
    }
}

/// Start row of a `target`-row window over `rows` rows, drawn from `0..rows - target`.
///
/// Too short, exact, or exactly one row too long: only start 0 is possible.
pub fn random_window_start(rows: usize, target: usize, rng: &mut impl Rng) -> usize {
    if rows <= target + 1 {
        return 0;
    }
    rng.random_range(0..rows - target)
}

/// A channel-first `[channels, height, width]` image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn placeholder(res: usize) -> Self {
        Self { shape: [3, res, res], data: vec![PLACEHOLDER_FILL; 3 * res * res] }
    }

    pub fn from_vec(shape: [usize; 3], data: Vec<f32>) -> Option<Self> {
        (data.len() == shape.iter().product::<usize>()).then_some(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        let [_, h, w] = self.shape;
        self.data[channel * h * w + y * w + x]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// `lambda * self + (1 - lambda) * other`, elementwise.
    pub fn blend(mut self, other: &Self, lambda: f32) -> Option<Self> {
        if self.shape != other.shape {
            return None;
        }
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a = lambda * *a + (1.0 - lambda) * b;
        }
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn counting(rows: usize, cols: usize) -> FeatureGrid {
        FeatureGrid::from_vec(rows, cols, (0..rows * cols).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn pads_with_zeros_at_the_end() {
        let grid = FeatureGrid::filled(3, 2, 1.0).pad_or_truncate(5);
        assert_eq!(grid.shape(), [5, 2]);
        assert_eq!(grid.row(2), &[1.0, 1.0]);
        assert_eq!(grid.row(3), &[0.0, 0.0]);
        assert_eq!(grid.row(4), &[0.0, 0.0]);
    }

    #[test]
    fn truncation_keeps_the_head() {
        let grid = counting(6, 2).pad_or_truncate(3);
        assert_eq!(grid.as_slice(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn random_window_is_contiguous() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut starts = std::collections::HashSet::new();
        for _ in 0..64 {
            let grid = counting(50, 1).pad_or_random_window(10, &mut rng);
            assert_eq!(grid.shape(), [10, 1]);
            let start = grid.get(0, 0);
            for row in 0..10 {
                assert_eq!(grid.get(row, 0), start + row as f32);
            }
            assert!(start < 40.0);
            starts.insert(start as usize);
        }
        assert!(starts.len() > 1);
    }

    #[test]
    fn roll_moves_rows_forward() {
        let mut grid = counting(4, 1);
        grid.roll_rows(1);
        assert_eq!(grid.as_slice(), &[3.0, 0.0, 1.0, 2.0]);
        grid.roll_rows(-2);
        assert_eq!(grid.as_slice(), &[1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn blend_is_convex() {
        let a = ImageTensor::from_vec([1, 1, 2], vec![1.0, 0.0]).unwrap();
        let b = ImageTensor::from_vec([1, 1, 2], vec![0.0, 1.0]).unwrap();
        let mixed = a.blend(&b, 0.25).unwrap();
        assert_eq!(mixed.as_slice(), &[0.25, 0.75]);
    }
}
