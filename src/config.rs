//! Configuration for how each training example is synthesized.
//!
//! Every example is assembled from three synchronized modalities: a waveform, a note-event
//! file and one video frame. The knobs below decide how those get turned into fixed-size
//! grids, how often two records get blended together ("mixup"), and how the audio grid is
//! augmented and normalized before it reaches the model.
//!
//! A `DatasetConfig` is captured once when the dataset is built and never changes after
//! that. Corpus constants that are not meant to be tuned live here as plain `const`s.

use std::path::Path;

use phf::phf_map;
use serde::Deserialize;

use crate::error::{Error, Result};

// Value used to fill every placeholder grid that stands in for a corrupt input.
pub const PLACEHOLDER_FILL: f32 = 0.01;

// Number of frames in the audio and piano-roll placeholders, before length normalization.
pub const FALLBACK_FRAMES: usize = 1024;

// Kaldi-style framing for the filterbank.
pub const FRAME_SHIFT_MS: f64 = 10.0;
pub const FRAME_LENGTH_MS: f64 = 25.0;
pub const PREEMPHASIS_COEFF: f32 = 0.97;
pub const MEL_LOW_FREQ: f32 = 20.0;

// Piano-roll sampling rate and pitch columns (one per MIDI key).
pub const PIANO_ROLL_FPS: f64 = 100.0;
pub const PIANO_ROLL_PITCHES: usize = 128;

// Longest piano roll rendered in full, one hour at 100 fps. Longer (usually corrupt) files are
// rejected rather than allocated.
pub const MAX_ROLL_FRAMES: usize = 360_000;

// Sustain pedal controller and the value at which it counts as pressed.
pub const SUSTAIN_PEDAL_CC: u8 = 64;
pub const PEDAL_THRESHOLD: u8 = 64;

// Piano-roll normalization. These were measured over the whole symbolic corpus and are not
// configurable per run.
pub const PIANO_ROLL_MEAN: f32 = 0.4951;
pub const PIANO_ROLL_STD: f32 = 5.6075;

// Frames whose long side exceeds this many times the short side are treated as corrupt.
pub const MAX_FRAME_ASPECT: u32 = 16;

// Per-channel image normalization.
pub const IMAGE_MEAN: [f32; 3] = [0.4850, 0.4560, 0.4060];
pub const IMAGE_STD: [f32; 3] = [0.2290, 0.2240, 0.2250];

// Shape parameters of the Beta distribution the mixing coefficient is drawn from. Beta(10, 10)
// keeps most blends close to half and half.
pub const MIXUP_BETA_ALPHA: f64 = 10.0;
pub const MIXUP_BETA_BETA: f64 = 10.0;

/// Audio spectrogram statistics `(mean, std)` for known corpora, used when a config names a
/// `dataset` but leaves `mean`/`std` empty.
pub const DATASET_NORM_STATS: phf::Map<&'static str, (f64, f64)> = phf_map! {
    "audioset" => (-5.081, 4.4849),
    "vggsound" => (-5.081, 4.4849),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Random frame per call.
    #[default]
    Train,
    /// Fixed frame per record.
    Eval,
}

/// Everything needed to turn a catalog record into a training example.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub num_mel_bins: usize,
    /// Number of time frames every audio and piano-roll grid is padded or cropped to.
    pub target_length: usize,
    /// Maximum frequency mask width. `0` disables frequency masking.
    pub freqm: usize,
    /// Maximum time mask width. `0` disables time masking.
    pub timem: usize,
    /// Probability that a call blends two records.
    pub mixup: f64,
    /// Preset name used to look up `mean`/`std` in [`DATASET_NORM_STATS`].
    pub dataset: Option<String>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    /// Leave both grids unnormalized. Only meant for computing `mean`/`std` themselves.
    pub skip_norm: bool,
    pub noise: bool,
    pub mode: Mode,
    /// Frame used in eval mode. Defaults to the middle of `total_frame`.
    pub frame_use: Option<usize>,
    pub total_frame: usize,
    pub im_res: u32,
    pub label_smooth: f64,
    /// Resample every waveform to this rate before the filterbank. Unset keeps the rate the
    /// file declares.
    pub resample_to: Option<u32>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            num_mel_bins: 128,
            target_length: 1024,
            freqm: 0,
            timem: 0,
            mixup: 0.0,
            dataset: None,
            mean: None,
            std: None,
            skip_norm: false,
            noise: false,
            mode: Mode::Train,
            frame_use: None,
            total_frame: 10,
            im_res: 224,
            label_smooth: 0.0,
            resample_to: None,
        }
    }
}

impl DatasetConfig {
    /// Reads a config from a TOML file. Missing keys take their defaults.
    ///
    /// Values are only checked when a dataset is built from the config, so a file without
    /// normalization stats can still be loaded to measure them.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            Error::Config(format!("cannot parse config '{}': {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Rejects configurations that would produce malformed examples.
    pub fn validate(&self) -> Result<()> {
        if self.num_mel_bins == 0 {
            return Err(Error::Config("num_mel_bins must be positive".into()));
        }
        if self.target_length == 0 {
            return Err(Error::Config("target_length must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.mixup) {
            return Err(Error::Config(format!("mixup rate {} is outside [0, 1]", self.mixup)));
        }
        if !(0.0..=1.0).contains(&self.label_smooth) {
            return Err(Error::Config(format!(
                "label_smooth {} is outside [0, 1]",
                self.label_smooth
            )));
        }
        if self.total_frame == 0 {
            return Err(Error::Config("total_frame must be positive".into()));
        }
        if let Some(frame) = self.frame_use {
            if frame >= self.total_frame {
                return Err(Error::Config(format!(
                    "frame_use {} is not below total_frame {}",
                    frame, self.total_frame
                )));
            }
        }
        if self.im_res == 0 {
            return Err(Error::Config("im_res must be positive".into()));
        }
        if self.resample_to == Some(0) {
            return Err(Error::Config("resample_to must be positive".into()));
        }
        if !self.skip_norm {
            let (_, std) = self.norm_stats()?;
            if std == 0.0 {
                return Err(Error::Config("std must be non-zero".into()));
            }
        }
        Ok(())
    }

    /// The audio `(mean, std)`, falling back to the named dataset preset.
    pub fn norm_stats(&self) -> Result<(f64, f64)> {
        let preset = self
            .dataset
            .as_deref()
            .and_then(|name| DATASET_NORM_STATS.get(name).copied());
        match (self.mean, self.std, preset) {
            (Some(mean), Some(std), _) => Ok((mean, std)),
            (mean, std, Some((preset_mean, preset_std))) => {
                Ok((mean.unwrap_or(preset_mean), std.unwrap_or(preset_std)))
            }
            _ => Err(Error::Config(format!(
                "no normalization stats: set mean/std or a known dataset (have {:?})",
                self.dataset
            ))),
        }
    }

    /// The frame index used in eval mode.
    pub fn eval_frame(&self) -> usize {
        self.frame_use.unwrap_or(self.total_frame / 2)
    }
}
