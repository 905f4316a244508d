//! Picks one pre-extracted video frame per record and turns it into a normalized image tensor.
//!
//! Frames live under the record's media root as `frame_<k>/<media_id>.jpg`, with `k` running
//! over `0..total_frame`. Not every video has every frame, so a missing one falls back to the
//! closest earlier index.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use rand::Rng;
use tracing::{debug, warn};

use crate::{
    catalog::Record,
    config::{DatasetConfig, Mode, IMAGE_MEAN, IMAGE_STD, MAX_FRAME_ASPECT},
    grid::ImageTensor,
};

pub fn frame_path(media_root: &str, media_id: &str, frame: usize) -> PathBuf {
    Path::new(media_root).join(format!("frame_{frame}")).join(format!("{media_id}.jpg"))
}

#[derive(Debug, Clone)]
pub struct FrameSelector {
    mode: Mode,
    eval_frame: usize,
    total_frame: usize,
}

impl FrameSelector {
    pub fn new(mode: Mode, eval_frame: usize, total_frame: usize) -> Self {
        Self { mode, eval_frame, total_frame }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.mode, config.eval_frame(), config.total_frame)
    }

    /// The frame index to try first: fixed in eval mode, uniform over all frames in train mode.
    pub fn pick(&self, rng: &mut impl Rng) -> usize {
        match self.mode {
            Mode::Eval => self.eval_frame,
            Mode::Train => rng.random_range(0..self.total_frame),
        }
    }

    /// Walks down from `frame` to the first index whose file exists, stopping at 0.
    ///
    /// The returned path is not guaranteed to exist.
    pub fn resolve(&self, media_root: &str, media_id: &str, mut frame: usize) -> PathBuf {
        let requested = frame;
        let mut path = frame_path(media_root, media_id, frame);
        while frame >= 1 && !path.exists() {
            frame -= 1;
            path = frame_path(media_root, media_id, frame);
        }
        if frame != requested {
            debug!(media_id, requested, frame, "frame missing, fell back to an earlier one");
        }
        path
    }

    pub fn locate(&self, media_root: &str, media_id: &str, rng: &mut impl Rng) -> PathBuf {
        let frame = self.pick(rng);
        self.resolve(media_root, media_id, frame)
    }
}

#[derive(Debug, Clone)]
pub struct VisualLoader {
    im_res: u32,
    selector: FrameSelector,
}

impl VisualLoader {
    pub fn new(im_res: u32, selector: FrameSelector) -> Self {
        Self { im_res, selector }
    }

    pub fn from_config(config: &DatasetConfig) -> Self {
        Self::new(config.im_res, FrameSelector::from_config(config))
    }

    /// Returns a `[3, im_res, im_res]` tensor for the primary record's frame, or the blend
    /// `lambda * primary + (1 - lambda) * secondary` of two frames.
    ///
    /// The secondary frame is looked up under the *primary* record's media root, which is only
    /// right when every record shares one root. Any failure yields the placeholder tensor.
    pub fn load(&self, primary: &Record, secondary: Option<(&Record, f64)>, rng: &mut impl Rng) -> ImageTensor {
        let path = self.selector.locate(primary.media_root, primary.media_id, rng);
        let secondary = secondary.map(|(record, lambda)| {
            (self.selector.locate(primary.media_root, record.media_id, rng), lambda)
        });
        match self.try_load(&path, secondary.as_ref().map(|(p, l)| (p.as_path(), *l))) {
            Ok(image) => image,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "frame load failed, using placeholder");
                ImageTensor::placeholder(self.im_res as usize)
            }
        }
    }

    fn try_load(&self, primary: &Path, secondary: Option<(&Path, f64)>) -> Result<ImageTensor> {
        let image = preprocess(primary, self.im_res)?;
        match secondary {
            None => Ok(image),
            Some((path, lambda)) => {
                let other = preprocess(path, self.im_res)?;
                image.blend(&other, lambda as f32).context("blended frames differ in shape")
            }
        }
    }
}

/// Decodes an image, resizes its shorter side to `res` (bicubic), center-crops a `res` square
/// and normalizes each channel with the ImageNet statistics.
pub fn preprocess(path: &Path, res: u32) -> Result<ImageTensor> {
    let rgb = image::open(path).with_context(|| format!("cannot decode {}", path.display()))?.to_rgb8();
    let (w, h) = rgb.dimensions();
    anyhow::ensure!(w > 0 && h > 0, "{} is empty", path.display());
    anyhow::ensure!(
        w.max(h) / w.min(h) <= MAX_FRAME_ASPECT,
        "{} is {}x{}, too narrow to be a video frame",
        path.display(),
        w,
        h
    );

    let (new_w, new_h) = if w <= h {
        (res, ((res as u64 * h as u64) / w as u64) as u32)
    } else {
        (((res as u64 * w as u64) / h as u64) as u32, res)
    };
    let resized = if (new_w, new_h) == (w, h) {
        rgb
    } else {
        imageops::resize(&rgb, new_w, new_h, FilterType::CatmullRom)
    };

    let top = ((new_h - res) as f64 / 2.0).round() as u32;
    let left = ((new_w - res) as f64 / 2.0).round() as u32;
    let cropped = imageops::crop_imm(&resized, left, top, res, res).to_image();

    let res = res as usize;
    let mut data = vec![0.0f32; 3 * res * res];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            data[c * res * res + y as usize * res + x as usize] = (value - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }
    ImageTensor::from_vec([3, res, res], data).context("cropped frame has the wrong size")
}
