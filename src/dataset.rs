//! Per-index example assembly, including mixup of two catalog records.
//!
//! A [`Dataset`] owns the catalog, vocabulary and configuration and is shared read-only by
//! every worker. Each call to [`Dataset::get`] takes the caller's own RNG, so workers never
//! contend for (or accidentally share) random state. Use [`worker_rng`] or [`sample_rng`] to
//! derive those generators from one base seed.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use tracing::{info, warn};

use crate::{
    audio::AudioExtractor,
    augment::Augmenter,
    catalog::{Catalog, Record},
    config::{DatasetConfig, Mode, MIXUP_BETA_ALPHA, MIXUP_BETA_BETA, PIANO_ROLL_PITCHES},
    error::{Error, Result},
    grid::{FeatureGrid, ImageTensor},
    symbolic::SymbolicExtractor,
    visual::VisualLoader,
    vocab::Vocabulary,
};

/// One assembled training example.
#[derive(Debug, Clone)]
pub struct Example {
    /// `[target_length, num_mel_bins]`
    pub audio: FeatureGrid,
    /// `[target_length, 128]`
    pub piano_roll: FeatureGrid,
    /// `[3, im_res, im_res]`
    pub image: ImageTensor,
    /// One entry per vocabulary class.
    pub target: Vec<f32>,
    /// The second record and its weight `1 - lambda`, when this example is a blend.
    pub mix: Option<Mix>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mix {
    pub index: usize,
    /// Weight of the primary record.
    pub lambda: f64,
}

/// Generator for one worker. Different workers get unrelated streams from the same base seed.
pub fn worker_rng(base_seed: u64, worker_id: u64) -> StdRng {
    StdRng::seed_from_u64(mix_seed(base_seed, worker_id))
}

/// Generator for one sample index, so a sample's draws do not depend on which worker runs it.
pub fn sample_rng(base_seed: u64, index: usize) -> StdRng {
    StdRng::seed_from_u64(mix_seed(base_seed ^ 0x5DEE_CE66_D1CE_4E5B, index as u64))
}

// SplitMix64 finalizer over the pair.
fn mix_seed(base: u64, stream: u64) -> u64 {
    let mut z = base.wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Label vector for a single record: `label_smooth / N` everywhere, `1 - label_smooth` at
/// each listed class. Repeated ids change nothing.
pub fn plain_target(vocab: &Vocabulary, record: &Record, label_smooth: f64) -> Result<Vec<f32>> {
    let n = vocab.len();
    let mut target = vec![(label_smooth / n as f64) as f32; n];
    for id in record.label_ids() {
        target[vocab.index_of(id)?] = (1.0 - label_smooth) as f32;
    }
    Ok(target)
}

/// Label vector for a blend: the smoothing floor, plus `lambda * (1 - label_smooth)` per class
/// of `primary` and `(1 - lambda) * (1 - label_smooth)` per class of `secondary`.
///
/// Contributions add up, so a class in both records (or listed twice) accumulates and the
/// vector does not have to sum to one.
pub fn mixed_target(
    vocab: &Vocabulary,
    primary: &Record,
    secondary: &Record,
    lambda: f64,
    label_smooth: f64,
) -> Result<Vec<f32>> {
    let n = vocab.len();
    let mut target = vec![label_smooth / n as f64; n];
    for id in primary.label_ids() {
        target[vocab.index_of(id)?] += lambda * (1.0 - label_smooth);
    }
    for id in secondary.label_ids() {
        target[vocab.index_of(id)?] += (1.0 - lambda) * (1.0 - label_smooth);
    }
    Ok(target.into_iter().map(|v| v as f32).collect())
}

pub struct Dataset {
    catalog: Catalog,
    vocab: Vocabulary,
    config: DatasetConfig,
    audio: AudioExtractor,
    symbolic: SymbolicExtractor,
    visual: VisualLoader,
    augmenter: Augmenter,
    beta: Beta<f64>,
}

impl Dataset {
    /// Validates the configuration and captures it for the dataset's lifetime.
    ///
    /// With mixup enabled the catalog must use a single media root, since blended frames are
    /// always looked up under the primary record's root.
    pub fn new(catalog: Catalog, vocab: Vocabulary, config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        if config.mixup > 0.0 {
            catalog.ensure_shared_media_root()?;
        }
        if vocab.is_empty() {
            return Err(Error::Config("vocabulary has no classes".into()));
        }
        let beta = Beta::new(MIXUP_BETA_ALPHA, MIXUP_BETA_BETA)
            .map_err(|e| Error::Config(format!("bad mixup distribution: {e}")))?;

        info!(records = catalog.len(), classes = vocab.len(), "dataset ready");
        info!(label_smooth = config.label_smooth, mixup = config.mixup, "label smoothing and mix-up rate");
        info!(freqm = config.freqm, timem = config.timem, noise = config.noise, "audio augmentation");
        if config.skip_norm {
            info!("skipping normalization (only use this when computing normalization stats)");
        } else {
            let (mean, std) = config.norm_stats()?;
            info!(mean, std, "normalizing audio with dataset stats");
        }
        match config.mode {
            Mode::Eval => info!(frame = config.eval_frame(), total = config.total_frame, "eval mode, fixed frame"),
            Mode::Train => info!(total = config.total_frame, "train mode, random frame"),
        }
        info!(im_res = config.im_res, "image resolution");

        Ok(Self {
            audio: AudioExtractor::from_config(&config),
            symbolic: SymbolicExtractor::from_config(&config),
            visual: VisualLoader::from_config(&config),
            augmenter: Augmenter::from_config(&config)?,
            catalog,
            vocab,
            config,
            beta,
        })
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Assembles the example at `index`.
    ///
    /// Unreadable media never fails the call; it degrades to placeholder grids. A label id
    /// missing from the vocabulary does fail it.
    pub fn get(&self, index: usize, rng: &mut impl Rng) -> Result<Example> {
        let primary = self.catalog.decode(index)?;

        if rng.random::<f64>() < self.config.mixup {
            let mix_index = rng.random_range(0..self.catalog.len());
            let secondary = self.catalog.decode(mix_index)?;
            let lambda = self.beta.sample(rng);

            let audio = self.audio_grid(|| {
                self.audio.extract(
                    Path::new(primary.audio_path),
                    Some((Path::new(secondary.audio_path), lambda)),
                )
            });
            let piano_roll = self.roll_grid(|| {
                self.symbolic.extract(
                    Path::new(primary.symbolic_path),
                    Some((Path::new(secondary.symbolic_path), lambda)),
                    &mut *rng,
                )
            });
            let image = self.image_tensor(|| self.visual.load(&primary, Some((&secondary, lambda)), &mut *rng));
            let target = mixed_target(&self.vocab, &primary, &secondary, lambda, self.config.label_smooth)?;

            Ok(self.finish(audio, piano_roll, image, target, Some(Mix { index: mix_index, lambda }), rng))
        } else {
            let target = plain_target(&self.vocab, &primary, self.config.label_smooth)?;
            let audio = self.audio_grid(|| self.audio.extract(Path::new(primary.audio_path), None));
            let piano_roll =
                self.roll_grid(|| self.symbolic.extract(Path::new(primary.symbolic_path), None, &mut *rng));
            let image = self.image_tensor(|| self.visual.load(&primary, None, &mut *rng));

            Ok(self.finish(audio, piano_roll, image, target, None, rng))
        }
    }

    fn finish(
        &self,
        mut audio: FeatureGrid,
        mut piano_roll: FeatureGrid,
        image: ImageTensor,
        target: Vec<f32>,
        mix: Option<Mix>,
        rng: &mut impl Rng,
    ) -> Example {
        self.augmenter.apply(&mut audio, &mut piano_roll, rng);
        Example { audio, piano_roll, image, target, mix }
    }

    // The extractors already swallow their own errors. These guards catch what slips past
    // them: a panic inside a decoder or a grid of the wrong shape.

    fn audio_grid(&self, extract: impl FnOnce() -> FeatureGrid) -> FeatureGrid {
        let shape = [self.config.target_length, self.config.num_mel_bins];
        guarded("audio", shape, extract)
    }

    fn roll_grid(&self, extract: impl FnOnce() -> FeatureGrid) -> FeatureGrid {
        let shape = [self.config.target_length, PIANO_ROLL_PITCHES];
        guarded("piano roll", shape, extract)
    }

    fn image_tensor(&self, load: impl FnOnce() -> ImageTensor) -> ImageTensor {
        guarded_image(self.config.im_res as usize, load)
    }
}

fn guarded_image(res: usize, load: impl FnOnce() -> ImageTensor) -> ImageTensor {
    match catch_unwind(AssertUnwindSafe(load)) {
        Ok(image) if image.shape() == [3, res, res] => image,
        _ => {
            warn!("image loading escaped its fallback, using placeholder");
            ImageTensor::placeholder(res)
        }
    }
}

fn guarded(modality: &str, shape: [usize; 2], extract: impl FnOnce() -> FeatureGrid) -> FeatureGrid {
    match catch_unwind(AssertUnwindSafe(extract)) {
        Ok(grid) if grid.shape() == shape => grid,
        _ => {
            warn!(modality, "extraction escaped its fallback, using placeholder");
            FeatureGrid::placeholder(shape[0], shape[1])
        }
    }
}
