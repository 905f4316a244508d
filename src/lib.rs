//! Synthesizes multimodal training examples from a catalog of records.
//!
//! Each record names a waveform, a note-event file and a directory of pre-extracted video
//! frames. [`Dataset::get`] turns one record (or a blend of two) into a log-mel grid, a
//! piano-roll grid, an image tensor and a multi-hot label vector, all with fixed shapes no
//! matter how damaged the underlying files are.

pub mod audio;
pub mod augment;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod decode;
pub mod error;
pub mod fbank;
pub mod grid;
pub mod symbolic;
pub mod visual;
pub mod vocab;

pub use catalog::{Catalog, Record};
pub use config::{DatasetConfig, Mode};
pub use dataset::{sample_rng, worker_rng, Dataset, Example, Mix};
pub use error::{Error, Result};
pub use grid::{FeatureGrid, ImageTensor};
pub use vocab::Vocabulary;
