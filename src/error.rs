//! Fatal errors. Anything in here means the catalog, vocabulary and configuration disagree
//! and the run should stop. Per-file corruption is never reported through this type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot read label table '{path}': {source}")]
    LabelTable {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("Label table '{path}' is missing column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("Label table '{path}' row {row}: {reason}")]
    BadLabelRow { path: PathBuf, row: usize, reason: String },

    /// A label id in the catalog that the vocabulary does not know about.
    #[error("Label '{0}' is not in the vocabulary")]
    UnknownLabel(String),

    #[error("Cannot read catalog '{path}': {reason}")]
    CatalogSource { path: PathBuf, reason: String },

    #[error("Catalog record {index} has no usable '{field}' field")]
    CatalogField { index: usize, field: &'static str },

    #[error("Index {index} is out of range for a catalog of {len} records")]
    IndexOutOfRange { index: usize, len: usize },

    /// Blended frames are always looked up under the primary record's media root.
    #[error("Catalog records do not share one media root ('{first}' vs '{other}'), which mixup requires")]
    DivergentMediaRoots { first: String, other: String },

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
