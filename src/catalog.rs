//! The catalog of records, each naming one waveform, one note-event file and one video's frames.
//!
//! Records are stored column by column in Arrow string arrays rather than as one owned struct
//! per row. A catalog can hold hundreds of thousands of records and is shared by every loading
//! worker, so keeping it as five contiguous buffers (instead of millions of small heap strings)
//! keeps its footprint flat and makes sharing it a matter of cloning a few `Arc`s.

use std::{fs, path::Path};

use arrow::array::{Array, StringArray, StringBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

// Keys of a raw catalog entry, in column order.
const AUDIO_KEY: &str = "wav1";
const SYMBOLIC_KEY: &str = "wav2";
const LABELS_KEY: &str = "labels";
const MEDIA_ID_KEY: &str = "video_id";
const MEDIA_ROOT_KEY: &str = "video_path";

#[derive(Deserialize)]
struct CatalogFile {
    data: Vec<Value>,
}

/// One record, borrowed from the catalog's columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub audio_path: &'a str,
    pub symbolic_path: &'a str,
    /// Comma-separated class ids.
    pub labels: &'a str,
    pub media_id: &'a str,
    pub media_root: &'a str,
}

impl<'a> Record<'a> {
    pub fn label_ids(&self) -> impl Iterator<Item = &'a str> {
        self.labels.split(',')
    }
}

/// Immutable, fixed-schema record table.
#[derive(Debug, Clone)]
pub struct Catalog {
    audio: StringArray,
    symbolic: StringArray,
    labels: StringArray,
    media_id: StringArray,
    media_root: StringArray,
}

#[derive(Default)]
struct CatalogBuilder {
    audio: StringBuilder,
    symbolic: StringBuilder,
    labels: StringBuilder,
    media_id: StringBuilder,
    media_root: StringBuilder,
    len: usize,
}

impl CatalogBuilder {
    fn push(&mut self, raw: &Value) -> Result<()> {
        let index = self.len;
        let field = |key: &'static str| -> Result<String> {
            match raw.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                // Numeric ids show up in some catalogs; they are still just names.
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => Err(Error::CatalogField { index, field: key }),
            }
        };
        // Validate every field before appending so a failure leaves the columns aligned.
        let (audio, symbolic, labels, media_id, media_root) = (
            field(AUDIO_KEY)?,
            field(SYMBOLIC_KEY)?,
            field(LABELS_KEY)?,
            field(MEDIA_ID_KEY)?,
            field(MEDIA_ROOT_KEY)?,
        );
        self.audio.append_value(audio);
        self.symbolic.append_value(symbolic);
        self.labels.append_value(labels);
        self.media_id.append_value(media_id);
        self.media_root.append_value(media_root);
        self.len += 1;
        Ok(())
    }

    fn finish(mut self) -> Catalog {
        Catalog {
            audio: self.audio.finish(),
            symbolic: self.symbolic.finish(),
            labels: self.labels.finish(),
            media_id: self.media_id.finish(),
            media_root: self.media_root.finish(),
        }
    }
}

impl Catalog {
    /// Converts raw keyed entries into the fixed five-column table. Every entry must carry
    /// all five fields; the first one that does not aborts the build.
    pub fn build<'v>(raw_records: impl IntoIterator<Item = &'v Value>) -> Result<Self> {
        let mut builder = CatalogBuilder::default();
        for raw in raw_records {
            builder.push(raw)?;
        }
        Ok(builder.finish())
    }

    /// Loads a catalog file of the form `{"data": [{...}, ...]}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_files(&[path.as_ref()])
    }

    /// Loads several catalog files into one table, in the order given.
    pub fn from_json_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut builder = CatalogBuilder::default();
        for path in paths {
            let path = path.as_ref();
            let source_err = |reason: String| Error::CatalogSource { path: path.to_path_buf(), reason };
            let text = fs::read_to_string(path).map_err(|e| source_err(e.to_string()))?;
            let file: CatalogFile = serde_json::from_str(&text).map_err(|e| source_err(e.to_string()))?;
            for raw in &file.data {
                builder.push(raw)?;
            }
        }
        Ok(builder.finish())
    }

    /// Loads every catalog file matching a glob pattern, in sorted path order.
    pub fn from_glob(pattern: &str) -> Result<Self> {
        let source_err = |reason: String| Error::CatalogSource { path: pattern.into(), reason };
        let mut paths = glob::glob(pattern)
            .map_err(|e| source_err(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| source_err(e.to_string()))?;
        if paths.is_empty() {
            return Err(source_err("no files match".into()));
        }
        paths.sort();
        Self::from_json_files(&paths)
    }

    pub fn len(&self) -> usize {
        self.audio.len()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }

    /// The record at `index`.
    pub fn decode(&self, index: usize) -> Result<Record<'_>> {
        if index >= self.len() {
            return Err(Error::IndexOutOfRange { index, len: self.len() });
        }
        Ok(Record {
            audio_path: self.audio.value(index),
            symbolic_path: self.symbolic.value(index),
            labels: self.labels.value(index),
            media_id: self.media_id.value(index),
            media_root: self.media_root.value(index),
        })
    }

    /// Fails unless every record uses the same media root.
    pub fn ensure_shared_media_root(&self) -> Result<()> {
        let mut roots = self.media_root.iter().flatten();
        let Some(first) = roots.next() else {
            return Ok(());
        };
        match roots.find(|&root| root != first) {
            Some(other) => Err(Error::DivergentMediaRoots {
                first: first.to_string(),
                other: other.to_string(),
            }),
            None => Ok(()),
        }
    }
}
