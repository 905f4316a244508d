//! The label vocabulary: class id <-> dense index, plus display names for the reverse direction.

use std::{collections::HashMap, fs::File, io::Seek, path::Path, sync::Arc};

use arrow::{
    array::{Array, StringArray},
    csv::{reader::Format, ReaderBuilder},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
};
use tracing::warn;

use crate::error::{Error, Result};

const MID_COLUMN: &str = "mid";
const INDEX_COLUMN: &str = "index";
const NAME_COLUMN: &str = "display_name";

#[derive(Debug, Clone)]
pub struct Vocabulary {
    index_of: HashMap<String, usize>,
    names: HashMap<usize, String>,
}

impl Vocabulary {
    /// Loads a label table with `mid`, `index` and `display_name` columns, in any order.
    ///
    /// A missing file, a missing column or an unparseable index are all fatal: a partial
    /// vocabulary would silently corrupt every label vector built from it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let table_err = |source: ArrowError| Error::LabelTable { path: path.to_path_buf(), source };

        let mut file = File::open(path).map_err(|e| table_err(e.into()))?;
        let format = Format::default().with_header(true);
        let (inferred, _) = format.infer_schema(&mut file, None).map_err(table_err)?;
        file.rewind()?;

        // Read every column as text; the index column is parsed below so that a bad value
        // can be reported with its row.
        let schema = Schema::new(
            inferred
                .fields()
                .iter()
                .map(|f| Field::new(f.name(), DataType::Utf8, true))
                .collect::<Vec<_>>(),
        );
        let column = |column: &'static str| {
            schema
                .index_of(column)
                .map_err(|_| Error::MissingColumn { path: path.to_path_buf(), column })
        };
        let (mid_col, index_col, name_col) =
            (column(MID_COLUMN)?, column(INDEX_COLUMN)?, column(NAME_COLUMN)?);

        let reader = ReaderBuilder::new(Arc::new(schema))
            .with_header(true)
            .build(file)
            .map_err(table_err)?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(table_err)?;
            let text = |idx: usize| {
                batch.column(idx).as_any().downcast_ref::<StringArray>().cloned().ok_or_else(|| {
                    Error::BadLabelRow {
                        path: path.to_path_buf(),
                        row: 0,
                        reason: format!("column {} did not load as text", idx),
                    }
                })
            };
            let (mids, indices, names) = (text(mid_col)?, text(index_col)?, text(name_col)?);
            for i in 0..batch.num_rows() {
                let row = rows.len() + 1;
                let bad_row = |reason: String| Error::BadLabelRow { path: path.to_path_buf(), row, reason };
                if mids.is_null(i) || mids.value(i).is_empty() {
                    return Err(bad_row("empty class id".into()));
                }
                if indices.is_null(i) {
                    return Err(bad_row("empty index".into()));
                }
                let index = indices.value(i).trim().parse::<usize>().map_err(|e| {
                    bad_row(format!("index '{}' is not a non-negative integer: {}", indices.value(i), e))
                })?;
                let name = if names.is_null(i) { "" } else { names.value(i) };
                rows.push((mids.value(i).to_string(), index, name.to_string()));
            }
        }

        Self::from_rows(path, rows)
    }

    fn from_rows(path: &Path, rows: Vec<(String, usize, String)>) -> Result<Self> {
        let mut index_of = HashMap::with_capacity(rows.len());
        let mut names = HashMap::with_capacity(rows.len());
        for (mid, index, name) in rows {
            if let Some(previous) = index_of.insert(mid.clone(), index) {
                warn!(class_id = %mid, previous, index, "duplicate class id in label table, keeping the last one");
            }
            names.insert(index, name);
        }

        // Label vectors have one slot per class, so indices must be exactly 0..N-1.
        let len = index_of.len();
        if let Some((mid, &index)) = index_of.iter().find(|&(_, &index)| index >= len) {
            return Err(Error::BadLabelRow {
                path: path.to_path_buf(),
                row: 0,
                reason: format!("index {} of '{}' is not below the class count {}", index, mid, len),
            });
        }
        let mut seen = vec![false; len];
        for &index in index_of.values() {
            if std::mem::replace(&mut seen[index], true) {
                return Err(Error::BadLabelRow {
                    path: path.to_path_buf(),
                    row: 0,
                    reason: format!("index {} is assigned to more than one class", index),
                });
            }
        }

        Ok(Self { index_of, names })
    }

    /// Dense index of a class id. An unknown id is a dataset/vocabulary mismatch.
    pub fn index_of(&self, class_id: &str) -> Result<usize> {
        self.index_of
            .get(class_id)
            .copied()
            .ok_or_else(|| Error::UnknownLabel(class_id.to_string()))
    }

    pub fn display_name(&self, index: usize) -> Option<&str> {
        self.names.get(&index).map(String::as_str)
    }

    /// Display names for a list of indices, skipping unknown ones.
    pub fn display_names(&self, indices: &[usize]) -> Vec<&str> {
        indices.iter().filter_map(|&i| self.display_name(i)).collect()
    }

    /// Number of classes, which is also the label vector length.
    pub fn len(&self) -> usize {
        self.index_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_of.is_empty()
    }
}
