//! Per-image prediction table assembled from row batches.

use anyhow::Result;
use ndarray::{s, Array2, ArrayView1};
use std::io::Write;

use crate::error::AmfError;

/// Class probabilities for every tile of one mosaic, in row-major tile order.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTable {
    header: Vec<String>,
    ncols: usize,
    values: Array2<f32>,
}

impl PredictionTable {
    /// Concatenate per-row fragments (each `ncols × classes`, in row order).
    pub fn from_rows(
        fragments: &[Array2<f32>],
        ncols: usize,
        header: &[String],
    ) -> Result<Self, AmfError> {
        for (fragment, rows) in fragments.iter().enumerate() {
            if rows.nrows() != ncols || rows.ncols() != header.len() {
                return Err(AmfError::FragmentShape {
                    fragment,
                    rows: rows.nrows(),
                    cols: rows.ncols(),
                    expected_rows: ncols,
                    expected_cols: header.len(),
                });
            }
        }
        let mut values = Array2::zeros((fragments.len() * ncols, header.len()));
        for (r, rows) in fragments.iter().enumerate() {
            values
                .slice_mut(s![r * ncols..(r + 1) * ncols, ..])
                .assign(rows);
        }
        Ok(Self {
            header: header.to_vec(),
            ncols,
            values,
        })
    }

    /// Column names: `row`, `col`, then the class labels.
    pub fn columns(&self) -> Vec<String> {
        ["row", "col"]
            .iter()
            .map(|s| s.to_string())
            .chain(self.header.iter().cloned())
            .collect()
    }

    /// Tiles per grid row.
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Grid rows covered by the table.
    pub fn nrows(&self) -> usize {
        if self.ncols == 0 {
            0
        } else {
            self.len() / self.ncols
        }
    }

    pub fn class_labels(&self) -> &[String] {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    /// Tile row of line `i`.
    pub fn row_index(&self, i: usize) -> usize {
        i / self.ncols
    }

    /// Tile column of line `i`.
    pub fn col_index(&self, i: usize) -> usize {
        i % self.ncols
    }

    /// Class probabilities of line `i`.
    pub fn probabilities(&self, i: usize) -> ArrayView1<'_, f32> {
        self.values.row(i)
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// Index of the most likely class for each tile.
    pub fn best_classes(&self) -> Vec<usize> {
        self.values
            .rows()
            .into_iter()
            .map(|row| argmax(row.iter().copied()))
            .collect()
    }

    /// Write as tab-separated values with a header line.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut tsv = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        tsv.write_record(self.columns())?;
        for (i, probs) in self.values.rows().into_iter().enumerate() {
            let mut record = vec![self.row_index(i).to_string(), self.col_index(i).to_string()];
            record.extend(probs.iter().map(|p| p.to_string()));
            tsv.write_record(&record)?;
        }
        tsv.flush()?;
        Ok(())
    }
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(values: impl IntoIterator<Item = f32>) -> usize {
    values
        .into_iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, v)| {
            if v > best_v {
                (i, v)
            } else {
                (best, best_v)
            }
        })
        .0
}
