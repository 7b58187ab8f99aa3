//! Block-sparse row structure (CSR).
//!
//! A [`CsrPattern`] describes which entries of an `rows x cols` matrix are
//! present. The per-entry values live separately in a `[batch, nnz]` tensor so
//! one structure serves every batch slice.
//!
//! ```text
//! row_offsets     [0, 2, 2, 5]       row i owns entries row_offsets[i]..row_offsets[i+1]
//! column_indices  [0, 3, 1, 2, 3]    column of each entry
//! row_indices     [2, 0, 1]          scheduling order (longest rows first)
//! ```

use crate::error::{Error, Result};

/// Validated CSR structure shared across a batch of value arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrPattern {
    rows: usize,
    cols: usize,
    row_offsets: Vec<u32>,
    column_indices: Vec<u32>,
    row_indices: Vec<u32>,
}

fn invalid(reason: String) -> Error {
    Error::InvalidSparsePattern { reason }
}

impl CsrPattern {
    /// Build from raw CSR arrays, checking every structural invariant.
    pub fn new(
        rows: usize,
        cols: usize,
        row_offsets: Vec<u32>,
        column_indices: Vec<u32>,
        row_indices: Vec<u32>,
    ) -> Result<Self> {
        if row_offsets.len() != rows + 1 {
            return Err(invalid(format!(
                "row_offsets has {} entries, expected rows + 1 = {}",
                row_offsets.len(),
                rows + 1
            )));
        }
        if row_offsets[0] != 0 {
            return Err(invalid(format!(
                "row_offsets must start at 0, got {}",
                row_offsets[0]
            )));
        }
        if let Some(i) = row_offsets.windows(2).position(|w| w[1] < w[0]) {
            return Err(invalid(format!(
                "row_offsets decreases at row {}: {} -> {}",
                i,
                row_offsets[i],
                row_offsets[i + 1]
            )));
        }
        let nnz = row_offsets[rows] as usize;
        if column_indices.len() != nnz {
            return Err(invalid(format!(
                "column_indices has {} entries, row_offsets ends at {}",
                column_indices.len(),
                nnz
            )));
        }
        if let Some(pos) = column_indices.iter().position(|&c| c as usize >= cols) {
            return Err(invalid(format!(
                "column index {} at position {} out of range for {} columns",
                column_indices[pos], pos, cols
            )));
        }
        if row_indices.len() != rows {
            return Err(invalid(format!(
                "row_indices has {} entries, expected {}",
                row_indices.len(),
                rows
            )));
        }
        let mut seen = vec![false; rows];
        for &r in &row_indices {
            let r = r as usize;
            if r >= rows || seen[r] {
                return Err(invalid(format!(
                    "row_indices is not a permutation of 0..{rows} (entry {r})"
                )));
            }
            seen[r] = true;
        }

        Ok(Self {
            rows,
            cols,
            row_offsets,
            column_indices,
            row_indices,
        })
    }

    /// Build from offsets and columns, deriving the load-balancing order.
    pub fn from_csr(
        rows: usize,
        cols: usize,
        row_offsets: Vec<u32>,
        column_indices: Vec<u32>,
    ) -> Result<Self> {
        let identity = (0..rows as u32).collect();
        let mut pattern = Self::new(rows, cols, row_offsets, column_indices, identity)?;
        pattern.row_indices = pattern.balanced_row_indices();
        Ok(pattern)
    }

    /// Pattern of the `true` entries of a row-major `rows x cols` mask.
    pub fn from_mask(rows: usize, cols: usize, mask: &[bool]) -> Result<Self> {
        if mask.len() != rows * cols {
            return Err(Error::InvalidArgument {
                arg: "mask",
                reason: format!("expected {} entries, got {}", rows * cols, mask.len()),
            });
        }
        let mut row_offsets = Vec::with_capacity(rows + 1);
        let mut column_indices = Vec::new();
        row_offsets.push(0u32);
        for row in mask.chunks(cols.max(1)).take(rows) {
            column_indices.extend(
                row.iter()
                    .enumerate()
                    .filter(|&(_, &keep)| keep)
                    .map(|(c, _)| c as u32),
            );
            row_offsets.push(column_indices.len() as u32);
        }
        // cols == 0 yields no chunks; pad the empty rows
        while row_offsets.len() < rows + 1 {
            row_offsets.push(column_indices.len() as u32);
        }
        Self::from_csr(rows, cols, row_offsets, column_indices)
    }

    /// Every column present in every row.
    pub fn dense(rows: usize, cols: usize) -> Result<Self> {
        Self::from_mask(rows, cols, &vec![true; rows * cols])
    }

    /// Row ids ordered by descending row length (ties by id), so the longest
    /// rows are scheduled first.
    pub fn balanced_row_indices(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.rows as u32).collect();
        order.sort_by_key(|&r| std::cmp::Reverse(self.row_len(r as usize)));
        order
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.column_indices.len()
    }

    pub fn row_offsets(&self) -> &[u32] {
        &self.row_offsets
    }

    pub fn column_indices(&self) -> &[u32] {
        &self.column_indices
    }

    pub fn row_indices(&self) -> &[u32] {
        &self.row_indices
    }

    /// Entry range of `row` in the value array.
    #[inline]
    pub fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        self.row_offsets[row] as usize..self.row_offsets[row + 1] as usize
    }

    #[inline]
    pub fn row_len(&self, row: usize) -> usize {
        (self.row_offsets[row + 1] - self.row_offsets[row]) as usize
    }

    /// Check that a batched value array fits this pattern.
    ///
    /// Batched value arrays are read four entries at a time by the device
    /// kernels, so a batch larger than one requires `nnz % 4 == 0`.
    pub fn check_batch(&self, batch: usize) -> Result<()> {
        if batch > 1 && self.nnz() % 4 != 0 {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!(
                    "if batch size > 1 then number of nonzeros should be a multiple of 4 \
                     (batch={}, nnz={})",
                    batch,
                    self.nnz()
                ),
            });
        }
        Ok(())
    }
}

/// Split a row-major `[nnz]` buffer into one mutable slice per row.
pub(crate) fn split_rows<'a>(
    pattern: &CsrPattern,
    mut data: &'a mut [f32],
) -> Vec<(usize, &'a mut [f32])> {
    let mut rows = Vec::with_capacity(pattern.rows());
    for row in 0..pattern.rows() {
        let (head, tail) = data.split_at_mut(pattern.row_len(row));
        rows.push((row, head));
        data = tail;
    }
    rows
}
