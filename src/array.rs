use serde::{Deserialize, Serialize};

/// Row-major `[rows][cols]` array of doubles produced by every node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Array2D {
    row_count: usize,
    col_count: usize,
    values: Vec<f64>,
}

impl Array2D {
    pub fn scalar(value: f64) -> Self {
        Self {
            row_count: 1,
            col_count: 1,
            values: vec![value],
        }
    }

    pub fn zeros(row_count: usize, col_count: usize) -> Self {
        Self {
            row_count,
            col_count,
            values: vec![0.0; row_count * col_count],
        }
    }

    /// Builds from a flat row-major buffer.
    ///
    /// # Panics
    ///
    /// If `values.len() != row_count * col_count`.
    pub fn from_vec(row_count: usize, col_count: usize, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), row_count * col_count);
        Self {
            row_count,
            col_count,
            values,
        }
    }

    /// Stacks rows, padding short rows with zeros to the widest row.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Self {
        let col_count = rows.iter().map(|r| r.as_ref().len()).max().unwrap_or(0);
        let mut values = Vec::with_capacity(rows.len() * col_count);
        for row in rows {
            let row = row.as_ref();
            values.extend_from_slice(row);
            values.extend(std::iter::repeat(0.0).take(col_count - row.len()));
        }
        Self {
            row_count: rows.len(),
            col_count,
            values,
        }
    }

    /// Stacks measured rows without inventing values. Rows of equal length
    /// become a matrix; rows of unequal length (fractions with different scan
    /// counts) are concatenated into a single column, so reductions only see
    /// measured values.
    pub fn stack_rows<R: AsRef<[f64]>>(rows: &[R]) -> Self {
        let width = rows.first().map_or(0, |r| r.as_ref().len());
        if rows.iter().all(|r| r.as_ref().len() == width) {
            return Self::from_rows(rows);
        }
        let values: Vec<f64> = rows
            .iter()
            .flat_map(|r| r.as_ref().iter().copied())
            .collect();
        Self {
            row_count: values.len(),
            col_count: 1,
            values,
        }
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn col_count(&self) -> usize {
        self.col_count
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.row_count, self.col_count)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        (row < self.row_count && col < self.col_count)
            .then(|| self.values[row * self.col_count + col])
    }

    /// # Panics
    ///
    /// If `row >= self.row_count()`.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.col_count..(row + 1) * self.col_count]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.row_count).map(move |r| self.row(r))
    }

    /// All elements in row-major order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Elements of one column, top to bottom.
    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.row_count).filter_map(move |r| self.get(r, col))
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.rows().map(<[f64]>::to_vec).collect()
    }

    /// Broadcast read: a dimension of size 1 repeats along that axis.
    pub(crate) fn broadcast_get(&self, row: usize, col: usize) -> f64 {
        let r = if self.row_count == 1 { 0 } else { row };
        let c = if self.col_count == 1 { 0 } else { col };
        self.values[r * self.col_count + c]
    }
}

impl From<Vec<Vec<f64>>> for Array2D {
    fn from(rows: Vec<Vec<f64>>) -> Self {
        Self::from_rows(&rows)
    }
}
