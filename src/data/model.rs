use std::fmt;

use anyhow::{Context, Result};
use ndarray::{s, Array2, ArrayView2};

// ---------------------------------------------------------------------------
// ObservationTable – the complete loaded dataset
// ---------------------------------------------------------------------------

/// A time-ordered table of numeric observations (rows × columns).
///
/// Built once by the loader and read-only afterwards; the splitter and the
/// evaluator only ever hand out views into it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationTable {
    /// Column labels, from the header row or synthesised as `col_<i>`.
    column_names: Vec<String>,
    /// Row-major values, one row per time step.
    values: Array2<f64>,
}

impl ObservationTable {
    /// Build a table from labelled rows. Every row must have
    /// `column_names.len()` values.
    pub fn from_rows(column_names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        let width = column_names.len();
        let height = rows.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let values = Array2::from_shape_vec((height, width), flat)
            .context("rows do not match the column count")?;
        Ok(ObservationTable {
            column_names,
            values,
        })
    }

    /// Build a table from an existing matrix.
    #[cfg(test)]
    pub fn from_array(column_names: Vec<String>, values: Array2<f64>) -> Self {
        debug_assert_eq!(column_names.len(), values.ncols());
        ObservationTable {
            column_names,
            values,
        }
    }

    /// Synthesised labels for header-less sources.
    pub fn default_column_names(width: usize) -> Vec<String> {
        (0..width).map(|i| format!("col_{i}")).collect()
    }

    /// Number of rows (time steps).
    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    /// Number of columns (features per time step).
    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    #[cfg(test)]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// The whole table as a matrix view.
    #[cfg(test)]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Rows `[start, end)`. Panics on out-of-range bounds like slice indexing.
    pub fn rows(&self, start: usize, end: usize) -> ArrayView2<'_, f64> {
        self.values.slice(s![start..end, ..])
    }
}

impl fmt::Display for ObservationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows x {} columns [{}]",
            self.len(),
            self.width(),
            self.column_names.join(", ")
        )
    }
}
