use ndarray::ArrayView2;

use super::model::ObservationTable;
use crate::error::{HarnessError, Result};

// ---------------------------------------------------------------------------
// Split point
// ---------------------------------------------------------------------------

/// Chronological train/test partition of an [`ObservationTable`].
///
/// The test region starts `lookback_period` rows before the held-out suffix
/// so its first window already has full history. Targets are the rows each
/// region's sliding windows predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalSplit {
    pub total_length: usize,
    pub train_length: usize,
    pub test_length: usize,
    pub lookback_period: usize,
}

impl TemporalSplit {
    /// Compute the split for `total_length` rows.
    ///
    /// `None` and `Some(0.0)` both mean "no test segment".
    pub fn new(
        total_length: usize,
        test_fraction: Option<f64>,
        lookback_period: usize,
    ) -> Result<Self> {
        if lookback_period == 0 {
            return Err(HarnessError::InvalidSplit(
                "lookback period must be at least 1".into(),
            ));
        }

        let test_length = match test_fraction {
            None => 0,
            Some(f) if f == 0.0 => 0,
            Some(f) if !f.is_finite() || !(0.0..1.0).contains(&f) => {
                return Err(HarnessError::InvalidSplit(format!(
                    "test fraction must lie in [0, 1), got {f}"
                )));
            }
            Some(f) => {
                let n = (total_length as f64 * f).floor() as usize;
                if n == 0 {
                    return Err(HarnessError::InvalidSplit(format!(
                        "test fraction {f} of {total_length} rows leaves an empty test set"
                    )));
                }
                n
            }
        };
        let train_length = total_length - test_length;

        if lookback_period >= train_length {
            return Err(HarnessError::InvalidSplit(format!(
                "lookback period {lookback_period} needs more than the {train_length} training rows"
            )));
        }

        Ok(TemporalSplit {
            total_length,
            train_length,
            test_length,
            lookback_period,
        })
    }

    /// Whether a held-out segment exists.
    pub fn has_test(&self) -> bool {
        self.test_length > 0
    }

    /// Row range fed to the forecaster for fitting and in-sample scoring.
    pub fn train_range(&self) -> (usize, usize) {
        (0, self.train_length)
    }

    /// Ground truth aligned with predictions over the training region.
    pub fn train_target_range(&self) -> (usize, usize) {
        (self.lookback_period, self.train_length)
    }

    /// Input rows for test predictions, extended backward by the lookback.
    pub fn test_range(&self) -> Option<(usize, usize)> {
        self.has_test()
            .then(|| (self.train_length - self.lookback_period, self.total_length))
    }

    /// Ground truth aligned with predictions over the test region.
    pub fn test_target_range(&self) -> Option<(usize, usize)> {
        self.has_test()
            .then(|| (self.train_length, self.total_length))
    }
}

// ---------------------------------------------------------------------------
// Views over a table
// ---------------------------------------------------------------------------

/// One scoring window: the forecaster input and the rows it should predict.
#[derive(Debug, Clone)]
pub struct Segment<'a> {
    pub input: ArrayView2<'a, f64>,
    pub target: ArrayView2<'a, f64>,
}

/// Borrowed train/test segments of a loaded table.
#[derive(Debug, Clone)]
pub struct SplitData<'a> {
    pub split: TemporalSplit,
    pub train: Segment<'a>,
    pub test: Option<Segment<'a>>,
}

impl<'a> SplitData<'a> {
    pub fn new(
        table: &'a ObservationTable,
        test_fraction: Option<f64>,
        lookback_period: usize,
    ) -> Result<Self> {
        let split = TemporalSplit::new(table.len(), test_fraction, lookback_period)?;

        let segment = |input: (usize, usize), target: (usize, usize)| Segment {
            input: table.rows(input.0, input.1),
            target: table.rows(target.0, target.1),
        };

        let train = segment(split.train_range(), split.train_target_range());
        let test = split
            .test_range()
            .zip(split.test_target_range())
            .map(|(input, target)| segment(input, target));

        Ok(SplitData { split, train, test })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn table(rows: usize) -> ObservationTable {
        let values = Array2::from_shape_fn((rows, 2), |(r, c)| (r * 10 + c) as f64 + 1.0);
        ObservationTable::from_array(ObservationTable::default_column_names(2), values)
    }

    #[test]
    fn reference_scenario() {
        let split = TemporalSplit::new(110, Some(0.1), 20).unwrap();
        assert_eq!(split.test_length, 11);
        assert_eq!(split.train_length, 99);
        assert_eq!(split.test_range(), Some((79, 110)));
        let (start, end) = split.test_range().unwrap();
        assert_eq!(end - start, 31);
    }

    #[test]
    fn lengths_add_up_across_inputs() {
        for total in [10usize, 37, 110, 1000] {
            for fraction in [0.05, 0.1, 0.25, 0.5, 0.9] {
                for lookback in [1usize, 3, 8] {
                    let Ok(split) = TemporalSplit::new(total, Some(fraction), lookback) else {
                        continue;
                    };
                    assert_eq!(split.train_length + split.test_length, total);
                    let (start, end) = split.test_range().unwrap();
                    assert_eq!(end - start, split.test_length + lookback);
                    let (t0, t1) = split.train_target_range();
                    assert_eq!(t1 - t0, split.train_length - lookback);
                }
            }
        }
    }

    #[test]
    fn no_fraction_means_no_test() {
        for fraction in [None, Some(0.0)] {
            let split = TemporalSplit::new(50, fraction, 5).unwrap();
            assert!(!split.has_test());
            assert_eq!(split.train_length, 50);
            assert_eq!(split.test_range(), None);
        }
    }

    #[test]
    fn lookback_longer_than_history_fails() {
        let err = TemporalSplit::new(110, None, 200).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidSplit(_)));
        // equal is also too long: no window would have a target
        assert!(TemporalSplit::new(99, None, 99).is_err());
    }

    #[test]
    fn fraction_rounding_to_zero_fails() {
        let err = TemporalSplit::new(5, Some(0.1), 1).unwrap_err();
        assert!(err.to_string().contains("empty test set"));
    }

    #[test]
    fn out_of_range_fraction_fails() {
        for fraction in [-0.1, 1.0, 1.5, f64::NAN] {
            assert!(TemporalSplit::new(100, Some(fraction), 5).is_err());
        }
    }

    #[test]
    fn zero_lookback_fails() {
        assert!(TemporalSplit::new(100, None, 0).is_err());
    }

    #[test]
    fn segments_are_aligned() {
        let t = table(20);
        let data = SplitData::new(&t, Some(0.25), 3).unwrap();
        assert_eq!(data.train.input.nrows(), 15);
        assert_eq!(data.train.target.nrows(), 12);
        // first training target is the row right after the first window
        assert_eq!(data.train.target[[0, 0]], t.view()[[3, 0]]);

        let test = data.test.unwrap();
        assert_eq!(test.input.nrows(), 8);
        assert_eq!(test.target.nrows(), 5);
        assert_eq!(test.input[[0, 0]], t.view()[[12, 0]]);
        assert_eq!(test.target[[0, 0]], t.view()[[15, 0]]);
        assert_eq!(test.input.nrows() - 3, test.target.nrows());
    }

    #[test]
    fn whole_table_is_training_without_fraction() {
        let t = table(50);
        let data = SplitData::new(&t, None, 4).unwrap();
        assert_eq!(data.train.input.nrows(), 50);
        assert_eq!(data.train.target.nrows(), 46);
        assert!(data.test.is_none());
    }
}
