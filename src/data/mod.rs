/// Data layer: core types, loading, and the train/test split.
///
/// Architecture:
/// ```text
///  .csv / .json / .parquet
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → ObservationTable
///   └──────────┘
///        │
///        ▼
///   ┌─────────────────┐
///   │ ObservationTable │  Array2<f64>, column labels
///   └─────────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  split    │  train prefix / test suffix + aligned targets
///   └──────────┘
/// ```

pub mod loader;
pub mod model;
pub mod split;
