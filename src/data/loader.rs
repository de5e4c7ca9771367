use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, Float32Array, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::DataType;
use log::info;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::ObservationTable;
use crate::error::HarnessError;

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load an observation table from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – numeric columns, one row per time step
/// * `.json`    – `[{ "open": 1.0, "close": 2.0 }, ...]`
/// * anything else – delimited text split on `delimiter`
pub fn load_file(path: &Path, delimiter: u8) -> crate::error::Result<ObservationTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let table = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        _ => load_delimited(path, delimiter),
    }
    .and_then(|table| {
        if table.is_empty() {
            bail!("no data rows");
        }
        Ok(table)
    })
    .map_err(|e| HarnessError::data_load(path, e))?;

    info!("loaded {} from {}", table, path.display());
    Ok(table)
}

// ---------------------------------------------------------------------------
// Delimited text loader
// ---------------------------------------------------------------------------

/// Delimited layout: an optional header row followed by numeric rows.
///
/// The first record counts as a header when any of its fields is not a
/// number. Every later record must match its width.
fn load_delimited(path: &Path, delimiter: u8) -> Result<ObservationTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .context("opening delimited file")?;

    let mut records = reader.records();
    let first = match records.next() {
        Some(record) => record.context("reading first row")?,
        None => bail!("file is empty"),
    };

    let mut rows: Vec<Vec<f64>> = Vec::new();
    let column_names = if first.iter().all(|field| parse_finite(field).is_some()) {
        rows.push(parse_numeric_record(&first, 1)?);
        ObservationTable::default_column_names(first.len())
    } else {
        first.iter().map(|h| h.to_string()).collect()
    };
    let width = column_names.len();

    for result in records {
        let record = result.context("reading row")?;
        // csv positions are 1-based line numbers
        let line = record.position().map(|p| p.line()).unwrap_or(0) as usize;
        if record.len() != width {
            bail!(
                "line {line}: expected {width} fields but found {}",
                record.len()
            );
        }
        rows.push(parse_numeric_record(&record, line)?);
    }

    ObservationTable::from_rows(column_names, rows)
}

fn parse_finite(tok: &str) -> Option<f64> {
    tok.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_numeric_record(record: &csv::StringRecord, line: usize) -> Result<Vec<f64>> {
    record
        .iter()
        .enumerate()
        .map(|(j, tok)| -> Result<f64> {
            let value = tok
                .parse::<f64>()
                .with_context(|| format!("line {line}, field {j}: '{tok}' is not a number"))?;
            if !value.is_finite() {
                bail!("line {line}, field {j}: '{tok}' is not a finite number");
            }
            Ok(value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, the default `df.to_json(orient='records')`):
///
/// ```json
/// [
///   { "open": 101.2, "close": 102.0 },
///   { "open": 102.0, "close": 101.7 }
/// ]
/// ```
///
/// Columns are ordered by key name.
fn load_json(path: &Path) -> Result<ObservationTable> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root.as_array().context("Expected top-level JSON array")?;
    let first = records
        .first()
        .and_then(|r| r.as_object())
        .context("Expected at least one JSON object")?;
    let column_names: Vec<String> = first.keys().cloned().collect();

    let mut rows = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;
        if obj.len() != column_names.len() {
            bail!(
                "Row {i}: expected {} fields but found {}",
                column_names.len(),
                obj.len()
            );
        }
        let row = column_names
            .iter()
            .map(|col| {
                obj.get(col)
                    .and_then(|v| v.as_f64())
                    .with_context(|| format!("Row {i}, '{col}': missing or not a number"))
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }

    ObservationTable::from_rows(column_names, rows)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file whose columns are all numeric.
///
/// Int32/Int64/Float32/Float64 columns are widened to `f64`. Nulls and any
/// other column type are rejected.
fn load_parquet(path: &Path) -> Result<ObservationTable> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let column_names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build().context("building parquet reader")?;

    let mut rows: Vec<Vec<f64>> = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let columns = batch
            .columns()
            .iter()
            .zip(&column_names)
            .map(|(col, name)| {
                numeric_column(col).with_context(|| format!("column '{name}'"))
            })
            .collect::<Result<Vec<Vec<f64>>>>()?;

        for (col, name) in columns.iter().zip(&column_names) {
            if let Some(v) = col.iter().find(|v| !v.is_finite()) {
                bail!("column '{name}': {v} is not a finite number");
            }
        }
        for row in 0..batch.num_rows() {
            rows.push(columns.iter().map(|col| col[row]).collect());
        }
    }

    ObservationTable::from_rows(column_names, rows)
}

// -- Parquet / Arrow helpers --

/// Widen a primitive numeric Arrow column to `Vec<f64>`.
fn numeric_column(col: &Arc<dyn Array>) -> Result<Vec<f64>> {
    if col.null_count() > 0 {
        bail!("contains {} null values", col.null_count());
    }
    let values = match col.data_type() {
        DataType::Float64 => downcast::<Float64Array>(col)?.values().to_vec(),
        DataType::Float32 => downcast::<Float32Array>(col)?
            .values()
            .iter()
            .map(|&v| v as f64)
            .collect(),
        DataType::Int64 => downcast::<Int64Array>(col)?
            .values()
            .iter()
            .map(|&v| v as f64)
            .collect(),
        DataType::Int32 => downcast::<Int32Array>(col)?
            .values()
            .iter()
            .map(|&v| v as f64)
            .collect(),
        other => bail!("expected a numeric column, got {other:?}"),
    };
    Ok(values)
}

fn downcast<T: 'static>(col: &Arc<dyn Array>) -> Result<&T> {
    col.as_any()
        .downcast_ref::<T>()
        .context("unexpected Arrow array layout")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;
    use tempfile::{Builder, NamedTempFile};

    use super::*;

    fn write_temp(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn csv_with_header_uses_labels() {
        let file = write_temp(".csv", "open,close\n1.0,2.0\n3.0,4.5\n");
        let table = load_file(file.path(), b',').unwrap();
        assert_eq!(table.column_names(), ["open", "close"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.view()[[1, 1]], 4.5);
    }

    #[test]
    fn csv_without_header_keeps_first_row() {
        let file = write_temp(".csv", "1,2\n3,4\n5,6\n");
        let table = load_file(file.path(), b',').unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.column_names(), ["col_0", "col_1"]);
        assert_eq!(table.view()[[0, 0]], 1.0);
    }

    #[test]
    fn custom_delimiter() {
        let file = write_temp(".txt", "a;b\n1;2\n");
        let table = load_file(file.path(), b';').unwrap();
        assert_eq!(table.width(), 2);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let file = write_temp(".csv", "a,b\n1,2\n3\n");
        let err = load_file(file.path(), b',').unwrap_err();
        assert!(matches!(err, HarnessError::DataLoad { .. }));
        assert!(err.to_string().contains("expected 2 fields"));
    }

    #[test]
    fn non_numeric_cells_are_rejected() {
        let file = write_temp(".csv", "a,b\n1,2\n3,oops\n");
        let err = load_file(file.path(), b',').unwrap_err();
        assert!(matches!(err, HarnessError::DataLoad { .. }));
        assert!(err.to_string().contains("'oops' is not a number"));
    }

    #[test]
    fn non_finite_cells_are_rejected() {
        for cell in ["NaN", "inf", "-inf", "nan"] {
            let file = write_temp(".csv", &format!("a,b\n1,2\n3,{cell}\n"));
            let err = load_file(file.path(), b',').unwrap_err();
            assert!(matches!(err, HarnessError::DataLoad { .. }));
            assert!(err.to_string().contains("is not a finite number"), "{err}");
        }
    }

    #[test]
    fn non_finite_first_row_is_a_header() {
        let file = write_temp(".csv", "nan,inf\n1,2\n");
        let table = load_file(file.path(), b',').unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.column_names(), ["nan", "inf"]);
    }

    #[test]
    fn header_only_file_is_rejected() {
        let file = write_temp(".csv", "a,b\n");
        let err = load_file(file.path(), b',').unwrap_err();
        assert!(err.to_string().contains("no data rows"));
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = load_file(Path::new("/definitely/not/here.csv"), b',').unwrap_err();
        assert!(matches!(err, HarnessError::DataLoad { .. }));
    }

    #[test]
    fn json_records() {
        let file = write_temp(".json", r#"[{"x": 1.0, "y": 2}, {"x": 3.5, "y": 4}]"#);
        let table = load_file(file.path(), b',').unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.view()[[1, 0]], 3.5);
        assert_eq!(table.view()[[0, 1]], 2.0);
    }

    #[test]
    fn json_missing_field_is_rejected() {
        let file = write_temp(".json", r#"[{"x": 1.0, "y": 2}, {"x": 3.5, "z": 4}]"#);
        assert!(load_file(file.path(), b',').is_err());
    }

    #[test]
    fn parquet_numeric_columns() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("price", DataType::Float64, false),
            Field::new("volume", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Float64Array::from(vec![10.0, 11.0, 12.5])),
                Arc::new(Int64Array::from(vec![100, 200, 300])),
            ],
        )
        .unwrap();
        let file = Builder::new().suffix(".parquet").tempfile().unwrap();
        let mut writer = ArrowWriter::try_new(file.reopen().unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let table = load_file(file.path(), b',').unwrap();
        assert_eq!(table.column_names(), ["price", "volume"]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.view()[[2, 0]], 12.5);
        assert_eq!(table.view()[[1, 1]], 200.0);
    }
}
