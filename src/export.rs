//! Arrow and Parquet export of history and metric tables.
//!
//! JSON cells are mapped to a single Arrow column type per column:
//! integers to `Int64`, numbers to `Float64`, booleans to `Boolean`, and
//! everything else to `Utf8` (non-string values as JSON text).

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::{Error, Result, Value};

/// Build a nullable Arrow column from JSON cells, inferring one type for
/// the whole column. Absent cells and JSON `null` become Arrow nulls.
#[must_use]
pub fn value_column(cells: &[Option<&Value>]) -> (DataType, ArrayRef) {
    let present: Vec<&Value> = cells.iter().flatten().copied().filter(|v| !v.is_null()).collect();

    let data_type = if present.is_empty() {
        DataType::Utf8
    } else if present.iter().all(|v| v.is_boolean()) {
        DataType::Boolean
    } else if present.iter().all(|v| v.is_i64()) {
        DataType::Int64
    } else if present.iter().all(|v| v.is_number()) {
        DataType::Float64
    } else {
        DataType::Utf8
    };

    let array: ArrayRef = match data_type {
        DataType::Boolean => Arc::new(BooleanArray::from(
            cells.iter().map(|c| c.and_then(Value::as_bool)).collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            cells.iter().map(|c| c.and_then(Value::as_i64)).collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            cells.iter().map(|c| c.and_then(Value::as_f64)).collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(
            cells
                .iter()
                .map(|c| match c {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                })
                .collect::<Vec<_>>(),
        )),
    };
    (data_type, array)
}

/// Write one batch to a Parquet file, replacing it if present.
///
/// # Errors
/// `StorageError` if the file cannot be created or written.
pub fn write_parquet<P: AsRef<Path>>(batch: &RecordBatch, path: P) -> Result<()> {
    let file = File::create(path.as_ref())
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet file: {e}")))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet writer: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| Error::StorageError(format!("Failed to write record batch: {e}")))?;
    writer
        .close()
        .map_err(|e| Error::StorageError(format!("Failed to finish Parquet file: {e}")))?;
    tracing::debug!(path = %path.as_ref().display(), rows = batch.num_rows(), "Wrote Parquet file");
    Ok(())
}

/// Read every batch of a Parquet file.
///
/// # Errors
/// `StorageError` if the file cannot be opened or parsed.
pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<RecordBatch>> {
    let file = File::open(path.as_ref())
        .map_err(|e| Error::StorageError(format!("Failed to open Parquet file: {e}")))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?
        .build()
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

    reader
        .map(|batch| {
            batch.map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;

    #[test]
    fn test_integer_column_with_gaps() {
        let one = json!(1);
        let three = json!(3);
        let (data_type, array) = value_column(&[Some(&one), None, Some(&three)]);
        assert_eq!(data_type, DataType::Int64);
        let ints = array.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ints.value(0), 1);
        assert!(ints.is_null(1));
        assert_eq!(ints.value(2), 3);
    }

    #[test]
    fn test_mixed_numbers_widen_to_float() {
        let a = json!(1);
        let b = json!(2.5);
        let (data_type, array) = value_column(&[Some(&a), Some(&b)]);
        assert_eq!(data_type, DataType::Float64);
        let floats = array.as_any().downcast_ref::<Float64Array>().unwrap();
        assert!((floats.value(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mixed_types_fall_back_to_text() {
        let a = json!("x");
        let b = json!([1, 2]);
        let c = json!(null);
        let (data_type, array) = value_column(&[Some(&a), Some(&b), Some(&c)]);
        assert_eq!(data_type, DataType::Utf8);
        let strings = array.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(strings.value(0), "x");
        assert_eq!(strings.value(1), "[1,2]");
        assert!(strings.is_null(2));
    }

    #[test]
    fn test_empty_column() {
        let (data_type, array) = value_column(&[]);
        assert_eq!(data_type, DataType::Utf8);
        assert_eq!(array.len(), 0);
    }

    #[test]
    fn test_parquet_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![Some(1), None, Some(3)]))],
        )
        .unwrap();

        write_parquet(&batch, &path).unwrap();
        let batches = read_parquet(&path).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], batch);
    }

    #[test]
    fn test_read_missing_file() {
        let err = read_parquet("/nonexistent/trialbook.parquet").unwrap_err();
        assert!(matches!(err, Error::StorageError(_)));
    }
}
