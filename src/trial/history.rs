//! Trial history table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, TimestampMicrosecondArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use serde_json::json;

use super::records::ParameterSnapshot;
use super::TrialResult;
use crate::export::value_column;
use crate::{Result, TrialId, Value};

/// Leading column of the history table.
pub const TRIAL_ID_COLUMN: &str = "Trial ID";

/// Result columns, in the order they follow the parameter columns.
pub const RESULT_COLUMNS: [&str; 7] = [
    "Seed",
    "Result",
    "Result Type",
    "Success",
    "Finished",
    "Process Time",
    "Description",
];

/// One trial's row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    trial_id: TrialId,
    parameters: ParameterSnapshot,
    result: TrialResult,
}

impl HistoryRow {
    /// Trial id.
    #[must_use]
    pub const fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Parameter snapshot (empty if none survived).
    #[must_use]
    pub const fn parameters(&self) -> &ParameterSnapshot {
        &self.parameters
    }

    /// Result record.
    #[must_use]
    pub const fn result(&self) -> &TrialResult {
        &self.result
    }

    /// Cell value by column name. `None` marks an absent cell (a parameter
    /// missing from this trial's snapshot, the result of a failed trial, or
    /// the description of a successful one).
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Value> {
        let r = &self.result;
        match column {
            "Seed" => Some(json!(r.seed())),
            "Result" => r.is_success().then(|| r.result().clone()),
            "Result Type" => Some(json!(r.result_type())),
            "Success" => Some(json!(r.is_success())),
            "Finished" => Some(json!(r.finished().to_rfc3339())),
            "Process Time" => Some(json!(r.process_time().as_secs_f64())),
            "Description" => r.description().map(|d| json!(d)),
            name => self.parameters.get(name).cloned(),
        }
    }
}

/// Parameter and result history, one row per finished trial, ascending by id.
///
/// Rows come from the result side: a trial with a result but no parameter
/// snapshot still appears (with empty parameter cells).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    parameter_columns: Vec<String>,
    rows: Vec<HistoryRow>,
}

impl History {
    /// Join parameter and result histories on trial id.
    #[must_use]
    pub fn join(
        mut parameters: BTreeMap<TrialId, ParameterSnapshot>,
        results: BTreeMap<TrialId, TrialResult>,
    ) -> Self {
        let rows: Vec<HistoryRow> = results
            .into_iter()
            .map(|(trial_id, result)| HistoryRow {
                trial_id,
                parameters: parameters.remove(&trial_id).unwrap_or_default(),
                result,
            })
            .collect();
        let parameter_columns: BTreeSet<&String> =
            rows.iter().flat_map(|r| r.parameters.keys()).collect();
        Self {
            parameter_columns: parameter_columns.into_iter().cloned().collect(),
            rows,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in trial-id order.
    #[must_use]
    pub fn rows(&self) -> &[HistoryRow] {
        &self.rows
    }

    /// Row for `trial_id`.
    #[must_use]
    pub fn row(&self, trial_id: TrialId) -> Option<&HistoryRow> {
        self.rows
            .binary_search_by_key(&trial_id, |r| r.trial_id)
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Trial ids in order.
    #[must_use]
    pub fn trial_ids(&self) -> Vec<TrialId> {
        self.rows.iter().map(|r| r.trial_id).collect()
    }

    /// Parameter column names (sorted).
    #[must_use]
    pub fn parameter_columns(&self) -> &[String] {
        &self.parameter_columns
    }

    /// All column names: parameters, then [`RESULT_COLUMNS`].
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        self.parameter_columns
            .iter()
            .cloned()
            .chain(RESULT_COLUMNS.iter().map(|c| (*c).to_string()))
            .collect()
    }

    /// Cell lookup.
    #[must_use]
    pub fn value(&self, trial_id: TrialId, column: &str) -> Option<Value> {
        self.row(trial_id).and_then(|r| r.get(column))
    }

    /// Arrow view: `Trial ID`, parameter columns (type inferred per column),
    /// then the result columns.
    ///
    /// # Errors
    /// `Arrow` if the batch cannot be assembled.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = vec![Field::new(TRIAL_ID_COLUMN, DataType::UInt64, false)];
        let mut columns: Vec<ArrayRef> = vec![Arc::new(UInt64Array::from(self.trial_ids()))];

        for name in &self.parameter_columns {
            let cells: Vec<Option<&Value>> =
                self.rows.iter().map(|r| r.parameters.get(name)).collect();
            let (data_type, array) = value_column(&cells);
            fields.push(Field::new(name, data_type, true));
            columns.push(array);
        }

        let results: Vec<&TrialResult> = self.rows.iter().map(|r| &r.result).collect();

        fields.push(Field::new("Seed", DataType::UInt32, false));
        columns.push(Arc::new(UInt32Array::from(
            results.iter().map(|r| r.seed()).collect::<Vec<_>>(),
        )));

        let cells: Vec<Option<&Value>> = results
            .iter()
            .map(|r| r.is_success().then(|| r.result()))
            .collect();
        let (data_type, array) = value_column(&cells);
        fields.push(Field::new("Result", data_type, true));
        columns.push(array);

        fields.push(Field::new("Result Type", DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(
            results.iter().map(|r| r.result_type()).collect::<Vec<_>>(),
        )));

        fields.push(Field::new("Success", DataType::Boolean, false));
        columns.push(Arc::new(BooleanArray::from(
            results.iter().map(|r| r.is_success()).collect::<Vec<_>>(),
        )));

        fields.push(Field::new(
            "Finished",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ));
        columns.push(Arc::new(
            TimestampMicrosecondArray::from(
                results
                    .iter()
                    .map(|r| r.finished().timestamp_micros())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ));

        fields.push(Field::new("Process Time", DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(
            results
                .iter()
                .map(|r| r.process_time().as_secs_f64())
                .collect::<Vec<_>>(),
        )));

        fields.push(Field::new("Description", DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(
            results.iter().map(|r| r.description()).collect::<Vec<_>>(),
        )));

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns = self.columns();
        writeln!(f, "Trial ID\t{}", columns.join("\t"))?;
        for row in &self.rows {
            let cells: Vec<String> = columns
                .iter()
                .map(|c| row.get(c).map_or_else(|| "-".to_string(), |v| v.to_string()))
                .collect();
            writeln!(f, "{}\t{}", row.trial_id, cells.join("\t"))?;
        }
        Ok(())
    }
}
