//! Metric series: append-only `(epoch, value)` points keyed by
//! `(metric name, trial id)`.
//!
//! Like trial records, metrics have an in-process realization
//! ([`LocalMetricStore`], snapshotted with the experiment) and a
//! backend-resident one ([`SharedMetricStore`]).
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use trialbook::metric::{LocalMetricStore, MetricManager};
//!
//! # fn main() -> trialbook::Result<()> {
//! let metrics = MetricManager::new(Arc::new(LocalMetricStore::new()));
//! metrics.save("loss", 1, 0, 0.9)?;
//! metrics.save("loss", 1, 1, 0.5)?;
//! metrics.save("loss", 2, 1, 0.4)?;
//!
//! let table = metrics.load("loss", &[1, 2])?;
//! assert_eq!(table.epochs(), &[0, 1]);
//! assert_eq!(table.get(0, 2), None);
//! assert_eq!(table.get(1, 2), Some(0.4));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::Storage;
use crate::key::{validate_key, Key, Segment};
use crate::{Error, Result, TrialId};

/// One metric data point.
///
/// `trial_id` + `key` partition the series, `epoch` orders it, and
/// `timestamp` correlates it with wall-clock time. Non-finite values are
/// stored as the strings `"NaN"`, `"inf"` and `"-inf"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    trial_id: TrialId,
    key: String,
    epoch: u64,
    #[serde(with = "float_repr")]
    value: f64,
    timestamp: DateTime<Utc>,
}

impl MetricRecord {
    /// Create a metric record stamped with the current time.
    #[must_use]
    pub fn new(trial_id: TrialId, key: impl Into<String>, epoch: u64, value: f64) -> Self {
        Self {
            trial_id,
            key: key.into(),
            epoch,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Create a builder for a record with a custom timestamp.
    #[must_use]
    pub fn builder(
        trial_id: TrialId,
        key: impl Into<String>,
        epoch: u64,
        value: f64,
    ) -> MetricRecordBuilder {
        MetricRecordBuilder::new(trial_id, key, epoch, value)
    }

    /// Trial the point belongs to.
    #[must_use]
    pub const fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Metric name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Epoch / step number.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Metric value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// When the point was recorded.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// JSON has no NaN or infinity; label them instead of writing `null`.
mod float_repr {
    use serde::{de, Deserialize, Deserializer, Serializer};

    const NAN: &str = "NaN";
    const INF: &str = "inf";
    const NEG_INF: &str = "-inf";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Label(String),
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value.is_infinite() {
            serializer.serialize_str(if value.is_sign_positive() { INF } else { NEG_INF })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Label(label) => match label.as_str() {
                NAN => Ok(f64::NAN),
                INF => Ok(f64::INFINITY),
                NEG_INF => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!("invalid metric value: {other}"))),
            },
        }
    }
}

/// Builder for [`MetricRecord`].
#[derive(Debug)]
pub struct MetricRecordBuilder {
    record: MetricRecord,
}

impl MetricRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(trial_id: TrialId, key: impl Into<String>, epoch: u64, value: f64) -> Self {
        Self {
            record: MetricRecord::new(trial_id, key, epoch, value),
        }
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    /// Build the record.
    #[must_use]
    pub fn build(self) -> MetricRecord {
        self.record
    }
}

/// Storage contract for metric series.
pub trait MetricStore: Send + Sync + fmt::Debug {
    /// Append one point to its series.
    ///
    /// # Errors
    /// Codec or substrate errors.
    fn append(&self, record: &MetricRecord) -> Result<()>;

    /// Points of one series in insertion order; empty when absent.
    ///
    /// # Errors
    /// Codec or substrate errors.
    fn series(&self, key: &str, trial_id: TrialId) -> Result<Vec<MetricRecord>>;

    /// Whether `key` was saved under any trial.
    ///
    /// # Errors
    /// Substrate errors.
    fn contains_key(&self, key: &str) -> Result<bool>;

    /// Every metric name ever saved, sorted.
    ///
    /// # Errors
    /// Substrate errors.
    fn keys(&self) -> Result<Vec<String>>;
}

/// Serializable state of [`LocalMetricStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalMetricState {
    /// Metric name to per-trial series
    pub series: BTreeMap<String, BTreeMap<TrialId, Vec<MetricRecord>>>,
}

/// In-process realization, snapshotted by the experiment.
#[derive(Debug, Default)]
pub struct LocalMetricStore {
    state: RwLock<LocalMetricState>,
}

impl LocalMetricStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a snapshot.
    #[must_use]
    pub fn from_state(state: LocalMetricState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current state, for snapshotting.
    #[must_use]
    pub fn state(&self) -> LocalMetricState {
        self.state.read().clone()
    }

    /// Total number of stored points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .series
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Check if no point has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricStore for LocalMetricStore {
    fn append(&self, record: &MetricRecord) -> Result<()> {
        self.state
            .write()
            .series
            .entry(record.key.clone())
            .or_default()
            .entry(record.trial_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn series(&self, key: &str, trial_id: TrialId) -> Result<Vec<MetricRecord>> {
        Ok(self
            .state
            .read()
            .series
            .get(key)
            .and_then(|by_trial| by_trial.get(&trial_id))
            .cloned()
            .unwrap_or_default())
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.state.read().series.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.state.read().series.keys().cloned().collect())
    }
}

/// Backend-resident realization: one list per `(metric, trial)`.
#[derive(Debug, Clone)]
pub struct SharedMetricStore {
    storage: Storage,
}

impl SharedMetricStore {
    /// Accessor over `storage`.
    #[must_use]
    pub const fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl MetricStore for SharedMetricStore {
    fn append(&self, record: &MetricRecord) -> Result<()> {
        let key = self.storage.metric_key(&record.key, record.trial_id);
        self.storage.append_object(&key, record)
    }

    fn series(&self, key: &str, trial_id: TrialId) -> Result<Vec<MetricRecord>> {
        self.storage
            .load_list(&self.storage.metric_key(key, trial_id))
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        let pattern = Key::metric(
            self.storage.experiment_id(),
            Segment::Exact(key.to_string()),
            Segment::Wildcard,
        );
        Ok(!self.storage.keys(&pattern)?.is_empty())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let pattern = Key::metric(self.storage.experiment_id(), Segment::Wildcard, Segment::Wildcard);
        let names: BTreeSet<String> = self
            .storage
            .keys(&pattern)?
            .iter()
            .filter_map(|k| k.name_str().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }
}

/// Validating front end over a [`MetricStore`].
#[derive(Debug, Clone)]
pub struct MetricManager {
    store: Arc<dyn MetricStore>,
}

impl MetricManager {
    /// Manage metrics stored in `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    /// Append `(epoch, value)` to the series `(key, trial_id)`.
    ///
    /// # Errors
    /// `InvalidKey` for an empty name or one containing a separator;
    /// substrate errors.
    pub fn save(&self, key: &str, trial_id: TrialId, epoch: u64, value: f64) -> Result<()> {
        validate_key(key, "Metric name")?;
        self.store
            .append(&MetricRecord::new(trial_id, key, epoch, value))
    }

    /// Load `key` for `trial_ids`, aligned on the union of their epochs.
    ///
    /// # Errors
    /// `MetricKeyNotFound` if `key` was never saved; `TrialNotFound` if it
    /// was, but not for one of the requested trials.
    pub fn load(&self, key: &str, trial_ids: &[TrialId]) -> Result<MetricTable> {
        validate_key(key, "Metric name")?;
        let mut series = Vec::with_capacity(trial_ids.len());
        for &trial_id in trial_ids {
            let points = self.store.series(key, trial_id)?;
            if points.is_empty() {
                return Err(if self.store.contains_key(key)? {
                    Error::trial_not_found(trial_id)
                } else {
                    Error::MetricKeyNotFound(key.to_string())
                });
            }
            series.push((trial_id, points));
        }
        Ok(MetricTable::align(key, series))
    }

    /// Every metric name ever saved, sorted.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.store.keys()
    }
}

/// Metric values indexed by epoch (rows) and trial id (columns).
///
/// Missing `(epoch, trial)` combinations are `None`, never zero. When a
/// trial recorded the same epoch more than once, the last point wins.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    key: String,
    trial_ids: Vec<TrialId>,
    epochs: Vec<u64>,
    // row-major: cells[row][column]
    cells: Vec<Vec<Option<f64>>>,
}

impl MetricTable {
    fn align(key: &str, series: Vec<(TrialId, Vec<MetricRecord>)>) -> Self {
        let epochs: BTreeSet<u64> = series
            .iter()
            .flat_map(|(_, points)| points.iter().map(MetricRecord::epoch))
            .collect();
        let epochs: Vec<u64> = epochs.into_iter().collect();
        let row_of: BTreeMap<u64, usize> = epochs.iter().enumerate().map(|(i, e)| (*e, i)).collect();

        let mut cells = vec![vec![None; series.len()]; epochs.len()];
        for (column, (_, points)) in series.iter().enumerate() {
            for point in points {
                cells[row_of[&point.epoch]][column] = Some(point.value);
            }
        }

        Self {
            key: key.to_string(),
            trial_ids: series.into_iter().map(|(id, _)| id).collect(),
            epochs,
            cells,
        }
    }

    /// Metric name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Column labels, in requested order.
    #[must_use]
    pub fn trial_ids(&self) -> &[TrialId] {
        &self.trial_ids
    }

    /// Row index, ascending.
    #[must_use]
    pub fn epochs(&self) -> &[u64] {
        &self.epochs
    }

    /// Value at `(epoch, trial_id)`.
    #[must_use]
    pub fn get(&self, epoch: u64, trial_id: TrialId) -> Option<f64> {
        let row = self.epochs.binary_search(&epoch).ok()?;
        let column = self.trial_ids.iter().position(|t| *t == trial_id)?;
        self.cells[row][column]
    }

    /// One trial's column, aligned to [`MetricTable::epochs`].
    #[must_use]
    pub fn column(&self, trial_id: TrialId) -> Option<Vec<Option<f64>>> {
        let column = self.trial_ids.iter().position(|t| *t == trial_id)?;
        Some(self.cells.iter().map(|row| row[column]).collect())
    }

    /// Rows as `(epoch, values)`.
    pub fn rows(&self) -> impl Iterator<Item = (u64, &[Option<f64>])> {
        self.epochs
            .iter()
            .copied()
            .zip(self.cells.iter().map(Vec::as_slice))
    }

    /// Arrow view: an `Epoch` column then one nullable `Float64` column per
    /// trial, named by trial id.
    ///
    /// # Errors
    /// `Arrow` if the batch cannot be assembled.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = vec![Field::new("Epoch", DataType::UInt64, false)];
        let mut columns: Vec<ArrayRef> = vec![Arc::new(UInt64Array::from(self.epochs.clone()))];
        for (i, trial_id) in self.trial_ids.iter().enumerate() {
            fields.push(Field::new(trial_id.to_string(), DataType::Float64, true));
            let values: Vec<Option<f64>> = self.cells.iter().map(|row| row[i]).collect();
            columns.push(Arc::new(Float64Array::from(values)));
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }
}

impl fmt::Display for MetricTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header: Vec<String> = self.trial_ids.iter().map(ToString::to_string).collect();
        writeln!(f, "Epoch\t{}", header.join("\t"))?;
        for (epoch, values) in self.rows() {
            let cells: Vec<String> = values
                .iter()
                .map(|v| v.map_or_else(|| "NaN".to_string(), |v| v.to_string()))
                .collect();
            writeln!(f, "{epoch}\t{}", cells.join("\t"))?;
        }
        Ok(())
    }
}
