//! MongoDB backend.
//!
//! One collection per experiment (named after the experiment id) inside the
//! database named by the last path segment of the connection string. Each
//! record is a document whose selector fields mirror the logical key:
//!
//! ```text
//! { category: "metric", name: "loss", trial_id: 3, values: [BinData, ...] }
//! { category: "trial_id", count: 7 }
//! { category: "parameter", trial_id: 3, value: BinData }
//! ```
//!
//! Wildcard segments are simply omitted from the selector.

use std::sync::OnceLock;

use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument, UpdateOptions};
use mongodb::sync::{Client, Collection};
use serde::{Deserialize, Serialize};

use super::{Backend, BackendKind};
use crate::key::{Category, Key, Segment};
use crate::{Error, Result, TrialId};

const DEFAULT_DATABASE: &str = "trialbook";

const VALUE_FIELD: &str = "value";
const LIST_FIELD: &str = "values";
const COUNT_FIELD: &str = "count";

/// MongoDB-backed store for one experiment.
#[derive(Serialize, Deserialize)]
pub struct MongoBackend {
    experiment_id: String,
    uri: String,
    #[serde(skip)]
    collection: OnceLock<Collection<Document>>,
}

impl std::fmt::Debug for MongoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoBackend")
            .field("experiment_id", &self.experiment_id)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl PartialEq for MongoBackend {
    fn eq(&self, other: &Self) -> bool {
        self.experiment_id == other.experiment_id && self.uri == other.uri
    }
}

impl MongoBackend {
    /// Bind to `uri` (`mongodb://host:port/dbname`). No connection is made
    /// until the first operation.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            uri: uri.into(),
            collection: OnceLock::new(),
        }
    }

    /// Connection string.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Database named by the connection string.
    #[must_use]
    pub fn database_name(&self) -> &str {
        database_name(&self.uri)
    }

    fn collection(&self) -> Result<&Collection<Document>> {
        if let Some(collection) = self.collection.get() {
            return Ok(collection);
        }
        tracing::debug!(uri = %self.uri, "opening mongodb client");
        let client = Client::with_uri_str(&self.uri)?;
        let collection = client
            .database(self.database_name())
            .collection::<Document>(&self.experiment_id);
        Ok(self.collection.get_or_init(|| collection))
    }
}

fn database_name(uri: &str) -> &str {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path = rest.split_once('/').map_or("", |(_, path)| path);
    let name = path.split(['?', '/']).next().unwrap_or("");
    if name.is_empty() {
        DEFAULT_DATABASE
    } else {
        name
    }
}

/// Document selector for a (possibly wildcarded) key.
fn selector(key: &Key) -> Document {
    let mut sel = doc! { "category": key.category().as_str() };
    if let Some(Segment::Exact(name)) = key.name() {
        sel.insert("name", name.as_str());
    }
    if let Some(Segment::Exact(trial_id)) = key.trial() {
        sel.insert("trial_id", trial_to_bson(*trial_id));
    }
    sel
}

#[allow(clippy::cast_possible_wrap)]
fn trial_to_bson(trial_id: TrialId) -> Bson {
    Bson::Int64(trial_id as i64)
}

fn binary(value: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: value,
    }
}

fn bson_bytes(value: &Bson) -> Option<Vec<u8>> {
    match value {
        Bson::Binary(b) => Some(b.bytes.clone()),
        Bson::String(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

#[allow(clippy::cast_sign_loss)]
fn bson_count(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(n) if *n >= 0 => Some(*n as u64),
        Bson::Int64(n) if *n >= 0 => Some(*n as u64),
        _ => None,
    }
}

fn key_from_document(experiment_id: &str, document: &Document) -> Option<Key> {
    let category = Category::from_name(document.get_str("category").ok()?)?;
    let name = document.get_str("name").ok().map(str::to_string);
    let trial = match document.get("trial_id") {
        Some(value) => Some(bson_count(value)?),
        None => None,
    };
    Key::from_parts(experiment_id, category, name, trial)
}

fn upsert() -> UpdateOptions {
    UpdateOptions::builder().upsert(true).build()
}

impl Backend for MongoBackend {
    fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mongo
    }

    fn location(&self) -> String {
        self.uri.clone()
    }

    fn native_key(&self, key: &Key) -> String {
        format!("{}.{}", self.experiment_id, selector(key))
    }

    fn set(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.collection()?.update_one(
            selector(key),
            doc! { "$set": { "value": binary(value) } },
            upsert(),
        )?;
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let Some(document) = self.collection()?.find_one(selector(key), None)? else {
            return Ok(None);
        };
        if let Some(value) = document.get(VALUE_FIELD) {
            return Ok(bson_bytes(value));
        }
        Ok(document
            .get(COUNT_FIELD)
            .and_then(bson_count)
            .map(|n| n.to_string().into_bytes()))
    }

    fn append_list(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.collection()?.update_one(
            selector(key),
            doc! { "$push": { "values": binary(value) } },
            upsert(),
        )?;
        Ok(())
    }

    fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        let Some(document) = self.collection()?.find_one(selector(key), None)? else {
            return Ok(Vec::new());
        };
        match document.get_array(LIST_FIELD) {
            Ok(values) => Ok(values.iter().filter_map(bson_bytes).collect()),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn increment(&self, key: &Key) -> Result<u64> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let document = self
            .collection()?
            .find_one_and_update(selector(key), doc! { "$inc": { "count": 1_i64 } }, options)?
            .ok_or_else(|| Error::StorageError(format!("counter upsert returned nothing: {key}")))?;
        document
            .get(COUNT_FIELD)
            .and_then(bson_count)
            .ok_or_else(|| Error::StorageError(format!("counter is not an integer: {key}")))
    }

    fn keys(&self, pattern: &Key) -> Result<Vec<Key>> {
        let cursor = self.collection()?.find(selector(pattern), None)?;
        let mut keys = Vec::new();
        for document in cursor {
            if let Some(key) = key_from_document(&self.experiment_id, &document?) {
                if pattern.matches(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    fn delete_cache(&self) -> Result<()> {
        self.collection()?.drop(None)?;
        Ok(())
    }
}
