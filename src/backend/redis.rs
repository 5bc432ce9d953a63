//! Redis backend.
//!
//! Keys are colon-joined (`<experiment_id>:<category>:<sub_key...>`), lists
//! are Redis lists, the trial counter uses `INCR`, and wildcard lookups
//! walk the keyspace with `SCAN`. The client is created
//! on first use and is never serialized; a deserialized backend reconnects
//! from its connection string.

use std::sync::OnceLock;

use parking_lot::Mutex;
use redis::Commands;
use serde::{Deserialize, Serialize};

use super::{Backend, BackendKind};
use crate::key::Key;
use crate::{Error, Result};

/// Redis-backed store for one experiment.
#[derive(Serialize, Deserialize)]
pub struct RedisBackend {
    experiment_id: String,
    uri: String,
    #[serde(skip)]
    client: OnceLock<redis::Client>,
    #[serde(skip)]
    connection: Mutex<Option<redis::Connection>>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("experiment_id", &self.experiment_id)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl PartialEq for RedisBackend {
    fn eq(&self, other: &Self) -> bool {
        self.experiment_id == other.experiment_id && self.uri == other.uri
    }
}

impl RedisBackend {
    /// Bind to `uri` (`redis://`, `rediss://`, `unix://`). No connection is
    /// made until the first operation.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            uri: uri.into(),
            client: OnceLock::new(),
            connection: Mutex::new(None),
        }
    }

    /// Connection string.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn client(&self) -> Result<&redis::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = redis::Client::open(self.uri.as_str())?;
        Ok(self.client.get_or_init(|| client))
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut guard = self.connection.lock();
        if guard.is_none() {
            tracing::debug!(uri = %self.uri, "opening redis connection");
            *guard = Some(self.client()?.get_connection()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(Error::StorageError("redis connection unavailable".into()));
        };
        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *guard = None;
                }
                Err(e.into())
            }
        }
    }
}

impl RedisBackend {
    /// Native keys matching a glob, collected with cursor-based `SCAN`.
    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.with_connection(|c| {
            c.scan_match::<_, String>(pattern)
                .map(Iterator::collect::<Vec<_>>)
        })
    }
}

impl Backend for RedisBackend {
    fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn location(&self) -> String {
        self.uri.clone()
    }

    fn native_key(&self, key: &Key) -> String {
        key.to_colon_string()
    }

    fn set(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        let k = key.to_colon_string();
        self.with_connection(|c| c.set::<_, _, ()>(k, value))
    }

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let k = key.to_colon_string();
        self.with_connection(|c| c.get::<_, Option<Vec<u8>>>(k))
    }

    fn append_list(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        let k = key.to_colon_string();
        self.with_connection(|c| c.rpush::<_, _, ()>(k, value))
    }

    fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        let k = key.to_colon_string();
        self.with_connection(|c| c.lrange::<_, Vec<Vec<u8>>>(k, 0, -1))
    }

    fn increment(&self, key: &Key) -> Result<u64> {
        let k = key.to_colon_string();
        self.with_connection(|c| c.incr::<_, _, u64>(k, 1_u64))
    }

    fn keys(&self, pattern: &Key) -> Result<Vec<Key>> {
        let raw = self.scan_keys(&pattern.to_colon_string())?;
        Ok(raw
            .iter()
            .filter_map(|k| Key::parse_colon(&self.experiment_id, k))
            .filter(|k| pattern.matches(k))
            .collect())
    }

    fn delete_cache(&self) -> Result<()> {
        let keys = self.scan_keys(&format!("{}:*", self.experiment_id))?;
        if keys.is_empty() {
            return Ok(());
        }
        self.with_connection(|c| c.del::<_, ()>(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Segment;

    #[test]
    fn test_serialization_skips_client() {
        let backend = RedisBackend::new("exp", "redis://localhost:6379/0");
        let json = serde_json::to_value(&backend).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"experiment_id": "exp", "uri": "redis://localhost:6379/0"})
        );
        let restored: RedisBackend = serde_json::from_value(json).unwrap();
        assert_eq!(restored, backend);
        assert!(restored.client.get().is_none());
    }

    #[test]
    fn test_native_key() {
        let backend = RedisBackend::new("myexp", "redis://localhost:6379/0");
        let key = Key::metric("myexp", Segment::Exact("loss".into()), Segment::Exact(3));
        assert_eq!(backend.native_key(&key), "myexp:metric:loss:3");
    }

    fn live_backend(experiment_id: &str) -> Option<RedisBackend> {
        std::env::var("TRIALBOOK_TEST_REDIS")
            .ok()
            .map(|uri| RedisBackend::new(experiment_id, uri))
    }

    #[test]
    #[ignore = "requires TRIALBOOK_TEST_REDIS"]
    fn test_live_contract() {
        let Some(b) = live_backend("trialbook_redis_unit") else {
            return;
        };
        b.delete_cache().unwrap();

        let counter = Key::trial_counter("trialbook_redis_unit");
        assert_eq!(b.increment(&counter).unwrap(), 1);
        assert_eq!(b.increment(&counter).unwrap(), 2);

        let list = Key::metric("trialbook_redis_unit", Segment::Exact("loss".into()), Segment::Exact(1));
        assert!(b.get_list(&list).unwrap().is_empty());
        b.append_list(&list, b"a".to_vec()).unwrap();
        assert_eq!(b.get_list(&list).unwrap(), vec![b"a".to_vec()]);

        let pattern = Key::metric("trialbook_redis_unit", Segment::Wildcard, Segment::Wildcard);
        assert_eq!(b.keys(&pattern).unwrap(), vec![list.clone()]);

        // more keys than one SCAN page
        let mut expected = vec![list];
        for trial in 2..=40 {
            let key = Key::metric("trialbook_redis_unit", Segment::Exact("acc".into()), Segment::Exact(trial));
            b.append_list(&key, b"x".to_vec()).unwrap();
            expected.push(key);
        }
        let mut found = b.keys(&pattern).unwrap();
        found.sort();
        expected.sort();
        assert_eq!(found, expected);

        b.delete_cache().unwrap();
    }
}
