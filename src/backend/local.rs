//! Local filesystem backend.
//!
//! Layout under `<cache_root>/<experiment_id>/`:
//!
//! ```text
//! <experiment_id>.json                          whole-experiment snapshot
//! code/<experiment_id>_<trial_id>.rs
//! environment/<collector>_<experiment_id>_<trial_id>.<ext>
//! persist/<experiment_id>_<step>_<trial_id>.json
//! parameter/<experiment_id>_<trial_id>.json
//! history/<experiment_id>_<trial_id>.json
//! metric/<experiment_id>_<metric>_<trial_id>.bin
//! step_hash/<experiment_id>_<step>-<fingerprint>.txt
//! trial_id/<experiment_id>.txt
//! ```
//!
//! Lists are stored as length-prefixed frames (`u32` little endian).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{Backend, BackendKind};
use crate::environment;
use crate::key::{Category, Key};
use crate::{Error, Result, TrialId};

/// Files under a per-experiment cache directory.
#[derive(Debug)]
pub struct LocalBackend {
    experiment_id: String,
    cache_dir: PathBuf,
    counter_lock: Mutex<()>,
}

impl LocalBackend {
    /// Open (and create, if needed) `<cache_root>/<experiment_id>`.
    ///
    /// # Errors
    /// `Io` if the directory cannot be created, or a file occupies its path.
    pub fn open(experiment_id: &str, cache_root: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_root.into().join(experiment_id);
        maybe_create_dir("cache", &cache_dir)?;
        Ok(Self {
            experiment_id: experiment_id.to_string(),
            cache_dir,
            counter_lock: Mutex::new(()),
        })
    }

    /// Experiment directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Snapshot file path.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.json", self.experiment_id))
    }

    fn category_dir(&self, category: Category) -> PathBuf {
        self.cache_dir.join(category.as_str())
    }

    fn extension(key: &Key) -> &'static str {
        match key.category() {
            Category::Code => "rs",
            Category::Environment => key.name_str().map_or("txt", environment::file_extension),
            Category::Metric => "bin",
            Category::StepHash | Category::TrialId => "txt",
            Category::Parameter | Category::History | Category::Persist => "json",
        }
    }

    /// File path of a concrete key.
    #[must_use]
    pub fn path(&self, key: &Key) -> PathBuf {
        let exp = &self.experiment_id;
        let name = key.name_str().unwrap_or("*");
        let trial = key
            .trial_id()
            .map_or_else(|| "*".to_string(), |t| t.to_string());
        let stem = match key.category() {
            Category::TrialId => exp.clone(),
            Category::Parameter | Category::History | Category::Code => format!("{exp}_{trial}"),
            Category::Metric | Category::Persist => format!("{exp}_{name}_{trial}"),
            Category::Environment => format!("{name}_{exp}_{trial}"),
            Category::StepHash => format!("{exp}_{name}"),
        };
        self.category_dir(key.category())
            .join(format!("{stem}.{}", Self::extension(key)))
    }

    fn parse_file_name(&self, category: Category, file_name: &str) -> Option<Key> {
        let exp = self.experiment_id.as_str();
        let (stem, _ext) = file_name.rsplit_once('.')?;
        let (name, trial): (Option<String>, Option<TrialId>) = match category {
            Category::TrialId => (stem == exp).then_some((None, None))?,
            Category::Parameter | Category::History | Category::Code => {
                let trial = stem.strip_prefix(exp)?.strip_prefix('_')?;
                (None, Some(trial.parse().ok()?))
            }
            Category::Metric | Category::Persist => {
                let rest = stem.strip_prefix(exp)?.strip_prefix('_')?;
                let (name, trial) = rest.rsplit_once('_')?;
                (Some(name.to_string()), Some(trial.parse().ok()?))
            }
            Category::Environment => {
                let (rest, trial) = stem.rsplit_once('_')?;
                let name = rest.strip_suffix(exp)?.strip_suffix('_')?;
                (Some(name.to_string()), Some(trial.parse().ok()?))
            }
            Category::StepHash => {
                let name = stem.strip_prefix(exp)?.strip_prefix('_')?;
                (Some(name.to_string()), None)
            }
        };
        Key::from_parts(exp, category, name, trial)
    }

    fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create a directory if missing; refuse to shadow an existing file.
fn maybe_create_dir(name: &str, path: &Path) -> Result<()> {
    if path.is_dir() {
        tracing::debug!("Use existing {name} directory: {}", path.display());
    } else if path.is_file() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "Unable to create {name} directory, the same file exists: {}",
                path.display()
            ),
        )));
    } else {
        tracing::debug!("Creating new {name} directory: {}", path.display());
        fs::create_dir_all(path)?;
    }
    Ok(())
}

fn encode_frame(value: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(value.len())
        .map_err(|_| Error::StorageError(format!("list entry too large: {} bytes", value.len())))?;
    let mut frame = Vec::with_capacity(value.len() + 4);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(value);
    Ok(frame)
}

fn decode_frames(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::StorageError("truncated list frame header".to_string()));
        }
        let (header, tail) = rest.split_at(4);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(header);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if tail.len() < len {
            return Err(Error::StorageError("truncated list frame".to_string()));
        }
        let (frame, next) = tail.split_at(len);
        frames.push(frame.to_vec());
        rest = next;
    }
    Ok(frames)
}

impl Backend for LocalBackend {
    fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn location(&self) -> String {
        self.cache_dir.display().to_string()
    }

    fn native_key(&self, key: &Key) -> String {
        self.path(key).display().to_string()
    }

    fn set(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        Self::write_file(&self.path(key), &value)
    }

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Self::read_file(&self.path(key))
    }

    fn append_list(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&encode_frame(&value)?)?;
        Ok(())
    }

    fn get_list(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        match Self::read_file(&self.path(key))? {
            Some(bytes) => decode_frames(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn increment(&self, key: &Key) -> Result<u64> {
        let _guard = self.counter_lock.lock();
        let path = self.path(key);
        let current = match Self::read_file(&path)? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::StorageError(format!("corrupt counter {}: {e}", path.display())))?,
            None => 0,
        };
        let next = current + 1;
        Self::write_file(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    fn keys(&self, pattern: &Key) -> Result<Vec<Key>> {
        let dir = self.category_dir(pattern.category());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(key) = self.parse_file_name(pattern.category(), file_name) {
                if pattern.matches(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    fn delete_cache(&self) -> Result<()> {
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_state(&self, state: &[u8]) -> Result<()> {
        let path = self.state_path();
        tracing::debug!("Saving experiment snapshot to path={}", path.display());
        Self::write_file(&path, state)
    }

    fn load_state(&self) -> Result<Option<Vec<u8>>> {
        Self::read_file(&self.state_path())
    }
}
