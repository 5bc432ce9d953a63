//! Runtime environment snapshots.
//!
//! A fixed set of collectors describes the machine, the binary, the
//! process, the git checkout and the enabled crate features. Their output
//! is saved per trial and compared against the last trial when an
//! experiment is reopened.

use std::fmt;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::backend::Storage;
use crate::diff::unified_diff;
use crate::{Error, Result, TrialId};

const NOT_GIT_CONTROLLED: &str = "Not Git Controlled";

/// Environment categories, in collection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collector {
    /// OS, family, architecture, CPU count
    Platform,
    /// Crate version, build profile, executable
    Rust,
    /// Working directory and command line
    Process,
    /// Repository, branch, HEAD commit
    Git,
    /// Crate and enabled features, one per line
    Requirements,
}

impl Collector {
    /// Every collector.
    pub const ALL: [Self; 5] = [
        Self::Platform,
        Self::Rust,
        Self::Process,
        Self::Git,
        Self::Requirements,
    ];

    /// Collectors shown by [`EnvironmentManager::get_environment`].
    pub const SUMMARY: [Self; 3] = [Self::Platform, Self::Rust, Self::Git];

    /// Category name used in keys and file names.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Rust => "rust",
            Self::Process => "process",
            Self::Git => "git",
            Self::Requirements => "requirements",
        }
    }

    /// Look up a collector by category name (case-insensitive).
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.key() == key)
    }

    /// Collect the current environment for this category.
    #[must_use]
    pub fn collect(self) -> Snapshot {
        match self {
            Self::Platform => Snapshot::labels([
                ("Operating System", std::env::consts::OS.to_string()),
                ("OS Family", std::env::consts::FAMILY.to_string()),
                ("Architecture", std::env::consts::ARCH.to_string()),
                (
                    "Device CPU Count",
                    std::thread::available_parallelism()
                        .map_or(1, std::num::NonZeroUsize::get)
                        .to_string(),
                ),
            ]),
            Self::Rust => Snapshot::labels([
                ("Trialbook Version", env!("CARGO_PKG_VERSION").to_string()),
                (
                    "Build Profile",
                    if cfg!(debug_assertions) { "debug" } else { "release" }.to_string(),
                ),
                (
                    "Executable",
                    std::env::current_exe()
                        .map_or_else(|_| "unknown".to_string(), |p| p.display().to_string()),
                ),
            ]),
            Self::Process => Snapshot::labels([
                (
                    "Working Directory",
                    std::env::current_dir()
                        .map_or_else(|_| "unknown".to_string(), |p| p.display().to_string()),
                ),
                ("Command Line", std::env::args().collect::<Vec<_>>().join(" ")),
            ]),
            Self::Git => collect_git(),
            Self::Requirements => Snapshot::Text(requirements()),
        }
    }
}

impl fmt::Display for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// File extension of a category's saved record on the local backend.
#[must_use]
pub fn file_extension(category: &str) -> &'static str {
    match category {
        "requirements" => "txt",
        _ => "json",
    }
}

/// One collector's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snapshot {
    /// Ordered `label: value` pairs, stored as JSON
    Labels(Vec<(String, String)>),
    /// Free text, stored as-is
    Text(String),
}

impl Snapshot {
    fn labels<const N: usize>(pairs: [(&str, String); N]) -> Self {
        Self::Labels(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Lines logged when an experiment is opened.
    #[must_use]
    pub fn summary(&self) -> Vec<String> {
        match self {
            Self::Labels(pairs) => pairs.iter().map(|(k, v)| format!("{k}: {v}")).collect(),
            Self::Text(text) => vec![format!("Number of Requirements: {}", text.lines().count())],
        }
    }

    /// Full readable form.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Labels(_) => self.summary().join("\n"),
            Self::Text(text) => text.clone(),
        }
    }

    /// Stored form.
    ///
    /// # Errors
    /// `Serialization` if the labels cannot be encoded.
    pub fn dumps(&self) -> Result<String> {
        match self {
            Self::Labels(pairs) => Ok(serde_json::to_string(pairs)?),
            Self::Text(text) => Ok(text.clone()),
        }
    }

    /// Parse a stored record of `collector`.
    ///
    /// # Errors
    /// `Serialization` if a label record is not valid JSON.
    pub fn loads(collector: Collector, text: &str) -> Result<Self> {
        match collector {
            Collector::Requirements => Ok(Self::Text(text.to_string())),
            _ => Ok(Self::Labels(serde_json::from_str(text)?)),
        }
    }

    /// Zero-context diff lines from `previous` to `self`, or `None` if
    /// nothing changed.
    #[must_use]
    pub fn difference_from(&self, previous: &Self) -> Option<Vec<String>> {
        let (current, previous) = (self.detail(), previous.detail());
        (current != previous).then(|| unified_diff(&previous, &current, 0))
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn collect_git() -> Snapshot {
    let Some(repository) = git(&["rev-parse", "--show-toplevel"]) else {
        return Snapshot::labels([
            ("Git Repository", NOT_GIT_CONTROLLED.to_string()),
            ("Git Active Branch", NOT_GIT_CONTROLLED.to_string()),
            ("Git HEAD Commit", NOT_GIT_CONTROLLED.to_string()),
        ]);
    };
    let branch = match git(&["rev-parse", "--abbrev-ref", "HEAD"]).as_deref() {
        Some("HEAD") | None => "DETACHED".to_string(),
        Some(name) => name.to_string(),
    };
    let commit = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let dirty = git(&["status", "--porcelain"]).is_some_and(|s| !s.is_empty());
    Snapshot::labels([
        ("Git Repository", repository),
        ("Git Active Branch", branch),
        (
            "Git HEAD Commit",
            if dirty { format!("{commit} (DIRTY)") } else { commit },
        ),
    ])
}

fn requirements() -> String {
    let mut lines = vec![format!("trialbook=={}", env!("CARGO_PKG_VERSION"))];
    for (feature, enabled) in [
        ("redis", cfg!(feature = "redis")),
        ("mongo", cfg!(feature = "mongo")),
        ("rayon", cfg!(feature = "rayon")),
    ] {
        if enabled {
            lines.push(format!("trialbook[{feature}]"));
        }
    }
    lines.join("\n")
}

/// Saves, loads and compares environment snapshots.
#[derive(Debug)]
pub struct EnvironmentManager {
    storage: Storage,
    current: Vec<(Collector, Snapshot)>,
}

impl EnvironmentManager {
    /// Collect the current environment once, writing through `storage`.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        let current = Collector::ALL.into_iter().map(|c| (c, c.collect())).collect();
        Self::with_snapshots(storage, current)
    }

    /// Use fixed snapshots instead of collecting.
    #[must_use]
    pub const fn with_snapshots(storage: Storage, current: Vec<(Collector, Snapshot)>) -> Self {
        Self { storage, current }
    }

    fn current(&self, collector: Collector) -> Result<&Snapshot> {
        self.current
            .iter()
            .find(|(c, _)| *c == collector)
            .map(|(_, s)| s)
            .ok_or_else(|| Error::Other(format!("Environment category not collected: {collector}")))
    }

    /// Save every current snapshot under `trial_id`.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn save(&self, trial_id: TrialId) -> Result<()> {
        for (collector, snapshot) in &self.current {
            let key = self.storage.environment_key(collector.key(), trial_id);
            tracing::debug!(category = collector.key(), %key, "Saving environment");
            self.storage.save_text(&key, &snapshot.dumps()?)?;
        }
        Ok(())
    }

    /// Snapshot of `collector`: the current one, or the one saved for
    /// `trial_id`.
    ///
    /// # Errors
    /// `TrialNotFound` if nothing was saved for `trial_id`.
    pub fn load(&self, collector: Collector, trial_id: Option<TrialId>) -> Result<Snapshot> {
        let Some(trial_id) = trial_id else {
            return self.current(collector).cloned();
        };
        let text = self
            .storage
            .load_text(&self.storage.environment_key(collector.key(), trial_id))
            .map_err(|e| e.for_trial(trial_id))?;
        Snapshot::loads(collector, &text)
    }

    /// Platform, build and git summary lines.
    ///
    /// # Errors
    /// `TrialNotFound` if a record for `trial_id` is missing.
    pub fn get_environment(&self, trial_id: Option<TrialId>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for collector in Collector::SUMMARY {
            lines.extend(self.load(collector, trial_id)?.summary());
        }
        Ok(lines)
    }

    /// Full record of one category.
    ///
    /// # Errors
    /// `Other` for an unknown category; `TrialNotFound` if the record for
    /// `trial_id` is missing.
    pub fn get_detail(&self, category: &str, trial_id: Option<TrialId>) -> Result<String> {
        let collector = Collector::from_key(category).ok_or_else(|| {
            let known: Vec<&str> = Collector::ALL.iter().map(|c| c.key()).collect();
            Error::Other(format!(
                "Category must be one of {}, given: {category}",
                known.join(", ")
            ))
        })?;
        match self.load(collector, trial_id) {
            Ok(snapshot) => Ok(snapshot.detail()),
            Err(e) => {
                tracing::error!(category, ?trial_id, "Unable to load saved environment");
                Err(e)
            }
        }
    }

    /// Warn about every category that differs from the record saved for
    /// `trial_id`. Missing records are reported and skipped.
    ///
    /// Returns the categories that changed.
    ///
    /// # Errors
    /// Substrate errors other than a missing record.
    pub fn check_environment_change(&self, trial_id: TrialId) -> Result<Vec<Collector>> {
        let mut changed = Vec::new();
        for (collector, current) in &self.current {
            let previous = match self.load(*collector, Some(trial_id)) {
                Ok(previous) => previous,
                Err(Error::TrialNotFound(_)) => {
                    tracing::error!(
                        category = collector.key(),
                        trial_id,
                        "Unable to load saved environment, comparison is skipped"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(diff) = current.difference_from(&previous) {
                tracing::warn!(category = collector.key(), "Environment information has been changed");
                for line in diff {
                    tracing::warn!("{line}");
                }
                changed.push(*collector);
            }
        }
        Ok(changed)
    }

    /// Log the current summary of every category.
    pub fn log_environment_info(&self) {
        for (_, snapshot) in &self.current {
            for line in snapshot.summary() {
                tracing::info!("{line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn fixed(os: &str) -> Vec<(Collector, Snapshot)> {
        vec![
            (
                Collector::Platform,
                Snapshot::labels([("Operating System", os.to_string())]),
            ),
            (Collector::Rust, Snapshot::labels([("Trialbook Version", "0.1.0".to_string())])),
            (Collector::Git, Snapshot::labels([("Git Repository", NOT_GIT_CONTROLLED.to_string())])),
            (Collector::Requirements, Snapshot::Text("trialbook==0.1.0".to_string())),
        ]
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("requirements"), "txt");
        assert_eq!(file_extension("platform"), "json");
    }

    #[test]
    fn test_from_key() {
        assert_eq!(Collector::from_key("GIT"), Some(Collector::Git));
        assert_eq!(Collector::from_key("gpu"), None);
    }

    #[test]
    fn test_collect_all() {
        for collector in Collector::ALL {
            assert!(!collector.collect().detail().is_empty(), "{collector}");
        }
        assert!(requirements().starts_with("trialbook=="));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let env = EnvironmentManager::with_snapshots(Storage::new(MemoryBackend::new("exp")), fixed("linux"));
        env.save(1).unwrap();
        assert_eq!(
            env.load(Collector::Platform, Some(1)).unwrap(),
            Snapshot::labels([("Operating System", "linux".to_string())])
        );
        assert_eq!(env.get_detail("requirements", Some(1)).unwrap(), "trialbook==0.1.0");
        assert_eq!(
            env.get_environment(Some(1)).unwrap(),
            vec![
                "Operating System: linux",
                "Trialbook Version: 0.1.0",
                "Git Repository: Not Git Controlled"
            ]
        );
    }

    #[test]
    fn test_missing_trial() {
        let env = EnvironmentManager::with_snapshots(Storage::new(MemoryBackend::new("exp")), fixed("linux"));
        let err = env.get_environment(Some(2)).unwrap_err();
        assert_eq!(err.to_string(), "Unable to find trial id: 2");
        assert!(matches!(env.get_detail("nope", None), Err(Error::Other(_))));
    }

    #[test]
    fn test_check_environment_change() {
        let storage = Storage::new(MemoryBackend::new("exp"));
        EnvironmentManager::with_snapshots(storage.clone(), fixed("linux"))
            .save(1)
            .unwrap();

        let same = EnvironmentManager::with_snapshots(storage.clone(), fixed("linux"));
        assert!(same.check_environment_change(1).unwrap().is_empty());

        let moved = EnvironmentManager::with_snapshots(storage, fixed("macos"));
        assert_eq!(moved.check_environment_change(1).unwrap(), vec![Collector::Platform]);
        // nothing saved for trial 5: every category is skipped
        assert!(moved.check_environment_change(5).unwrap().is_empty());
    }

    #[test]
    fn test_difference_is_zero_context() {
        let old = Snapshot::Text("a\nb\nc".to_string());
        let new = Snapshot::Text("a\nB\nc".to_string());
        let diff = new.difference_from(&old).unwrap();
        assert!(diff.iter().any(|l| l == "-b"));
        assert!(diff.iter().any(|l| l == "+B"));
        assert!(!diff.iter().any(|l| l == " a"));
    }
}
