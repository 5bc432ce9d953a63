//! Step source registry.
//!
//! Every tracked step may carry its source text. The registry keeps the
//! current text per step (in registration order) plus the last text ever
//! seen per step name, and warns with a unified diff when a step is
//! re-registered with different code. On each trial the joined sources are
//! saved under the trial id.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::backend::Storage;
use crate::diff::unified_diff;
use crate::{Result, TrialId};

const HEADER: &str = "// Code output saved in trial_id=";

/// Register a step together with its own source text.
///
/// Expands `sourced!(exp.result("inc", |args| ...))` into
/// `exp.result("inc", |args| ...).with_source("|args| ...")`.
///
/// ```rust
/// use serde_json::json;
/// use trialbook::{sourced, Experiment};
///
/// # fn main() -> trialbook::Result<()> {
/// let exp = Experiment::builder("sourced_doc").backend("memory://").build()?;
/// let inc = sourced!(exp.result("inc", |args| Ok(json!(args[0].as_i64().unwrap_or(0) + 1))));
/// assert!(exp.get_code(None)?.contains("args[0]"));
/// assert_eq!(inc.name(), "inc");
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! sourced {
    ($exp:ident . $kind:ident ( $name:expr , $f:expr $(,)? )) => {
        $exp.$kind($name, $f).with_source(stringify!($f))
    };
}

/// Per-experiment step source registry.
#[derive(Debug)]
pub struct CodeManager {
    storage: Storage,
    codes: RwLock<Vec<(String, String)>>,
    history: RwLock<BTreeMap<String, String>>,
}

impl CodeManager {
    /// Registry writing through `storage`.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self::with_history(storage, BTreeMap::new())
    }

    /// Registry seeded with sources seen by an earlier process.
    #[must_use]
    pub fn with_history(storage: Storage, history: BTreeMap<String, String>) -> Self {
        Self {
            storage,
            codes: RwLock::new(Vec::new()),
            history: RwLock::new(history),
        }
    }

    /// Record `source` as the code of step `name`.
    ///
    /// Returns `true` when an earlier, different source was replaced.
    pub fn register(&self, name: &str, source: &str) -> bool {
        let source = normalize(source);
        let changed = match self.history.read().get(name) {
            Some(previous) if *previous != source => {
                let diff = unified_diff(previous, &source, 3);
                tracing::warn!(step = name, "Code changed\n{}", diff.join("\n"));
                true
            }
            _ => false,
        };

        {
            let mut codes = self.codes.write();
            match codes.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1.clone_from(&source),
                None => codes.push((name.to_string(), source.clone())),
            }
        }
        self.history.write().insert(name.to_string(), source);
        changed
    }

    /// Whether any step has registered source.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.read().is_empty()
    }

    /// Current sources joined by blank lines, in registration order.
    #[must_use]
    pub fn describe(&self) -> String {
        self.codes
            .read()
            .iter()
            .map(|(_, source)| source.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Last source seen per step, for snapshotting.
    #[must_use]
    pub fn history(&self) -> BTreeMap<String, String> {
        self.history.read().clone()
    }

    /// Save the current sources for `trial_id`.
    ///
    /// # Errors
    /// Substrate errors.
    pub fn save(&self, trial_id: TrialId) -> Result<()> {
        let text = format!("{HEADER}{trial_id}\n{}", self.describe());
        self.storage.save_text(&self.storage.code_key(trial_id), &text)
    }

    /// Load the sources saved for `trial_id`, without the header line.
    ///
    /// # Errors
    /// `TrialNotFound` if nothing was saved for `trial_id`.
    pub fn load(&self, trial_id: TrialId) -> Result<String> {
        let text = self
            .storage
            .load_text(&self.storage.code_key(trial_id))
            .map_err(|e| e.for_trial(trial_id))?;
        let body: Vec<&str> = text.lines().skip(1).collect();
        Ok(format!("{}\n", body.join("\n")))
    }
}

fn normalize(source: &str) -> String {
    source.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn manager() -> CodeManager {
        CodeManager::new(Storage::new(MemoryBackend::new("exp")))
    }

    #[test]
    fn test_describe_in_registration_order() {
        let m = manager();
        m.register("b", "fn b() {}");
        m.register("a", "fn a() {}\n");
        assert_eq!(m.describe(), "fn b() {}\n\nfn a() {}");
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let m = manager();
        m.register("a", "fn a() { 1 }");
        m.register("b", "fn b() {}");
        assert!(m.register("a", "fn a() { 2 }"));
        assert!(!m.register("a", "fn a() { 2 }"));
        assert_eq!(m.describe(), "fn a() { 2 }\n\nfn b() {}");
    }

    #[test]
    fn test_history_detects_change_across_sessions() {
        let storage = Storage::new(MemoryBackend::new("exp"));
        let first = CodeManager::new(storage.clone());
        first.register("inc", "|a| a + 1");

        let second = CodeManager::with_history(storage, first.history());
        assert!(second.is_empty());
        assert!(second.register("inc", "|a| a + 2"));
    }

    #[test]
    fn test_save_and_load_strip_header() {
        let m = manager();
        m.register("inc", "|a| a + 1");
        m.save(3).unwrap();

        let raw = m.storage.load_text(&m.storage.code_key(3)).unwrap();
        assert!(raw.starts_with("// Code output saved in trial_id=3\n"));
        assert_eq!(m.load(3).unwrap(), "|a| a + 1\n");
    }

    #[test]
    fn test_load_missing_is_trial_not_found() {
        let err = manager().load(9).unwrap_err();
        assert_eq!(err.to_string(), "Unable to find trial id: 9");
    }
}
