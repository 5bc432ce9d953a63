//! Backend selection and cache-root resolution.
//!
//! Selection is a pure function from a configuration string to a
//! [`BackendSpec`] tag; nothing here touches the filesystem or the network.

use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable overriding the default cache root.
pub const CACHE_DIR_ENV: &str = "TRIALBOOK_CACHE_DIR";

/// Cache root used when neither the builder nor the environment sets one.
pub const DEFAULT_CACHE_DIR: &str = "trialbook_cache";

const REDIS_PREFIXES: [&str; 4] = ["redis://", "rediss://", "unix://", "redis+unix://"];
const MONGO_PREFIXES: [&str; 2] = ["mongodb://", "mongodb+srv://"];
const MEMORY_URI: &str = "memory://";

/// Which substrate an experiment persists to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// Local filesystem. `None` uses the resolved cache root.
    Local(Option<PathBuf>),
    /// In-process store (lost on exit)
    Memory,
    /// Redis connection string
    Redis(String),
    /// MongoDB connection string
    Mongo(String),
}

impl Default for BackendSpec {
    fn default() -> Self {
        Self::Local(None)
    }
}

impl BackendSpec {
    /// Resolve a configuration string by prefix.
    ///
    /// `redis://`, `rediss://`, `unix://` and `redis+unix://` select Redis;
    /// `mongodb://` and `mongodb+srv://` select MongoDB; `memory://` selects
    /// the in-process store; `"local"` (or an empty string) selects the
    /// default cache root; anything else is treated as a filesystem path.
    ///
    /// # Example
    ///
    /// ```rust
    /// use trialbook::config::BackendSpec;
    ///
    /// assert_eq!(
    ///     BackendSpec::parse("redis://localhost:6379/0"),
    ///     BackendSpec::Redis("redis://localhost:6379/0".into())
    /// );
    /// assert_eq!(BackendSpec::parse("local"), BackendSpec::Local(None));
    /// ```
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if REDIS_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            Self::Redis(trimmed.to_string())
        } else if MONGO_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            Self::Mongo(trimmed.to_string())
        } else if trimmed == MEMORY_URI {
            Self::Memory
        } else if trimmed.is_empty() || trimmed == "local" {
            Self::Local(None)
        } else {
            Self::Local(Some(PathBuf::from(trimmed)))
        }
    }

    /// Whether the substrate is reachable from other processes.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Mongo(_))
    }
}

impl From<&str> for BackendSpec {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<&Path> for BackendSpec {
    fn from(path: &Path) -> Self {
        Self::Local(Some(path.to_path_buf()))
    }
}

impl From<PathBuf> for BackendSpec {
    fn from(path: PathBuf) -> Self {
        Self::Local(Some(path))
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(None) => f.write_str("local"),
            Self::Local(Some(path)) => write!(f, "{}", path.display()),
            Self::Memory => f.write_str(MEMORY_URI),
            Self::Redis(uri) | Self::Mongo(uri) => f.write_str(uri),
        }
    }
}

/// Resolve the cache root: explicit value, then `TRIALBOOK_CACHE_DIR`, then
/// `./trialbook_cache`.
#[must_use]
pub fn resolve_cache_root(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var_os(CACHE_DIR_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_redis_prefixes() {
        for uri in [
            "redis://localhost:6379/0",
            "rediss://secure:6380",
            "unix:///tmp/redis.sock",
            "redis+unix:///tmp/redis.sock",
        ] {
            assert_eq!(BackendSpec::parse(uri), BackendSpec::Redis(uri.to_string()));
        }
    }

    #[test]
    fn test_parse_mongo_prefixes() {
        assert_eq!(
            BackendSpec::parse("mongodb://localhost:27017/db"),
            BackendSpec::Mongo("mongodb://localhost:27017/db".into())
        );
        assert!(matches!(
            BackendSpec::parse("mongodb+srv://cluster/db"),
            BackendSpec::Mongo(_)
        ));
    }

    #[test]
    fn test_parse_local_and_memory() {
        assert_eq!(BackendSpec::parse("memory://"), BackendSpec::Memory);
        assert_eq!(BackendSpec::parse("local"), BackendSpec::Local(None));
        assert_eq!(BackendSpec::parse(""), BackendSpec::Local(None));
        assert_eq!(
            BackendSpec::parse("/tmp/cache"),
            BackendSpec::Local(Some(PathBuf::from("/tmp/cache")))
        );
        // Not a known scheme: a (weird) relative path.
        assert!(matches!(
            BackendSpec::parse("postgres://x"),
            BackendSpec::Local(Some(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["redis://h:1/0", "mongodb://h/db", "memory://", "local", "some/dir"] {
            let spec = BackendSpec::parse(text);
            assert_eq!(BackendSpec::parse(&spec.to_string()), spec);
        }
    }

    #[test]
    fn test_default_is_local_cache_root() {
        assert_eq!(BackendSpec::default(), BackendSpec::Local(None));
    }

    #[test]
    fn test_is_remote() {
        assert!(BackendSpec::parse("redis://h").is_remote());
        assert!(BackendSpec::parse("mongodb://h").is_remote());
        assert!(!BackendSpec::Memory.is_remote());
        assert!(!BackendSpec::Local(None).is_remote());
    }

    #[test]
    fn test_explicit_cache_root_wins() {
        let root = resolve_cache_root(Some(PathBuf::from("/explicit")));
        assert_eq!(root, PathBuf::from("/explicit"));
    }
}
