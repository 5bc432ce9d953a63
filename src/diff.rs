//! Line-oriented unified diff.

use similar::TextDiff;

/// Unified diff between two texts with `context` lines around each hunk.
///
/// Returns one entry per output line (without trailing newlines); empty when
/// the texts are identical.
#[must_use]
pub fn unified_diff(old: &str, new: &str, context: usize) -> Vec<String> {
    if old == new {
        return Vec::new();
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(context)
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_texts() {
        assert!(unified_diff("a\nb\n", "a\nb\n", 3).is_empty());
    }

    #[test]
    fn test_changed_line() {
        let diff = unified_diff("a\nb\nc\n", "a\nB\nc\n", 0);
        assert!(diff.iter().any(|l| l == "-b"));
        assert!(diff.iter().any(|l| l == "+B"));
        assert!(!diff.iter().any(|l| l == " a"));
    }

    #[test]
    fn test_context_lines() {
        let diff = unified_diff("a\nb\nc\n", "a\nB\nc\n", 1);
        assert!(diff.iter().any(|l| l == " a"));
        assert!(diff.iter().any(|l| l == " c"));
    }
}
