//! Ignore-pattern matching using the `globset` crate.
//!
//! Patterns follow git-style semantics over *relative* paths: a pattern
//! matches if it matches the whole relative path, any single path
//! component, or the basename. A trailing `/` marks a directory pattern
//! and is stripped before compilation (`secret/` hides everything under
//! any `secret` component).

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Patterns every workspace ignores, before `.pearsyncignore` is read.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "node_modules",
    ".git",
    ".DS_Store",
    "Thumbs.db",
    "*.swp",
    "*.swo",
    "*~",
    ".env",
    ".env.local",
    ".pearsyncignore",
];

/// File at the workspace root that augments the defaults.
pub const IGNORE_FILE_NAME: &str = ".pearsyncignore";

/// Compiled ignore list. Immutable after engine init.
#[derive(Debug)]
pub struct IgnoreList {
    set: GlobSet,
    patterns: Vec<String>,
}

impl IgnoreList {
    /// Compile the default patterns plus `extra`.
    pub fn new<S: AsRef<str>>(extra: &[S]) -> Result<Self, globset::Error> {
        let mut patterns: Vec<String> = DEFAULT_IGNORE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        patterns.extend(extra.iter().map(|p| normalize(p.as_ref())));
        patterns.retain(|p| !p.is_empty());

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
            patterns,
        })
    }

    /// Compile defaults plus the workspace's `.pearsyncignore`, if present.
    ///
    /// Lines are trimmed; empty lines and `#` comments are skipped.
    pub fn load(workspace_root: &Path) -> Result<Self, globset::Error> {
        let ignore_file = workspace_root.join(IGNORE_FILE_NAME);
        let extra: Vec<String> = match std::fs::read_to_string(&ignore_file) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect(),
            Err(_) => Vec::new(),
        };
        if !extra.is_empty() {
            tracing::debug!(
                count = extra.len(),
                file = %ignore_file.display(),
                "loaded ignore patterns"
            );
        }
        Self::new(&extra)
    }

    /// Whether `rel_path` (forward-slash separated, relative to the
    /// workspace root) is hidden from both push and pull.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let rel_path = rel_path.trim_matches('/');
        if rel_path.is_empty() {
            return false;
        }
        if self.set.is_match(rel_path) {
            return true;
        }
        // Any matching component hides the whole subtree.
        rel_path.split('/').any(|comp| self.set.is_match(comp))
    }

    /// The compiled pattern strings (defaults first).
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Strip a trailing directory slash; globset has no directory concept.
fn normalize(pattern: &str) -> String {
    pattern.trim_end_matches('/').to_string()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn list(extra: &[&str]) -> IgnoreList {
        IgnoreList::new(extra).unwrap()
    }

    #[test]
    fn defaults_hide_well_known_noise() {
        let l = list(&[]);
        assert!(l.is_ignored(".git"));
        assert!(l.is_ignored(".git/HEAD"));
        assert!(l.is_ignored("node_modules/lodash/index.js"));
        assert!(l.is_ignored("src/notes.swp"));
        assert!(l.is_ignored("backup~"));
        assert!(l.is_ignored(".pearsyncignore"));
        assert!(!l.is_ignored("src/main.rs"));
    }

    #[test]
    fn wildcard_matches_basename_anywhere() {
        let l = list(&["*.log"]);
        assert!(l.is_ignored("debug.log"));
        assert!(l.is_ignored("deep/nested/trace.log"));
        assert!(!l.is_ignored("changelog.txt"));
    }

    #[test]
    fn directory_pattern_hides_subtree() {
        let l = list(&["secret/"]);
        assert!(l.is_ignored("secret"));
        assert!(l.is_ignored("secret/pw.txt"));
        assert!(l.is_ignored("a/secret/b.txt"));
        assert!(!l.is_ignored("secrets.txt"));
    }

    #[test]
    fn load_reads_ignore_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(IGNORE_FILE_NAME),
            "# comment\n*.log\n\nsecret/\n",
        )
        .unwrap();
        let l = IgnoreList::load(dir.path()).unwrap();
        assert!(l.is_ignored("debug.log"));
        assert!(l.is_ignored("secret/pw.txt"));
        assert!(!l.is_ignored("keep.txt"));
    }

    #[test]
    fn load_without_file_is_defaults_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let l = IgnoreList::load(dir.path()).unwrap();
        assert!(l.is_ignored(".DS_Store"));
        assert!(!l.is_ignored("anything.log"));
    }
}
