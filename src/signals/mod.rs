//! Project signals and advisory classification.
//!
//! `detect_project_signals` inspects a project directory for marker files and
//! returns opaque signal names (`rust`, `database`, ...). `AdvisoryTable` is a
//! pure classifier from signals to advisory topics, driven by an explicit
//! mapping that `[advisories]` in waypoint.toml can override per signal.
//! Both are metadata only: nothing in scheduling depends on them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use walkdir::WalkDir;

/// Marker file or directory -> signal, checked at the project root.
const ROOT_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("tsconfig.json", "typescript"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("setup.py", "python"),
    ("go.mod", "go"),
    ("Dockerfile", "docker"),
    ("docker-compose.yml", "docker"),
    ("compose.yaml", "docker"),
    (".github/workflows", "ci"),
    (".gitlab-ci.yml", "ci"),
];

/// Directory names that indicate a signal wherever they appear in the tree.
const DIR_MARKERS: &[(&str, &str)] = &[
    ("migrations", "database"),
    ("prisma", "database"),
    ("components", "frontend"),
    ("auth", "security"),
];

const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", "build", "__pycache__"];

/// How deep the directory-marker scan descends.
const SCAN_DEPTH: usize = 4;

/// Detect project signals from marker files under `dir`.
pub fn detect_project_signals(dir: &Path) -> BTreeSet<String> {
    let mut signals = BTreeSet::new();

    for (marker, signal) in ROOT_MARKERS {
        if dir.join(marker).exists() {
            signals.insert(signal.to_string());
        }
    }

    for entry in WalkDir::new(dir)
        .max_depth(SCAN_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            // The project root itself may be named like an ignored dir
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !IGNORED_DIRS.iter().any(|d| name == *d)
        })
        .filter_map(Result::ok)
        .filter(|e| e.depth() > 0 && e.file_type().is_dir())
    {
        let name = entry.file_name().to_string_lossy();
        if let Some((_, signal)) = DIR_MARKERS.iter().find(|(marker, _)| name == *marker) {
            signals.insert(signal.to_string());
        }
    }

    signals
}

/// Explicit signal -> advisory topic mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryTable {
    map: BTreeMap<String, BTreeSet<String>>,
}

impl Default for AdvisoryTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AdvisoryTable {
    pub fn builtin() -> Self {
        let entries: &[(&str, &[&str])] = &[
            ("rust", &["rust-idioms", "cargo-workflow"]),
            ("node", &["javascript-tooling"]),
            ("typescript", &["typescript-types"]),
            ("python", &["python-packaging"]),
            ("go", &["go-modules"]),
            ("docker", &["containers"]),
            ("ci", &["ci-pipelines"]),
            ("database", &["migrations", "query-performance"]),
            ("frontend", &["accessibility", "ui-testing"]),
            ("security", &["security-review"]),
        ];
        let map = entries
            .iter()
            .map(|(signal, topics)| {
                (
                    signal.to_string(),
                    topics.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        Self { map }
    }

    /// Replace the topics of each signal named in `overrides`. An empty list
    /// disables advisories for that signal.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        for (signal, topics) in overrides {
            self.map
                .insert(signal.clone(), topics.iter().cloned().collect());
        }
        self
    }

    /// Advisory topics for a set of signals. Unknown signals contribute nothing.
    pub fn classify<'a, I>(&self, signals: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        signals
            .into_iter()
            .filter_map(|s| self.map.get(s))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detect_root_markers() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        std::fs::create_dir_all(dir.path().join(".github/workflows")).unwrap();

        assert_eq!(
            detect_project_signals(dir.path()),
            set(&["ci", "docker", "rust"])
        );
    }

    #[test]
    fn test_detect_nested_dirs_and_ignores_vendored() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db/migrations")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg/components")).unwrap();

        assert_eq!(detect_project_signals(dir.path()), set(&["database"]));
    }

    #[test]
    fn test_project_root_named_like_ignored_dir() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("build");
        std::fs::create_dir_all(root.join("src/auth")).unwrap();
        std::fs::create_dir_all(root.join("target/migrations")).unwrap();

        assert_eq!(detect_project_signals(&root), set(&["security"]));
    }

    #[test]
    fn test_empty_project_has_no_signals() {
        let dir = tempdir().unwrap();
        assert!(detect_project_signals(dir.path()).is_empty());
    }

    #[test]
    fn test_classify_builtin() {
        let table = AdvisoryTable::builtin();
        let topics = table.classify(&set(&["database", "rust", "unknown"]));
        assert_eq!(
            topics,
            set(&["cargo-workflow", "migrations", "query-performance", "rust-idioms"])
        );
    }

    #[test]
    fn test_overrides_replace_and_disable() {
        let mut overrides = BTreeMap::new();
        overrides.insert("database".to_string(), vec!["sqlite".to_string()]);
        overrides.insert("rust".to_string(), vec![]);
        overrides.insert("elixir".to_string(), vec!["otp".to_string()]);
        let table = AdvisoryTable::builtin().with_overrides(&overrides);

        let topics = table.classify(&set(&["database", "rust", "elixir"]));
        assert_eq!(topics, set(&["otp", "sqlite"]));
    }
}
