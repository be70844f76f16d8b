//! Repository walker: file selection, structure summary and chunking.
//!
//! Selection combines an allow-list of extensions and exact filenames with
//! exclusion globs. An exclusion matches when the glob matches either the
//! path relative to the repository root or the bare filename, so a pattern
//! like `node_modules` prunes that directory at any depth. Excluded
//! directories are never descended into.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::chunk::TextSplitter;
use crate::config::CollectorConfig;
use crate::error::Result;
use crate::models::{TextChunk, STRUCTURE_PATH};

const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "java", "cpp", "c", "h", "hpp", "cs", "php", "rb", "go", "rs",
    "swift", "kt", "scala", "clj",
];
const WEB_EXTENSIONS: &[&str] = &["html", "css", "scss", "sass", "xml", "json", "yaml", "yml"];
const DOC_EXTENSIONS: &[&str] = &["md", "txt", "rst", "adoc", "tex"];
const CONFIG_EXTENSIONS: &[&str] = &["toml", "ini", "cfg", "conf", "properties"];
const SHELL_EXTENSIONS: &[&str] = &["sh", "bash", "zsh", "fish", "ps1", "bat"];
const DATA_EXTENSIONS: &[&str] = &["csv", "sql", "dockerfile"];

const KNOWN_FILENAMES: &[&str] = &[
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
    "requirements.txt",
    "package.json",
    "pom.xml",
    "build.gradle",
    "Cargo.toml",
    "go.mod",
    "composer.json",
    "Gemfile",
    "pubspec.yaml",
];

const ALWAYS_EXCLUDED: &[&str] = &[".git"];

pub struct RepositoryCollector {
    excludes: GlobSet,
    max_files: usize,
    include_file_structure: bool,
    include_readme: bool,
    include_documentation: bool,
    splitter: TextSplitter,
}

impl RepositoryCollector {
    pub fn new(config: &CollectorConfig, splitter: TextSplitter) -> Result<Self> {
        let mut patterns: Vec<String> = ALWAYS_EXCLUDED.iter().map(|s| s.to_string()).collect();
        patterns.extend(config.exclude_patterns.iter().cloned());

        Ok(Self {
            excludes: build_globset(&patterns)?,
            max_files: config.max_files_to_index,
            include_file_structure: config.include_file_structure,
            include_readme: config.include_readme,
            include_documentation: config.include_documentation,
            splitter,
        })
    }

    pub fn splitter(&self) -> &TextSplitter {
        &self.splitter
    }

    /// Whether `rel_path` (or its final component) matches an exclusion glob.
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.excludes.is_match(rel_path) || self.excludes.is_match(name)
    }

    fn entry_excluded(&self, root: &Path, entry: &DirEntry) -> bool {
        entry.depth() > 0 && self.is_excluded(&relative_path(root, entry.path()))
    }

    /// Allow-listed, non-excluded files under `root`, at most `max_files_to_index`.
    pub fn readable_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.entry_excluded(root, e));

        for entry in walker {
            if files.len() >= self.max_files {
                tracing::debug!(max = self.max_files, "file limit reached");
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && self.is_allowed(&entry.file_name().to_string_lossy()) {
                files.push(entry.into_path());
            }
        }

        files
    }

    fn is_allowed(&self, file_name: &str) -> bool {
        let (stem, ext) = match file_name.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
            None => (file_name, String::new()),
        };
        let is_readme = stem.eq_ignore_ascii_case("readme");

        if is_readme && !self.include_readme {
            return false;
        }
        if KNOWN_FILENAMES.contains(&file_name) {
            return true;
        }
        if DOC_EXTENSIONS.contains(&ext.as_str()) {
            return is_readme || self.include_documentation;
        }

        [
            CODE_EXTENSIONS,
            WEB_EXTENSIONS,
            CONFIG_EXTENSIONS,
            SHELL_EXTENSIONS,
            DATA_EXTENSIONS,
        ]
        .iter()
        .any(|group| group.contains(&ext.as_str()))
    }

    /// Indented listing of non-excluded directories and files.
    pub fn file_structure_summary(&self, root: &Path) -> String {
        let mut lines = vec!["Repository Structure:".to_string()];
        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by(|a, b| {
                // Files before subdirectories at each level.
                let key = |e: &DirEntry| e.file_type().is_dir();
                key(a).cmp(&key(b)).then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter()
            .filter_entry(|e| !self.entry_excluded(root, e))
            .filter_map(|e| e.ok());

        for entry in walker {
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!(
                "{}{}{}",
                "  ".repeat(entry.depth()),
                entry.file_name().to_string_lossy(),
                suffix
            ));
        }

        lines.join("\n")
    }

    /// Chunk the structure summary (if enabled) and every readable file.
    pub fn process_repository(&self, root: &Path) -> Vec<TextChunk> {
        let files = self.readable_files(root);
        self.process_files(root, &files)
    }

    /// Chunk an already selected file list.
    pub fn process_files(&self, root: &Path, files: &[PathBuf]) -> Vec<TextChunk> {
        tracing::info!(root = %root.display(), files = files.len(), "processing repository");
        let mut chunks = Vec::new();

        if self.include_file_structure {
            let summary = self.file_structure_summary(root);
            chunks.extend(self.splitter.split(&summary, STRUCTURE_PATH, 1));
        }

        for path in files {
            let Some(content) = read_text(path) else {
                continue;
            };
            let rel = relative_path(root, path);
            let text = format!("File: {}\n{}", rel, content);
            let file_chunks = self.splitter.split(&text, &rel, 1);
            tracing::debug!(file = %rel, chunks = file_chunks.len(), "chunked");
            chunks.extend(file_chunks);
        }

        tracing::info!(chunks = chunks.len(), "repository chunked");
        chunks
    }

    /// Old-side paths from `diff --git a/<old> b/<new>` headers, minus exclusions.
    pub fn relevant_files_for_diff(&self, diff: &str) -> BTreeSet<String> {
        diff.lines()
            .filter_map(diff_header_paths)
            .map(|(old, _)| old)
            .filter(|path| path != "/dev/null" && !self.is_excluded(path))
            .collect()
    }
}

/// `(old, new)` paths of a `diff --git a/<old> b/<new>` line.
pub(crate) fn diff_header_paths(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("diff --git a/")?;
    let (old, new) = rest.rsplit_once(" b/")?;
    Some((old.to_string(), new.to_string()))
}

/// File contents as text: strict UTF-8, else lossy; `None` if unreadable.
pub fn read_text(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(e) => Some(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read file");
            None
        }
    }
}

/// `path` relative to `root`, joined with `/`.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitMethod;
    use std::fs;
    use tempfile::TempDir;

    fn collector(config: CollectorConfig) -> RepositoryCollector {
        RepositoryCollector::new(&config, TextSplitter::new(200, 20, SplitMethod::Character))
            .unwrap()
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files.iter().map(|f| relative_path(root, f)).collect()
    }

    fn sample_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "src/main.rs", "fn main() {}\n");
        write(root, "src/lib.PY", "def f(): pass\n");
        write(root, "README.md", "# Demo\n");
        write(root, "docs/guide.md", "Guide\n");
        write(root, "Dockerfile", "FROM scratch\n");
        write(root, "Cargo.lock", "lock\n");
        write(root, "image.png", "not text");
        write(root, "node_modules/pkg/index.js", "module.exports = 1;\n");
        write(root, ".git/config", "[core]\n");
        tmp
    }

    #[test]
    fn selects_allow_listed_files_and_prunes_excluded_dirs() {
        let tmp = sample_repo();
        let c = collector(CollectorConfig::default());
        let files = names(tmp.path(), &c.readable_files(tmp.path()));
        assert_eq!(
            files,
            vec![
                "Dockerfile",
                "README.md",
                "docs/guide.md",
                "src/lib.PY",
                "src/main.rs"
            ]
        );
    }

    #[test]
    fn max_files_keeps_already_collected() {
        let tmp = sample_repo();
        let c = collector(CollectorConfig {
            max_files_to_index: 2,
            ..CollectorConfig::default()
        });
        let files = names(tmp.path(), &c.readable_files(tmp.path()));
        assert_eq!(files, vec!["Dockerfile", "README.md"]);
    }

    #[test]
    fn readme_and_documentation_toggles() {
        let tmp = sample_repo();
        let no_docs = collector(CollectorConfig {
            include_documentation: false,
            ..CollectorConfig::default()
        });
        let files = names(tmp.path(), &no_docs.readable_files(tmp.path()));
        assert!(files.contains(&"README.md".to_string()));
        assert!(!files.contains(&"docs/guide.md".to_string()));

        let no_readme = collector(CollectorConfig {
            include_readme: false,
            ..CollectorConfig::default()
        });
        let files = names(tmp.path(), &no_readme.readable_files(tmp.path()));
        assert!(!files.contains(&"README.md".to_string()));
        assert!(files.contains(&"docs/guide.md".to_string()));
    }

    #[test]
    fn structure_summary_is_indented_tree() {
        let tmp = sample_repo();
        let c = collector(CollectorConfig::default());
        let summary = c.file_structure_summary(tmp.path());
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "Repository Structure:");
        assert!(lines.contains(&"  docs/"));
        assert!(lines.contains(&"    guide.md"));
        assert!(lines.contains(&"  src/"));
        assert!(lines.contains(&"    main.rs"));
        assert!(lines.contains(&"  README.md"));
        assert!(!summary.contains("node_modules"));
        assert!(!summary.contains(".git"));
        assert!(!summary.contains("Cargo.lock"));
    }

    #[test]
    fn process_repository_adds_headers_and_structure() {
        let tmp = sample_repo();
        let c = collector(CollectorConfig::default());
        let chunks = c.process_repository(tmp.path());

        assert_eq!(chunks[0].file_path, STRUCTURE_PATH);
        let main = chunks
            .iter()
            .find(|c| c.file_path == "src/main.rs")
            .unwrap();
        assert!(main.text.starts_with("File: src/main.rs\n"));
        assert_eq!(main.chunk_id, "src/main.rs_0");
    }

    #[test]
    fn structure_can_be_disabled() {
        let tmp = sample_repo();
        let c = collector(CollectorConfig {
            include_file_structure: false,
            ..CollectorConfig::default()
        });
        let chunks = c.process_repository(tmp.path());
        assert!(chunks.iter().all(|c| c.file_path != STRUCTURE_PATH));
    }

    #[test]
    fn invalid_utf8_is_read_lossily() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("latin1.txt");
        fs::write(&path, [b'c', b'a', b'f', 0xE9]).unwrap();
        let text = read_text(&path).unwrap();
        assert!(text.starts_with("caf"));
        assert!(read_text(&tmp.path().join("missing.txt")).is_none());
    }

    #[test]
    fn relevant_files_from_diff_headers() {
        let c = collector(CollectorConfig::default());
        let diff = "diff --git a/src/app.rs b/src/app.rs\n\
                    --- a/src/app.rs\n\
                    +++ b/src/app.rs\n\
                    diff --git a/Cargo.lock b/Cargo.lock\n\
                    diff --git a/old/name.py b/new/name.py\n";
        let files: Vec<String> = c.relevant_files_for_diff(diff).into_iter().collect();
        assert_eq!(files, vec!["old/name.py", "src/app.rs"]);
    }

    #[test]
    fn invalid_glob_is_an_error() {
        let config = CollectorConfig {
            exclude_patterns: vec!["[".to_string()],
            ..CollectorConfig::default()
        };
        assert!(RepositoryCollector::new(
            &config,
            TextSplitter::new(10, 0, SplitMethod::Character)
        )
        .is_err());
    }
}
