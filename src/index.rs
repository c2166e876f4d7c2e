//! Read-only symbol and dependency snapshot of the target tree.
//!
//! The index is an input artifact: a richer external indexer may have written
//! `.refit/index.json`, in which case it is loaded as-is. Otherwise a minimal
//! line scan regenerates just enough structure for context retrieval (symbol
//! names, import edges, file sizes). Nothing here is durable across runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RefitError;

/// Source extensions the fallback scanner understands.
const SOURCE_EXTENSIONS: &[&str] = &["py", "rs", "js", "ts", "go", "java", "rb", "c", "h", "cpp"];

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[".git", ".refit", "target", "node_modules", "__pycache__", ".venv"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What kind of thing a symbol is. Coarse by design.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymbolKind {
    /// Function or method.
    Function,
    /// Class, struct, enum, trait, interface.
    Type,
    /// Constant or module-level variable.
    Const,
}

/// One declared symbol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// The declared name.
    pub name: String,
    /// Coarse kind.
    pub kind: SymbolKind,
    /// 1-based declaration line.
    pub line: usize,
    /// Whether the symbol is part of the file's public surface.
    pub exported: bool,
}

/// Everything known about one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Declared symbols, in declaration order.
    pub symbols: Vec<Symbol>,
    /// Raw import/use targets as written in the source.
    pub imports: Vec<String>,
    /// Total line count.
    pub lines: usize,
}

/// The full snapshot: repo-relative path (forward slashes) to file entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Per-file entries, sorted by path.
    pub files: BTreeMap<String, FileEntry>,
}

// ---------------------------------------------------------------------------
// Loading and scanning
// ---------------------------------------------------------------------------

impl Index {
    /// Load a previously written snapshot, or scan the tree if none exists.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be read.
    pub fn load_or_scan(root: &Path, snapshot: &Path) -> Result<Self, RefitError> {
        if snapshot.exists() {
            let content = std::fs::read_to_string(snapshot)?;
            if let Ok(index) = serde_json::from_str(&content) {
                return Ok(index);
            }
            tracing::warn!(path = %snapshot.display(), "unreadable index snapshot, rescanning");
        }
        Self::scan(root)
    }

    /// Build an index by scanning the tree.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read.
    pub fn scan(root: &Path) -> Result<Self, RefitError> {
        let mut files = BTreeMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if path.is_dir() {
                    if !SKIP_DIRS.contains(&name.as_str()) && !name.starts_with('.') {
                        pending.push(path);
                    }
                    continue;
                }
                let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                    continue;
                };
                if !SOURCE_EXTENSIONS.contains(&ext) {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue; // non-UTF-8 source is invisible to retrieval
                };
                let rel = relative_slash(root, &path);
                files.insert(rel, scan_file(&content));
            }
        }
        Ok(Self { files })
    }

    /// Persist the snapshot as JSON.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn write_snapshot(&self, path: &Path) -> Result<(), RefitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(format!("index serialization: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Number of distinct files whose imports reference `path`'s module stem.
    #[must_use]
    pub fn fan_in(&self, path: &str) -> usize {
        let Some(stem) = Path::new(path).file_stem().and_then(|s| s.to_str()) else {
            return 0;
        };
        self.files
            .iter()
            .filter(|(other, entry)| {
                *other != path && entry.imports.iter().any(|i| import_references(i, stem))
            })
            .count()
    }

    /// Files whose imports reference any of the given paths' module stems.
    #[must_use]
    pub fn importers_of(&self, paths: &[&str]) -> BTreeSet<String> {
        let stems: Vec<&str> = paths
            .iter()
            .filter_map(|p| Path::new(p).file_stem().and_then(|s| s.to_str()))
            .collect();
        self.files
            .iter()
            .filter(|(path, entry)| {
                !paths.contains(&path.as_str())
                    && entry
                        .imports
                        .iter()
                        .any(|i| stems.iter().any(|s| import_references(i, s)))
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Module stems imported by the given files, resolved back to index paths.
    #[must_use]
    pub fn imports_of(&self, paths: &[&str]) -> BTreeSet<String> {
        let mut imported = BTreeSet::new();
        for path in paths {
            let Some(entry) = self.files.get(*path) else {
                continue;
            };
            for import in &entry.imports {
                for (candidate, _) in &self.files {
                    if paths.contains(&candidate.as_str()) {
                        continue;
                    }
                    if let Some(stem) = Path::new(candidate).file_stem().and_then(|s| s.to_str())
                        && import_references(import, stem)
                    {
                        imported.insert(candidate.clone());
                    }
                }
            }
        }
        imported
    }

    /// The exported-name surface, for contract snapshots.
    #[must_use]
    pub fn exported_names(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .flat_map(|(path, entry)| {
                entry
                    .symbols
                    .iter()
                    .filter(|s| s.exported)
                    .map(move |s| format!("{path}::{}", s.name))
            })
            .collect()
    }
}

/// True if the raw import string mentions the module stem as a word.
fn import_references(import: &str, stem: &str) -> bool {
    import
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word == stem)
}

fn relative_slash(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

// ---------------------------------------------------------------------------
// Fallback line scanner
// ---------------------------------------------------------------------------

fn scan_file(content: &str) -> FileEntry {
    let mut entry = FileEntry::default();
    for (i, raw) in content.lines().enumerate() {
        entry.lines = i + 1;
        let line = raw.trim_start();
        if let Some(import) = parse_import(line) {
            entry.imports.push(import);
            continue;
        }
        if let Some(symbol) = parse_symbol(line, i + 1) {
            entry.symbols.push(symbol);
        }
    }
    entry
}

fn parse_import(line: &str) -> Option<String> {
    for prefix in ["use ", "import ", "from ", "require(", "#include "] {
        if let Some(rest) = line.strip_prefix(prefix) {
            let target = rest
                .split(|c: char| c == ';' || c == ')' || c.is_whitespace())
                .next()
                .unwrap_or("");
            if !target.is_empty() {
                return Some(target.to_owned());
            }
        }
    }
    None
}

fn parse_symbol(line: &str, lineno: usize) -> Option<Symbol> {
    let (marked_public, rest) = if let Some(rest) = line.strip_prefix("pub ") {
        (true, rest)
    } else if let Some(rest) = line.strip_prefix("export ") {
        (true, rest)
    } else {
        (false, line)
    };

    // Keyword-visibility languages (Rust-style) are private without the
    // marker; convention-visibility languages export anything not
    // underscore-prefixed.
    let (kind, keyword_visibility, rest) = if let Some(r) = rest.strip_prefix("fn ") {
        (SymbolKind::Function, true, r)
    } else if let Some(r) = rest.strip_prefix("def ") {
        (SymbolKind::Function, false, r)
    } else if let Some(r) = rest.strip_prefix("func ") {
        (SymbolKind::Function, false, r)
    } else if let Some(r) = rest.strip_prefix("function ") {
        (SymbolKind::Function, false, r)
    } else if let Some(r) = rest.strip_prefix("class ") {
        (SymbolKind::Type, false, r)
    } else if let Some(r) = rest.strip_prefix("struct ") {
        (SymbolKind::Type, true, r)
    } else if let Some(r) = rest.strip_prefix("enum ") {
        (SymbolKind::Type, true, r)
    } else if let Some(r) = rest.strip_prefix("trait ") {
        (SymbolKind::Type, true, r)
    } else if let Some(r) = rest.strip_prefix("const ") {
        (SymbolKind::Const, true, r)
    } else {
        return None;
    };

    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        return None;
    }
    let exported = if keyword_visibility {
        marked_public
    } else {
        !name.starts_with('_')
    };
    Some(Symbol {
        name,
        kind,
        line: lineno,
        exported,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
