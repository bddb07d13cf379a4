//! Production build manifest
//!
//! Maps logical source entries (e.g. `src/main.ts`) to the content-hashed files
//! the build emitted. The manifest is loaded and validated once; lookups never
//! touch the filesystem.

use crate::error::{AssetNotFound, ManifestLoadError};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

/// One entry of the build manifest. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Emitted file, relative to the bundle directory
    pub file: String,
    /// Source path the chunk was built from
    #[serde(default)]
    pub src: Option<String>,
    /// Chunk name
    #[serde(default)]
    pub name: Option<String>,
    /// Stylesheets extracted from this chunk
    #[serde(default)]
    pub css: Vec<String>,
    /// Static assets referenced by this chunk
    #[serde(default)]
    pub assets: Vec<String>,
    /// Statically imported manifest keys
    #[serde(default)]
    pub imports: Vec<String>,
    /// Dynamically imported manifest keys (not preloaded)
    #[serde(default)]
    pub dynamic_imports: Vec<String>,
    #[serde(default)]
    pub is_entry: bool,
    #[serde(default)]
    pub is_dynamic_entry: bool,
}

/// Files required to load one entry
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedAsset {
    pub file: String,
    pub css_files: Vec<String>,
    pub preload_files: Vec<String>,
}

/// A validated, immutable manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: HashMap<String, ManifestEntry>,
    emitted: HashSet<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

impl Manifest {
    /// Read, parse and validate the manifest at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestLoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ManifestLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: HashMap<String, ManifestEntry> =
            serde_json::from_str(&content).map_err(|source| ManifestLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let manifest = Self::from_entries(entries)?;
        info!(
            path = %path.display(),
            entries = manifest.entries.len(),
            entry_points = manifest.entries.values().filter(|e| e.is_entry).count(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Parse a manifest from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestLoadError> {
        let entries: HashMap<String, ManifestEntry> =
            serde_json::from_str(json).map_err(|source| ManifestLoadError::Parse {
                path: "<inline>".into(),
                source,
            })?;
        Self::from_entries(entries)
    }

    /// Validate the import graph and build the manifest
    pub fn from_entries(
        entries: HashMap<String, ManifestEntry>,
    ) -> Result<Self, ManifestLoadError> {
        validate_imports(&entries)?;

        let emitted = entries
            .values()
            .flat_map(|e| {
                std::iter::once(&e.file)
                    .chain(e.css.iter())
                    .chain(e.assets.iter())
            })
            .cloned()
            .collect();

        Ok(Self { entries, emitted })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, entry_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(entry_id)
    }

    /// Whether `file` (relative to the bundle directory) was emitted by the build
    pub fn contains_file(&self, file: &str) -> bool {
        self.emitted.contains(file)
    }

    /// Collect the entry file plus every stylesheet and preloaded chunk it needs
    pub fn resolve(&self, entry_id: &str) -> Result<ResolvedAsset, AssetNotFound> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| AssetNotFound(entry_id.to_string()))?;

        let mut css_files = Vec::new();
        let mut preload_files = Vec::new();
        let mut seen_css = HashSet::new();
        let mut seen_files = HashSet::from([entry.file.as_str()]);
        let mut visited = HashSet::from([entry_id]);

        self.collect(
            entry,
            &mut visited,
            &mut seen_css,
            &mut seen_files,
            &mut css_files,
            &mut preload_files,
        );

        Ok(ResolvedAsset {
            file: entry.file.clone(),
            css_files,
            preload_files,
        })
    }

    fn collect<'a>(
        &'a self,
        entry: &'a ManifestEntry,
        visited: &mut HashSet<&'a str>,
        seen_css: &mut HashSet<&'a str>,
        seen_files: &mut HashSet<&'a str>,
        css_files: &mut Vec<String>,
        preload_files: &mut Vec<String>,
    ) {
        for css in &entry.css {
            if seen_css.insert(css.as_str()) {
                css_files.push(css.clone());
            }
        }

        for import in &entry.imports {
            if !visited.insert(import.as_str()) {
                continue;
            }
            // Imports were validated at load time
            let Some(child) = self.entries.get(import) else {
                continue;
            };
            if seen_files.insert(child.file.as_str()) {
                preload_files.push(child.file.clone());
            }
            self.collect(child, visited, seen_css, seen_files, css_files, preload_files);
        }
    }
}

/// Depth-first walk with an on-stack set; reaching a node that is still on the
/// stack means the import graph has a cycle.
fn validate_imports(entries: &HashMap<String, ManifestEntry>) -> Result<(), ManifestLoadError> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(entries.len());

    let mut keys: Vec<&String> = entries.keys().collect();
    keys.sort();

    for key in keys {
        if marks.contains_key(key.as_str()) {
            continue;
        }
        let mut stack: Vec<&str> = Vec::new();
        visit(key, entries, &mut marks, &mut stack)?;
    }
    Ok(())
}

fn visit<'a>(
    key: &'a str,
    entries: &'a HashMap<String, ManifestEntry>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Result<(), ManifestLoadError> {
    marks.insert(key, Mark::OnStack);
    stack.push(key);

    if let Some(entry) = entries.get(key) {
        for import in &entry.imports {
            if !entries.contains_key(import) {
                return Err(ManifestLoadError::DanglingImport {
                    entry: key.to_string(),
                    import: import.clone(),
                });
            }
            match marks.get(import.as_str()) {
                Some(Mark::OnStack) => {
                    let start = stack.iter().position(|k| *k == import.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|k| k.to_string()).collect();
                    cycle.push(import.clone());
                    return Err(ManifestLoadError::Cycle { cycle });
                }
                Some(Mark::Done) => {}
                None => visit(import, entries, marks, stack)?,
            }
        }
    }

    stack.pop();
    marks.insert(key, Mark::Done);
    Ok(())
}
