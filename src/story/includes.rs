//! `INCLUDE` resolution and the project include graph.
//!
//! Relative include paths always resolve against the project root, never
//! against the including file's directory. The resolver, the include graph
//! and the per-document include checker share [`resolve_include_path`] so the
//! policy is applied uniformly.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use petgraph::algo::tarjan_scc;
use petgraph::prelude::*;
use petgraph::visit::Dfs;
use walkdir::WalkDir;

use super::parsing;
use super::types::{IncludeDirective, InkRange};
use super::InkFile;

/// The file extension ink sources are expected to carry.
pub const INK_EXTENSION: &str = "ink";

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. The file does not need to exist. A path that folds
/// away entirely becomes `.`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(Component::CurDir);
    }
    normalized
}

/// Absolute include paths are used verbatim, relative ones are joined to the
/// project root.
pub fn resolve_include_path(raw: &str, root: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&root.join(path))
    }
}

/// Load `entry` and everything reachable from it through `INCLUDE` lines.
///
/// The entry file comes first, each included file is followed by its own
/// includes depth-first. A path already visited in this traversal is skipped,
/// so cyclic includes terminate with one entry per file. Files that cannot be
/// read are skipped without an error.
pub fn resolve_includes(entry: &Path, root: &Path) -> Vec<InkFile> {
    let mut visited = HashSet::new();
    let mut result = Vec::new();
    let entry = match entry.to_str() {
        Some(entry) => resolve_include_path(entry, root),
        None => normalize_path(&root.join(entry)),
    };
    load_recursive(&entry, root, &mut visited, &mut result);
    result
}

/// Like [`resolve_includes`], but for a file whose (possibly unsaved) text is
/// already known. Only the files it includes are read from disk.
pub fn resolve_includes_from(
    entry: &Path,
    text: &str,
    root: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Vec<InkFile> {
    let entry = normalize_path(entry);
    let mut result = Vec::new();
    if !visited.insert(entry.clone()) {
        return result;
    }

    let file = InkFile::new(text, entry);
    let includes = file.includes.clone();
    result.push(file);
    for include in includes {
        let target = resolve_include_path(&include.path, root);
        load_recursive(&target, root, visited, &mut result);
    }
    result
}

fn load_recursive(
    path: &Path,
    root: &Path,
    visited: &mut HashSet<PathBuf>,
    result: &mut Vec<InkFile>,
) {
    if !visited.insert(path.to_path_buf()) {
        return;
    }

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "skipping unreadable include");
            return;
        }
    };

    let file = InkFile::new(&text, path.to_path_buf());
    let includes = file.includes.clone();
    result.push(file);

    for include in includes {
        let target = resolve_include_path(&include.path, root);
        load_recursive(&target, root, visited, result);
    }
}

/// Load every `.ink` file under `folder` (relative folders resolve against
/// `root`). Hidden directories are not descended into.
pub fn load_ink_folder(folder: &Path, root: &Path) -> Vec<InkFile> {
    let folder = if folder.is_absolute() {
        normalize_path(folder)
    } else {
        normalize_path(&root.join(folder))
    };

    ink_file_paths(&folder)
        .into_iter()
        .filter_map(|path| {
            let text = std::fs::read_to_string(&path).ok()?;
            Some(InkFile::new(&text, path))
        })
        .collect()
}

/// Paths of every `.ink` file under `folder`, in walk order.
pub fn ink_file_paths(folder: &Path) -> Vec<PathBuf> {
    WalkDir::new(folder)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .map(|s| s.starts_with('.'))
                    .unwrap_or(false)
        })
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|e| e.to_str()) == Some(INK_EXTENSION))
        .map(|e| normalize_path(e.path()))
        .collect()
}

/// A problem with one `INCLUDE` line of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeProblem {
    /// Nothing exists at the resolved path.
    Missing {
        directive: IncludeDirective,
        resolved: PathBuf,
    },
    /// The file exists but is not a `.ink` file.
    WrongExtension {
        directive: IncludeDirective,
        resolved: PathBuf,
    },
}

impl IncludeProblem {
    pub fn directive(&self) -> &IncludeDirective {
        match self {
            IncludeProblem::Missing { directive, .. }
            | IncludeProblem::WrongExtension { directive, .. } => directive,
        }
    }

    pub fn message(&self) -> String {
        match self {
            IncludeProblem::Missing { directive, resolved } => format!(
                "Included file '{}' not found at {}",
                directive.path,
                resolved.display()
            ),
            IncludeProblem::WrongExtension { directive, .. } => format!(
                "Included file '{}' is not a .{} file",
                directive.path, INK_EXTENSION
            ),
        }
    }
}

/// Check the document's own `INCLUDE` lines (not recursively).
pub fn check_includes(text: &str, root: &Path) -> Vec<IncludeProblem> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let path = parsing::include_path(line)?;
            let directive = IncludeDirective {
                path: path.to_string(),
                line: idx as u32,
                range: InkRange::whole_line(idx as u32, line),
            };
            let resolved = resolve_include_path(path, root);

            if !resolved.exists() {
                Some(IncludeProblem::Missing {
                    directive,
                    resolved,
                })
            } else if resolved.extension().and_then(|e| e.to_str()) != Some(INK_EXTENSION) {
                Some(IncludeProblem::WrongExtension {
                    directive,
                    resolved,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Edge weight: the line of the `INCLUDE` directive in the including file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeEdge {
    pub line: u32,
}

/// Directed graph of direct includes between project files.
#[derive(Debug, Default, Clone)]
pub struct IncludeGraph {
    graph: DiGraph<PathBuf, IncludeEdge>,
    nodes: HashMap<PathBuf, NodeIndex>,
}

impl IncludeGraph {
    pub fn build<'a>(files: impl IntoIterator<Item = &'a InkFile>, root: &Path) -> IncludeGraph {
        let mut graph = IncludeGraph::default();
        for file in files {
            let from = graph.node(&file.path);
            for include in &file.includes {
                let to = graph.node(&resolve_include_path(&include.path, root));
                graph
                    .graph
                    .add_edge(from, to, IncludeEdge { line: include.line });
            }
        }
        graph
    }

    fn node(&mut self, path: &Path) -> NodeIndex {
        if let Some(idx) = self.nodes.get(path) {
            return *idx;
        }
        let idx = self.graph.add_node(path.to_path_buf());
        self.nodes.insert(path.to_path_buf(), idx);
        idx
    }

    pub fn file_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Files directly included by `path`.
    pub fn includes_of(&self, path: &Path) -> Vec<&Path> {
        let Some(idx) = self.nodes.get(path) else {
            return vec![];
        };
        let mut targets: Vec<_> = self
            .graph
            .edges(*idx)
            .map(|edge| (edge.weight().line, self.graph[edge.target()].as_path()))
            .collect();
        targets.sort();
        targets.into_iter().map(|(_, path)| path).collect()
    }

    /// Every file reachable from `path`, starting with `path` itself.
    pub fn reachable_from(&self, path: &Path) -> Vec<&Path> {
        let Some(start) = self.nodes.get(path) else {
            return vec![];
        };
        let mut dfs = Dfs::new(&self.graph, *start);
        let mut reachable = vec![];
        while let Some(idx) = dfs.next(&self.graph) {
            reachable.push(self.graph[idx].as_path());
        }
        reachable
    }

    /// Groups of files that include each other, directly or transitively.
    pub fn cycles(&self) -> Vec<Vec<&Path>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|idx| self.graph.contains_edge(*idx, *idx))
            })
            .map(|component| {
                let mut paths: Vec<_> = component
                    .into_iter()
                    .map(|idx| self.graph[idx].as_path())
                    .collect();
                paths.sort();
                paths
            })
            .collect()
    }

    /// The include lines in `path` whose target leads back to `path`.
    pub fn cyclic_includes(&self, path: &Path) -> Vec<(u32, Vec<&Path>)> {
        let Some(idx) = self.nodes.get(path) else {
            return vec![];
        };
        let Some(cycle) = self
            .cycles()
            .into_iter()
            .find(|cycle| cycle.contains(&path))
        else {
            return vec![];
        };

        self.graph
            .edges(*idx)
            .filter(|edge| cycle.contains(&self.graph[edge.target()].as_path()))
            .map(|edge| (edge.weight().line, cycle.clone()))
            .collect()
    }
}
