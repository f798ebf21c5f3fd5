//! The story graph: every knot, stitch, variable and divert in an ink project.
//!
//! A [`Story`] is the in-memory index of the project's `.ink` files. It is
//! built once from a folder scan and then refreshed one document at a time:
//! an edit re-parses the whole document and replaces everything that document
//! contributed. The methods are plain selects over the index; interpreting the
//! results is up to the LSP feature modules.

mod includes;
mod parsing;
mod types;


pub use includes::{
    check_includes, ink_file_paths, load_ink_folder, normalize_path, resolve_include_path,
    resolve_includes, resolve_includes_from, IncludeEdge, IncludeGraph, IncludeProblem,
    INK_EXTENSION,
};
pub use parsing::{
    char_to_byte, divert_targets, include_path, is_comment_line, strip_comment_line, word_at,
    Line, Token,
};
pub use types::{
    Divert, Header, IncludeDirective, InkRange, Knot, KnotKind, Rangeable, Stitch, Variable,
    VariableKind,
};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use pathdiff::diff_paths;
use rayon::prelude::*;
use ropey::Rope;
use tower_lsp::lsp_types::Position;

use crate::config::Settings;

/// One parsed `.ink` source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InkFile {
    pub path: PathBuf,
    pub text: String,
    pub rope: Rope,
    /// `INCLUDE` lines in file order.
    pub includes: Vec<IncludeDirective>,
    /// Knots in file order, each owning its stitches.
    pub knots: Vec<Knot>,
    /// Stitch headers that appear before any knot header.
    pub orphan_stitches: Vec<Header>,
    pub variables: Vec<Variable>,
    pub diverts: Vec<Divert>,
}

impl InkFile {
    /// Parse `text`. Never fails: malformed ink yields a partial index.
    pub fn new(text: &str, path: PathBuf) -> InkFile {
        let mut includes = vec![];
        let mut knots: Vec<Knot> = vec![];
        let mut orphan_stitches = vec![];
        let mut variables = vec![];
        let mut diverts = vec![];

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx as u32;

            match Line::classify(line) {
                Line::Knot {
                    function,
                    name,
                    parameters,
                } => knots.push(Knot {
                    name: name.text.to_string(),
                    kind: if function {
                        KnotKind::Function
                    } else {
                        KnotKind::Knot
                    },
                    parameters,
                    line: line_no,
                    range: InkRange::on_line(line_no, line, name.bytes()),
                    stitches: vec![],
                }),
                Line::Stitch { name, parameters } => {
                    let range = InkRange::on_line(line_no, line, name.bytes());
                    match knots.last_mut() {
                        Some(knot) => knot.stitches.push(Stitch {
                            name: name.text.to_string(),
                            knot: knot.name.clone(),
                            parameters,
                            line: line_no,
                            range,
                        }),
                        None => orphan_stitches.push(Header {
                            name: name.text.to_string(),
                            parameters,
                            line: line_no,
                            range,
                        }),
                    }
                }
                Line::Include { path } => includes.push(IncludeDirective {
                    path: path.to_string(),
                    line: line_no,
                    range: InkRange::whole_line(line_no, line),
                }),
                Line::Variable { kind, name } => variables.push(Variable {
                    name: name.text.to_string(),
                    kind,
                    line: line_no,
                    range: InkRange::on_line(line_no, line, name.bytes()),
                }),
                Line::Other => {}
            }

            diverts.extend(divert_targets(line).into_iter().map(|target| Divert {
                target: target.text.to_string(),
                line: line_no,
                range: InkRange::on_line(line_no, line, target.bytes()),
            }));
        }

        InkFile {
            path,
            text: text.to_string(),
            rope: Rope::from_str(text),
            includes,
            knots,
            orphan_stitches,
            variables,
            diverts,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name()?.to_str()
    }

    /// The knot whose body contains `line`: the last knot header at or above it.
    pub fn enclosing_knot(&self, line: u32) -> Option<&Knot> {
        self.knots.iter().rev().find(|knot| knot.line <= line)
    }

    /// Text of a 0-based line without its line ending.
    pub fn line_text(&self, line: usize) -> Option<String> {
        let slice = self.rope.get_line(line)?;
        Some(
            slice
                .to_string()
                .trim_end_matches(&['\r', '\n'][..])
                .to_string(),
        )
    }
}

/// Anything a divert, hover or goto can land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition<'a> {
    Knot(&'a Path, &'a Knot),
    Stitch(&'a Path, &'a Knot, &'a Stitch),
    Variable(&'a Path, &'a Variable),
}

impl<'a> Definition<'a> {
    pub fn path(&self) -> &'a Path {
        match *self {
            Definition::Knot(path, _)
            | Definition::Stitch(path, _, _)
            | Definition::Variable(path, _) => path,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            Definition::Knot(_, knot) => knot.line,
            Definition::Stitch(_, _, stitch) => stitch.line,
            Definition::Variable(_, variable) => variable.line,
        }
    }

    pub fn range(&self) -> InkRange {
        match self {
            Definition::Knot(_, knot) => knot.range,
            Definition::Stitch(_, _, stitch) => stitch.range,
            Definition::Variable(_, variable) => variable.range,
        }
    }

    /// `Knot`, `Knot.Stitch` or the variable name.
    pub fn qualified_name(&self) -> String {
        match self {
            Definition::Knot(_, knot) => knot.name.clone(),
            Definition::Stitch(_, _, stitch) => stitch.qualified_name(),
            Definition::Variable(_, variable) => variable.name.clone(),
        }
    }

    /// Same definition site, regardless of how it was reached.
    pub fn same_site(&self, other: &Definition) -> bool {
        self.path() == other.path() && self.line() == other.line()
    }
}

/// The in-memory index of an ink project.
#[derive(Debug, Clone)]
pub struct Story {
    files: HashMap<PathBuf, InkFile>,
    include_graph: IncludeGraph,
    root_dir: PathBuf,
}

impl Story {
    /// Index every `.ink` file under `root_dir`, plus anything they include
    /// from outside it. The configured main file is loaded first so its
    /// includes are always present.
    pub fn construct_story(settings: &Settings, root_dir: &Path) -> Story {
        let root_dir = normalize_path(root_dir);
        let paths = ink_file_paths(&root_dir);

        let mut files: HashMap<PathBuf, InkFile> = paths
            .par_iter()
            .flat_map(|path| {
                let text = std::fs::read_to_string(path)?;
                Ok::<(PathBuf, InkFile), std::io::Error>((
                    path.clone(),
                    InkFile::new(&text, path.clone()),
                ))
            })
            .collect();

        let mut visited: HashSet<PathBuf> = files.keys().cloned().collect();
        let mut extra = vec![];
        if let Some(main) = settings.main_file_path(&root_dir) {
            if !files.contains_key(&main) {
                extra.extend(resolve_includes(&main, &root_dir));
            }
        }
        for file in files.values() {
            for include in &file.includes {
                let target = resolve_include_path(&include.path, &root_dir);
                if !visited.contains(&target) {
                    extra.extend(resolve_includes_from_disk(&target, &root_dir, &mut visited));
                }
            }
        }
        for file in extra {
            files.entry(file.path.clone()).or_insert(file);
        }

        let include_graph = IncludeGraph::build(files.values(), &root_dir);
        tracing::info!(
            root = %root_dir.display(),
            files = files.len(),
            "indexed ink project"
        );

        Story {
            files,
            include_graph,
            root_dir,
        }
    }

    /// An empty story rooted at `root_dir`, filled through [`Story::update_story`].
    pub fn empty(root_dir: &Path) -> Story {
        Story {
            files: HashMap::new(),
            include_graph: IncludeGraph::default(),
            root_dir: normalize_path(root_dir),
        }
    }

    /// Replace everything `path` contributed with a fresh parse of `text`.
    /// Newly included files that are not indexed yet are loaded from disk.
    pub fn update_story(&mut self, path: &Path, text: &str) {
        let path = normalize_path(path);
        let new_file = InkFile::new(text, path.clone());

        let includes_changed = self
            .files
            .get(&path)
            .map(|old| old.includes != new_file.includes)
            .unwrap_or(true);

        self.files.insert(path.clone(), new_file);

        if includes_changed {
            let mut visited: HashSet<PathBuf> = self.files.keys().cloned().collect();
            let targets = self.files[&path]
                .includes
                .iter()
                .map(|include| resolve_include_path(&include.path, &self.root_dir))
                .collect_vec();
            for target in targets {
                for file in resolve_includes_from_disk(&target, &self.root_dir, &mut visited) {
                    self.files.entry(file.path.clone()).or_insert(file);
                }
            }
            self.rebuild_include_graph();
        }
    }

    /// Drop a file from the index.
    pub fn remove_file(&mut self, path: &Path) -> Option<InkFile> {
        let removed = self.files.remove(&normalize_path(path));
        if removed.is_some() {
            self.rebuild_include_graph();
        }
        removed
    }

    fn rebuild_include_graph(&mut self) {
        self.include_graph = IncludeGraph::build(self.files.values(), &self.root_dir);
    }

    /// Whether another indexed file includes `path`.
    pub fn is_included(&self, path: &Path) -> bool {
        self.files.values().any(|file| {
            file.path != path
                && file
                    .includes
                    .iter()
                    .any(|include| resolve_include_path(&include.path, &self.root_dir) == path)
        })
    }

    pub fn root_dir(&self) -> &PathBuf {
        &self.root_dir
    }

    pub fn include_graph(&self) -> &IncludeGraph {
        &self.include_graph
    }

    pub fn document_count(&self) -> usize {
        self.files.len()
    }

    pub fn get_file(&self, path: &Path) -> Option<&InkFile> {
        self.files.get(path)
    }

    /// All files, ordered by path.
    pub fn files(&self) -> Vec<&InkFile> {
        self.files
            .values()
            .sorted_by(|a, b| a.path.cmp(&b.path))
            .collect()
    }

    /// Path relative to the project root, for display.
    pub fn display_path(&self, path: &Path) -> String {
        diff_paths(path, &self.root_dir)
            .unwrap_or_else(|| path.to_path_buf())
            .display()
            .to_string()
    }

    pub fn select_line(&self, path: &Path, line: usize) -> Option<String> {
        self.files.get(path)?.line_text(line)
    }

    /// Generic helper for selecting Vec fields from InkFile with optional path filtering.
    ///
    /// Results are ordered by path, then by position within the file.
    fn select_field<'a, T>(
        &'a self,
        path: Option<&'a Path>,
        extractor: impl Fn(&'a InkFile) -> &'a Vec<T>,
    ) -> Vec<(&'a Path, &'a T)> {
        match path {
            Some(path) => self
                .files
                .get(path)
                .map(|file| extractor(file))
                .map(|vec| vec.iter().map(|item| (path, item)).collect())
                .unwrap_or_default(),
            None => self
                .files()
                .into_iter()
                .flat_map(|file| {
                    extractor(file)
                        .iter()
                        .map(|item| (file.path.as_path(), item))
                })
                .collect(),
        }
    }

    /// Knots in a file if path is Some, else every knot in the project.
    pub fn select_knots<'a>(&'a self, path: Option<&'a Path>) -> Vec<(&'a Path, &'a Knot)> {
        self.select_field(path, |file| &file.knots)
    }

    /// Every stitch with its owning knot, in knot order. Orphans are excluded.
    pub fn select_stitches<'a>(
        &'a self,
        path: Option<&'a Path>,
    ) -> Vec<(&'a Path, &'a Knot, &'a Stitch)> {
        self.select_knots(path)
            .into_iter()
            .flat_map(|(path, knot)| knot.stitches.iter().map(move |stitch| (path, knot, stitch)))
            .collect()
    }

    pub fn select_variables<'a>(&'a self, path: Option<&'a Path>) -> Vec<(&'a Path, &'a Variable)> {
        self.select_field(path, |file| &file.variables)
    }

    pub fn select_diverts<'a>(&'a self, path: Option<&'a Path>) -> Vec<(&'a Path, &'a Divert)> {
        self.select_field(path, |file| &file.diverts)
    }

    pub fn select_orphan_stitches<'a>(
        &'a self,
        path: Option<&'a Path>,
    ) -> Vec<(&'a Path, &'a Header)> {
        self.select_field(path, |file| &file.orphan_stitches)
    }

    /// Look up a knot by name. With duplicate names the last definition in
    /// (path, line) order wins, so the answer is stable across re-indexing.
    pub fn select_knot(&self, name: &str) -> Option<(&Path, &Knot)> {
        self.select_knots(None)
            .into_iter()
            .filter(|(_, knot)| knot.name == name)
            .last()
    }

    /// Knot definitions shadowed by a later definition of the same name,
    /// each paired with the definition that wins.
    pub fn shadowed_knots(&self) -> Vec<(Definition<'_>, Definition<'_>)> {
        self.select_knots(None)
            .into_iter()
            .into_group_map_by(|(_, knot)| knot.name.as_str())
            .into_values()
            .filter(|group| group.len() > 1)
            .flat_map(|group| {
                let (winner_path, winner) = group[group.len() - 1];
                let winner = Definition::Knot(winner_path, winner);
                group[..group.len() - 1]
                    .iter()
                    .map(|&(path, knot)| (Definition::Knot(path, knot), winner))
                    .collect_vec()
            })
            .sorted_by_key(|(shadowed, _)| (shadowed.path(), shadowed.line()))
            .collect()
    }

    pub fn select_variable(&self, name: &str) -> Option<(&Path, &Variable)> {
        self.select_variables(None)
            .into_iter()
            .filter(|(_, variable)| variable.name == name)
            .last()
    }

    /// The knot enclosing `line` of the file at `path`.
    pub fn enclosing_knot(&self, path: &Path, line: u32) -> Option<(&Path, &Knot)> {
        let (path, file) = self.files.get_key_value(path)?;
        Some((path.as_path(), file.enclosing_knot(line)?))
    }

    /// Resolve a divert target as written on `line` of `path`.
    ///
    /// - `Knot.Stitch`: the knot, then the stitch inside it.
    /// - `.Stitch`: a stitch of the enclosing knot only.
    /// - `Name`: a stitch of the enclosing knot first, then a knot.
    pub fn resolve_divert(&self, path: &Path, line: u32, target: &str) -> Option<Definition<'_>> {
        let parts = target.split('.').collect_vec();
        match parts.as_slice() {
            [name] => self
                .resolve_local_stitch(path, line, name)
                .or_else(|| self.select_knot(name).map(|(p, k)| Definition::Knot(p, k))),
            ["", stitch] => self.resolve_local_stitch(path, line, stitch),
            [knot, stitch] => {
                let (knot_path, knot) = self.select_knot(knot)?;
                let stitch = knot.stitch(stitch)?;
                Some(Definition::Stitch(knot_path, knot, stitch))
            }
            _ => None,
        }
    }

    fn resolve_local_stitch(&self, path: &Path, line: u32, name: &str) -> Option<Definition<'_>> {
        let (knot_path, knot) = self.enclosing_knot(path, line)?;
        let stitch = knot.stitch(name)?;
        Some(Definition::Stitch(knot_path, knot, stitch))
    }

    /// The knot or stitch whose header is at `position`, if any.
    pub fn select_header_at_position(
        &self,
        path: &Path,
        position: Position,
    ) -> Option<Definition<'_>> {
        let (path, file) = self.files.get_key_value(path)?;
        let path = path.as_path();
        file.knots.iter().find_map(|knot| {
            if knot.includes_position(position) {
                return Some(Definition::Knot(path, knot));
            }
            knot.stitches
                .iter()
                .find(|stitch| stitch.includes_position(position))
                .map(|stitch| Definition::Stitch(path, knot, stitch))
        })
    }

    pub fn select_divert_at_position(&self, path: &Path, position: Position) -> Option<&Divert> {
        self.files
            .get(path)?
            .diverts
            .iter()
            .find(|divert| divert.includes_position(position))
    }

    /// Contents for the compiler's include callback: the indexed text if the
    /// file is loaded, otherwise whatever is on disk.
    pub fn load_contents(&self, resolved: &Path) -> std::io::Result<String> {
        match self.files.get(resolved) {
            Some(file) => Ok(file.text.clone()),
            None => std::fs::read_to_string(resolved),
        }
    }

    /// Snapshot of every loaded file's text, for work that runs off the index.
    pub fn snapshot_texts(&self) -> HashMap<PathBuf, String> {
        self.files
            .iter()
            .map(|(path, file)| (path.clone(), file.text.clone()))
            .collect()
    }
}

/// [`resolve_includes`] with a visited-set shared across several roots.
fn resolve_includes_from_disk(
    target: &Path,
    root: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Vec<InkFile> {
    if visited.contains(target) {
        return vec![];
    }
    let Ok(text) = std::fs::read_to_string(target) else {
        visited.insert(target.to_path_buf());
        return vec![];
    };
    resolve_includes_from(target, &text, root, visited)
}
