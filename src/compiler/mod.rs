//! Bridge to the external ink compiler.
//!
//! The compiler itself is a collaborator behind [`InkCompiler`]. This module
//! owns the contract around it: how it is invoked, how its raw messages are
//! turned into positioned [`Issue`]s, and how a failed compile still yields
//! whatever issues were reported before it gave up.
//!
//! | Entry point | Engine | On compiler failure |
//! |-------------|--------|---------------------|
//! | [`collect_issues`] | ink | issues collected so far |
//! | [`compile_story`] | ink | [`CompileError::Rejected`] |
//! | [`SelfHealer::heal_issues`] | pixi-vn | patch and retry, then issues |
//! | [`SelfHealer::compile`] | pixi-vn | patch and retry, then [`CompileError`] |
//! | [`compile_with_engine`] | either | as above |

mod process;
mod self_heal;

pub use process::ProcessCompiler;
pub use self_heal::{HealedIssues, HealedStory, Patches, SelfHealer};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::{Engine, Settings};
use crate::story::{resolve_include_path, Story};

/// Severity tag passed to the error handler, as the compiler reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// An author note, e.g. a `TODO:` line.
    Author,
    Warning,
    Error,
}

/// Include callbacks handed to the compiler.
pub trait FileHandler: Send + Sync {
    /// Map an `INCLUDE` name to the canonical name passed to `load_ink_file_contents`.
    fn resolve_ink_filename(&self, filename: &str) -> String;
    fn load_ink_file_contents(&self, filename: &str) -> std::io::Result<String>;
}

/// Options for one compiler invocation.
pub struct CompilerOptions<'a> {
    pub count_all_visits: bool,
    /// `None` keeps the root text anonymous.
    pub source_filename: Option<String>,
    pub plugin_names: Vec<String>,
    pub file_handler: Option<&'a dyn FileHandler>,
}

impl<'a> CompilerOptions<'a> {
    /// The options every diagnostics pass uses.
    pub fn for_diagnostics(file_handler: Option<&'a dyn FileHandler>) -> Self {
        CompilerOptions {
            count_all_visits: true,
            source_filename: None,
            plugin_names: vec![],
            file_handler,
        }
    }
}

/// A successfully compiled story in the runtime's JSON format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStory {
    pub json: String,
}

/// Why a compiler invocation did not produce a story.
#[derive(Debug, Error)]
pub enum CompileFailure {
    #[error("compilation failed with {0} error(s)")]
    Errors(usize),
    #[error("failed to run the ink compiler: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// The external ink compiler.
pub trait InkCompiler: Send + Sync {
    /// Compile `source`, reporting every message through `on_error` as it is
    /// found. A failed compile may still have reported messages.
    fn compile(
        &self,
        source: &str,
        options: &CompilerOptions<'_>,
        on_error: &mut dyn FnMut(&str, ErrorType),
    ) -> Result<CompiledStory, CompileFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
    Information,
}

impl From<ErrorType> for Severity {
    fn from(value: ErrorType) -> Self {
        match value {
            ErrorType::Error => Severity::Error,
            ErrorType::Warning => Severity::Warning,
            ErrorType::Author => Severity::Information,
        }
    }
}

/// One compiler-reported problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    /// The message without its `ERROR: line N:` prefix.
    pub message: String,
    /// 1-based line; `None` for a file-level issue with no line token.
    pub line: Option<u32>,
}

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z]+(?: [A-Z]+)*:\s*(?:'[^']*'\s*)?line \d+:\s?").expect("prefix regex")
});

static LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"line (\d+)").expect("line regex"));

impl Issue {
    pub fn from_message(message: &str, error_type: ErrorType) -> Issue {
        let cleaned = PREFIX_RE.replace(message, "").into_owned();
        let line = LINE_RE
            .captures(message)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());

        Issue {
            severity: error_type.into(),
            message: cleaned,
            line,
        }
    }
}

/// Everything one compiler run produced.
pub(crate) struct Attempt {
    pub result: Result<CompiledStory, CompileFailure>,
    pub issues: Vec<Issue>,
    /// Raw messages of Error severity, in report order.
    pub raw_errors: Vec<String>,
}

pub(crate) fn run_compiler(
    compiler: &dyn InkCompiler,
    text: &str,
    file_handler: Option<&dyn FileHandler>,
) -> Attempt {
    let mut issues = vec![];
    let mut raw_errors = vec![];
    let options = CompilerOptions::for_diagnostics(file_handler);

    let result = compiler.compile(text, &options, &mut |message, error_type| {
        if error_type == ErrorType::Error {
            raw_errors.push(message.to_string());
        }
        issues.push(Issue::from_message(message, error_type));
    });

    Attempt {
        result,
        issues,
        raw_errors,
    }
}

/// Compile `text` and return every issue the compiler reported. A failing
/// compile is not an error here: the issues reported before the failure are
/// returned as they are.
pub fn collect_issues(
    compiler: &dyn InkCompiler,
    text: &str,
    file_handler: Option<&dyn FileHandler>,
) -> Vec<Issue> {
    let attempt = run_compiler(compiler, text, file_handler);
    if let Err(failure) = &attempt.result {
        tracing::debug!(%failure, issues = attempt.issues.len(), "compile failed");
    }
    attempt.issues
}

/// Terminal failure of a story compile.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The compiler rejected the story and no repair applied. Carries the
    /// first error's raw message.
    #[error("{message}")]
    Rejected { message: String },
    /// The self-healing loop hit its iteration cap.
    #[error("gave up after {iterations} repairs: {message}")]
    Exhausted { iterations: usize, message: String },
    /// The compiler failed without reporting an error.
    #[error(transparent)]
    Failed(#[from] CompileFailure),
}

/// Compile `text` with the plain ink engine.
pub fn compile_story(
    compiler: &dyn InkCompiler,
    text: &str,
    file_handler: Option<&dyn FileHandler>,
) -> Result<CompiledStory, CompileError> {
    let attempt = run_compiler(compiler, text, file_handler);
    attempt.result.map_err(|failure| rejection(failure, attempt.raw_errors))
}

fn rejection(failure: CompileFailure, raw_errors: Vec<String>) -> CompileError {
    match raw_errors.into_iter().next() {
        Some(message) => CompileError::Rejected { message },
        None => CompileError::Failed(failure),
    }
}

/// Compile `text` the way the configured engine does.
///
/// With the ink engine the story is compiled once and no patches are made.
pub fn compile_with_engine(
    compiler: &dyn InkCompiler,
    settings: &Settings,
    text: &str,
    file_handler: Option<&dyn FileHandler>,
) -> Result<HealedStory, CompileError> {
    match settings.engine {
        Engine::Ink => {
            let Attempt {
                result,
                issues,
                raw_errors,
            } = run_compiler(compiler, text, file_handler);
            match result {
                Ok(story) => Ok(HealedStory {
                    story,
                    issues,
                    patches: Patches::default(),
                }),
                Err(failure) => Err(rejection(failure, raw_errors)),
            }
        }
        Engine::PixiVn => {
            SelfHealer::new(compiler, file_handler, settings.self_heal_max_iterations).compile(text)
        }
    }
}

/// Include callbacks backed by a snapshot of the story's loaded files.
///
/// Names resolve against the project root, the same way the include checker
/// resolves them; files that are not loaded are read from disk.
#[derive(Debug, Clone)]
pub struct StoryFileHandler {
    root: PathBuf,
    contents: HashMap<PathBuf, String>,
}

impl StoryFileHandler {
    pub fn new(story: &Story) -> Self {
        StoryFileHandler {
            root: story.root_dir().clone(),
            contents: story.snapshot_texts(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileHandler for StoryFileHandler {
    fn resolve_ink_filename(&self, filename: &str) -> String {
        resolve_include_path(filename, &self.root)
            .to_string_lossy()
            .into_owned()
    }

    fn load_ink_file_contents(&self, filename: &str) -> std::io::Result<String> {
        let path = PathBuf::from(filename);
        match self.contents.get(&path) {
            Some(text) => Ok(text.clone()),
            None => std::fs::read_to_string(&path),
        }
    }
}
