//! Shared test utilities for inkline.
//!
//! This module provides common helpers used across multiple test modules.
//! It is only compiled when running tests.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::TempDir;

use crate::compiler::{CompileFailure, CompiledStory, CompilerOptions, ErrorType, InkCompiler};
use crate::config::Settings;
use crate::story::Story;

/// Creates a temporary project directory for testing.
///
/// Returns a tuple of (TempDir, PathBuf) where:
/// - TempDir: The temp directory handle (must be kept alive for the test duration)
/// - PathBuf: The path to the project subdirectory
///
/// Project scans skip hidden directories, and temp directories can live under
/// paths like `/tmp/.tmpXXXXX`, so files go into a non-hidden `story`
/// subdirectory.
pub fn create_test_story_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let story_dir = temp_dir.path().join("story");
    fs::create_dir(&story_dir).expect("Failed to create story subdirectory");
    (temp_dir, story_dir)
}

/// Creates a test story from a temporary directory.
///
/// # Example
///
/// ```ignore
/// use crate::test_utils::create_test_story;
///
/// let (_temp_dir, story_dir, story) = create_test_story(|dir| {
///     std::fs::write(dir.join("main.ink"), "=== Start ===").unwrap();
/// });
/// ```
pub fn create_test_story<F>(setup_fn: F) -> (TempDir, PathBuf, Story)
where
    F: FnOnce(&PathBuf),
{
    let (temp_dir, story_dir) = create_test_story_dir();
    setup_fn(&story_dir);
    let story = Story::construct_story(&Settings::default(), &story_dir);
    (temp_dir, story_dir, story)
}

static KNOT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*={2,}\s*(\w+)").unwrap());
static STITCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*=\s*(\w+)").unwrap());
static DECLARATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:VAR|CONST|LIST)\s+(\w+)").unwrap());
static INCLUDE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*INCLUDE\s+(.+)$").unwrap());
static VARIABLE_USE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").unwrap());
static DIVERT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"->\s*(\w+)").unwrap());

/// A tiny scripted stand-in for the ink compiler.
///
/// It understands just enough ink to exercise the bridge:
/// - `-> Name` to an unknown knot: `Divert target not found: '-> Name'`
/// - `{name}` without a `VAR`/`CONST`/`LIST`: `Unresolved variable: name`
/// - a line containing `BROKEN`: `Unexpected token 'BROKEN'`
/// - a line starting with `TODO:`: an author message
/// - `INCLUDE`: loaded through the file handler; knots and variables count
///
/// Any error fails the compile. Successful compiles return a JSON object
/// listing the knots.
#[derive(Default)]
pub struct StubCompiler {
    last_source: Mutex<Option<String>>,
    last_options: Mutex<Option<(bool, Option<String>, usize)>>,
    sources: Mutex<Vec<String>>,
}

impl StubCompiler {
    pub fn last_source(&self) -> Option<String> {
        self.last_source.lock().unwrap().clone()
    }

    /// (count_all_visits, source_filename, plugin count) of the last call.
    pub fn last_options(&self) -> Option<(bool, Option<String>, usize)> {
        self.last_options.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    fn declarations(
        text: &str,
        options: &CompilerOptions<'_>,
        knots: &mut HashSet<String>,
        variables: &mut HashSet<String>,
        seen: &mut HashSet<String>,
    ) {
        for line in text.lines() {
            if let Some(caps) = KNOT_RE.captures(line) {
                knots.insert(caps[1].to_string());
            } else if let Some(caps) = STITCH_RE.captures(line) {
                knots.insert(caps[1].to_string());
            }
            if let Some(caps) = DECLARATION_RE.captures(line) {
                variables.insert(caps[1].to_string());
            }
            if let (Some(caps), Some(handler)) = (INCLUDE_RE.captures(line), options.file_handler)
            {
                let name = caps[1].trim().to_string();
                if !seen.insert(name.clone()) {
                    continue;
                }
                let resolved = handler.resolve_ink_filename(&name);
                if let Ok(contents) = handler.load_ink_file_contents(&resolved) {
                    Self::declarations(&contents, options, knots, variables, seen);
                }
            }
        }
    }
}

impl InkCompiler for StubCompiler {
    fn compile(
        &self,
        source: &str,
        options: &CompilerOptions<'_>,
        on_error: &mut dyn FnMut(&str, ErrorType),
    ) -> Result<CompiledStory, CompileFailure> {
        *self.last_source.lock().unwrap() = Some(source.to_string());
        *self.last_options.lock().unwrap() = Some((
            options.count_all_visits,
            options.source_filename.clone(),
            options.plugin_names.len(),
        ));
        self.sources.lock().unwrap().push(source.to_string());

        let mut knots = HashSet::new();
        let mut variables = HashSet::new();
        Self::declarations(
            source,
            options,
            &mut knots,
            &mut variables,
            &mut HashSet::new(),
        );

        let mut errors = 0;
        for (idx, line) in source.lines().enumerate() {
            let line_no = idx + 1;

            if let Some(todo) = line.trim_start().strip_prefix("TODO:") {
                on_error(
                    &format!("TODO: line {}: {}", line_no, todo.trim()),
                    ErrorType::Author,
                );
                continue;
            }

            if line.contains("BROKEN") {
                errors += 1;
                on_error(
                    &format!("ERROR: line {}: Unexpected token 'BROKEN'", line_no),
                    ErrorType::Error,
                );
            }

            if let Some(caps) = INCLUDE_RE.captures(line) {
                let name = caps[1].trim();
                let loaded = options.file_handler.is_some_and(|handler| {
                    handler
                        .load_ink_file_contents(&handler.resolve_ink_filename(name))
                        .is_ok()
                });
                if !loaded {
                    errors += 1;
                    on_error(
                        &format!("ERROR: line {}: Failed to load: '{}'", line_no, name),
                        ErrorType::Error,
                    );
                }
                continue;
            }

            for caps in VARIABLE_USE_RE.captures_iter(line) {
                if !variables.contains(&caps[1]) {
                    errors += 1;
                    on_error(
                        &format!("ERROR: line {}: Unresolved variable: {}", line_no, &caps[1]),
                        ErrorType::Error,
                    );
                }
            }

            for caps in DIVERT_RE.captures_iter(line) {
                let target = &caps[1];
                if target != "DONE" && target != "END" && !knots.contains(target) {
                    errors += 1;
                    on_error(
                        &format!(
                            "ERROR: line {}: Divert target not found: '-> {}'",
                            line_no, target
                        ),
                        ErrorType::Error,
                    );
                }
            }
        }

        if errors > 0 {
            return Err(CompileFailure::Errors(errors));
        }

        let mut knots: Vec<_> = knots.into_iter().collect();
        knots.sort();
        Ok(CompiledStory {
            json: serde_json::json!({ "inkVersion": 21, "knots": knots }).to_string(),
        })
    }
}
