//! Integration tests for the inkline library public API.
//!
//! These tests drive the library the way an external consumer would: build a
//! story index, plug in a compiler of their own and read the results.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::TempDir;

use inkline::compiler::{
    compile_with_engine, CompileError, CompileFailure, CompiledStory, CompilerOptions, ErrorType,
    InkCompiler, SelfHealer,
};
use inkline::config::{Engine, Markup, Settings};
use inkline::diagnostics::diagnostics;
use inkline::story::Story;

/// Helper: Create a temporary project directory for testing.
///
/// Returns (TempDir, PathBuf) - keep TempDir alive for test duration.
fn create_test_story_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let story_dir = temp_dir.path().join("story");
    fs::create_dir(&story_dir).expect("Failed to create story subdirectory");
    (temp_dir, story_dir)
}

/// Knows about `=== knot ===` headers and `-> target` diverts, nothing else.
#[derive(Default)]
struct DivertOnlyCompiler {
    sources: Mutex<Vec<String>>,
}

impl DivertOnlyCompiler {
    fn last_source(&self) -> String {
        self.sources.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

impl InkCompiler for DivertOnlyCompiler {
    fn compile(
        &self,
        source: &str,
        _options: &CompilerOptions<'_>,
        on_error: &mut dyn FnMut(&str, ErrorType),
    ) -> Result<CompiledStory, CompileFailure> {
        self.sources.lock().unwrap().push(source.to_string());

        let knots: HashSet<&str> = source
            .lines()
            .filter_map(|line| line.trim().strip_prefix("==="))
            .filter_map(|rest| rest.split_whitespace().next())
            .collect();

        let mut errors = 0;
        for (idx, line) in source.lines().enumerate() {
            let Some((_, target)) = line.split_once("->") else {
                continue;
            };
            let target = target.trim();
            if !target.is_empty() && target != "DONE" && target != "END" && !knots.contains(target)
            {
                errors += 1;
                on_error(
                    &format!(
                        "ERROR: line {}: Divert target not found: '-> {}'",
                        idx + 1,
                        target
                    ),
                    ErrorType::Error,
                );
            }
        }

        if errors > 0 {
            Err(CompileFailure::Errors(errors))
        } else {
            Ok(CompiledStory {
                json: r#"{"inkVersion":21}"#.to_string(),
            })
        }
    }
}

// ============================================================================
// Public API Accessibility Tests
// ============================================================================

#[test]
fn test_story_construction_from_external_crate() {
    let (_temp_dir, story_dir) = create_test_story_dir();
    fs::write(story_dir.join("main.ink"), "=== Start ===\nHello.\n-> END").unwrap();

    let story = Story::construct_story(&Settings::default(), &story_dir);

    assert_eq!(story.document_count(), 1);
    assert_eq!(story.select_knots(None).len(), 1);
}

#[test]
fn test_settings_defaults() {
    let settings = Settings::default();

    assert_eq!(settings.engine, Engine::Ink);
    assert_eq!(settings.markup, Markup::Markdown);
    assert_eq!(settings.compiler_path, "inklecate");
    assert_eq!(settings.self_heal_max_iterations, 32);
    assert!(settings.hover);
    assert!(settings.include_diagnostics);
}

#[test]
fn test_settings_read_project_file() {
    let (_temp_dir, story_dir) = create_test_story_dir();
    fs::write(
        story_dir.join(".inkline.toml"),
        "engine = \"PixiVn\"\nmain_file = \"start.ink\"\n",
    )
    .unwrap();

    let settings = Settings::new(&story_dir).unwrap();

    assert_eq!(settings.engine, Engine::PixiVn);
    assert_eq!(
        settings.main_file_path(&story_dir),
        Some(story_dir.join("start.ink"))
    );
}

// ============================================================================
// Compiler bridge from the outside
// ============================================================================

#[test]
fn test_self_healing_appends_stub_for_missing_divert() {
    let compiler = DivertOnlyCompiler::default();
    let healer = SelfHealer::new(&compiler, None, 32);

    let healed = healer.compile("=== Start ===\n-> Missing").unwrap();

    assert_eq!(healed.patches.knots, vec!["Missing".to_string()]);
    assert!(compiler.last_source().contains("=== Missing ==="));
    assert_eq!(compiler.sources.lock().unwrap().len(), 2);
}

#[test]
fn test_plain_engine_rejects_missing_divert() {
    let compiler = DivertOnlyCompiler::default();
    let settings = Settings::default();

    let err = compile_with_engine(&compiler, &settings, "-> Missing", None).unwrap_err();

    match err {
        CompileError::Rejected { message } => {
            assert_eq!(message, "ERROR: line 1: Divert target not found: '-> Missing'")
        }
        other => panic!("Expected a rejection, got {other:?}"),
    }
}

#[test]
fn test_self_healing_respects_iteration_cap() {
    let compiler = DivertOnlyCompiler::default();
    let healer = SelfHealer::new(&compiler, None, 1);

    let err = healer
        .compile("=== Start ===\n-> First\n-> Second")
        .unwrap_err();

    assert!(matches!(err, CompileError::Exhausted { iterations: 1, .. }));
}

#[test]
fn test_diagnostics_with_external_compiler() {
    let (_temp_dir, story_dir) = create_test_story_dir();
    let text = "=== Start ===\n-> Nowhere";
    fs::write(story_dir.join("main.ink"), text).unwrap();

    let story = Story::construct_story(&Settings::default(), &story_dir);
    let diags = diagnostics(
        &story,
        &Settings::default(),
        &DivertOnlyCompiler::default(),
        None,
        (&story_dir.join("main.ink"), text),
    );

    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].range.start.line, 1);
    assert_eq!(diags[0].message, "Divert target not found: '-> Nowhere'");
    assert_eq!(diags[0].source.as_deref(), Some("inkline"));
}
