//! Command line front end.
//!
//! `serve` runs the language server; the other subcommands run one pass over
//! a project and print the result, which is handy in CI and for checking a
//! story without an editor.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity};

use crate::{
    compiler::{compile_with_engine, InkCompiler, ProcessCompiler, StoryFileHandler},
    config::Settings,
    diagnostics::{diagnostics, index_diagnostics},
    story::{normalize_path, Story},
    symbol::story_outline,
};

#[derive(Parser)]
#[command(
    name = "inkline",
    version,
    about = "Language server and checker for ink stories",
    after_help = r#"Examples:
  inkline serve
  inkline check story/main.ink
  inkline outline story/
  inkline compile story/main.ink > main.json
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the language server over stdin/stdout (the default).
    Serve,
    /// Print diagnostics for one file and exit nonzero on errors.
    Check {
        file: PathBuf,
        /// Workspace folder holding `.inkline`. Defaults to the file's folder.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Skip the compiler; report include and index problems only.
        #[arg(long)]
        no_compiler: bool,
    },
    /// Print the knots, stitches, variables and includes of a project as JSON.
    Outline {
        #[arg(default_value = ".")]
        root: PathBuf,
    },
    /// Compile a story with the configured engine and print the JSON.
    Compile {
        file: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

/// The settings snapshot and indexed story for a one-shot run.
pub struct Project {
    pub settings: Settings,
    pub story: Story,
}

/// `path` as an absolute, normalized path; relative paths are taken from `cwd`.
fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&cwd.join(path))
    }
}

fn current_dir() -> anyhow::Result<PathBuf> {
    std::env::current_dir().context("cannot read the current directory")
}

impl Project {
    /// Load settings from `workspace_root` and index the project root they
    /// name. A relative root is taken from the current directory.
    pub fn load(workspace_root: &Path) -> anyhow::Result<Project> {
        Project::load_in(&current_dir()?, workspace_root)
    }

    /// [`Project::load`] with relative paths taken from `cwd`.
    pub fn load_in(cwd: &Path, workspace_root: &Path) -> anyhow::Result<Project> {
        let workspace_root = absolutize(workspace_root, cwd);
        let settings = Settings::new(&workspace_root)?;
        let project_root = settings.project_root(&workspace_root);
        if !project_root.is_dir() {
            return Err(anyhow!("{} is not a directory", project_root.display()));
        }
        let story = Story::construct_story(&settings, &project_root);
        tracing::debug!(
            root = %project_root.display(),
            files = story.document_count(),
            "indexed project"
        );
        Ok(Project { settings, story })
    }

    /// Load the project around `file`, using its folder when no root is given.
    pub fn around(file: &Path, root: Option<&Path>) -> anyhow::Result<Project> {
        Project::around_in(&current_dir()?, file, root)
    }

    pub fn around_in(cwd: &Path, file: &Path, root: Option<&Path>) -> anyhow::Result<Project> {
        match root {
            Some(root) => Project::load_in(cwd, root),
            None => {
                let file = absolutize(file, cwd);
                Project::load_in(cwd, file.parent().unwrap_or(cwd))
            }
        }
    }

    pub fn compiler(&self) -> ProcessCompiler {
        ProcessCompiler::new(shellexpand::tilde(&self.settings.compiler_path).into_owned())
    }
}

/// Diagnostics for `file` rendered one per line as
/// `path:line:col: severity: message`, and whether any was an error.
pub fn check(
    project: &Project,
    file: &Path,
    compiler: Option<&dyn InkCompiler>,
) -> anyhow::Result<(String, bool)> {
    let file = absolutize(file, &current_dir()?);
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;

    let diags = match compiler {
        Some(compiler) => {
            let handler = StoryFileHandler::new(&project.story);
            diagnostics(
                &project.story,
                &project.settings,
                compiler,
                Some(&handler),
                (&file, &text),
            )
        }
        None => index_diagnostics(&project.story, &project.settings, (&file, &text)),
    };

    let display = project.story.display_path(&file);
    let mut report = String::new();
    for diag in &diags {
        writeln!(report, "{}", render_diagnostic(&display, diag))?;
    }
    let failed = diags
        .iter()
        .any(|diag| diag.severity == Some(DiagnosticSeverity::ERROR));
    Ok((report, failed))
}

fn render_diagnostic(display: &str, diag: &Diagnostic) -> String {
    let severity = match diag.severity {
        Some(DiagnosticSeverity::ERROR) => "error",
        Some(DiagnosticSeverity::WARNING) => "warning",
        Some(DiagnosticSeverity::HINT) => "hint",
        _ => "info",
    };
    format!(
        "{}:{}:{}: {}: {}",
        display,
        diag.range.start.line + 1,
        diag.range.start.character + 1,
        severity,
        diag.message
    )
}

pub fn outline(project: &Project) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&story_outline(&project.story))?)
}

/// Compile `file` with the configured engine. The result carries the story
/// JSON, the engine and markup tags, and the names the self-healer stubbed.
pub fn compile(
    project: &Project,
    file: &Path,
    compiler: &dyn InkCompiler,
) -> anyhow::Result<Value> {
    let file = absolutize(file, &current_dir()?);
    let text = project
        .story
        .load_contents(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let handler = StoryFileHandler::new(&project.story);

    let healed = compile_with_engine(compiler, &project.settings, &text, Some(&handler))?;
    for patch in &healed.patches.knots {
        tracing::info!(knot = %patch, "stubbed missing knot");
    }
    for patch in &healed.patches.variables {
        tracing::info!(variable = %patch, "declared missing variable");
    }

    Ok(json!({
        "engine": project.settings.engine,
        "markup": project.settings.markup,
        "story": serde_json::from_str::<Value>(&healed.story.json)?,
        "patches": healed.patches,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_story_dir, StubCompiler};
    use std::fs;

    #[test]
    fn test_check_reports_include_and_compiler_errors() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        fs::write(
            story_dir.join("main.ink"),
            "INCLUDE missing.ink\n=== Start ===\n-> Nowhere",
        )
        .unwrap();

        let project = Project::load(&story_dir).unwrap();
        let compiler = StubCompiler::default();
        let (report, failed) =
            check(&project, &story_dir.join("main.ink"), Some(&compiler)).unwrap();

        assert!(failed);
        assert!(report.contains("main.ink:3:1: error: Divert target not found: '-> Nowhere'"));
        assert!(report.contains("main.ink:1:1: error:"));
    }

    #[test]
    fn test_check_without_compiler_only_indexes() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        fs::write(story_dir.join("main.ink"), "=== Start ===\n-> Nowhere").unwrap();

        let project = Project::load(&story_dir).unwrap();
        let (report, failed) = check(&project, &story_dir.join("main.ink"), None).unwrap();

        assert!(!failed);
        assert!(report.is_empty());
    }

    #[test]
    fn test_outline_lists_every_file() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        fs::write(
            story_dir.join("main.ink"),
            "INCLUDE lib.ink\nVAR gold = 3\n=== Start ===\n= intro\nHi",
        )
        .unwrap();
        fs::write(story_dir.join("lib.ink"), "=== Shop ===").unwrap();

        let project = Project::load(&story_dir).unwrap();
        let value: Value = serde_json::from_str(&outline(&project).unwrap()).unwrap();
        let files = value.as_array().unwrap();
        assert_eq!(files.len(), 2);

        let main = files.iter().find(|file| file["path"] == "main.ink").unwrap();
        assert_eq!(main["includes"], json!(["lib.ink"]));
        assert_eq!(main["knots"][0]["name"], "Start");
        assert_eq!(main["variables"][0]["name"], "gold");
    }

    #[test]
    fn test_compile_reports_rejection() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        fs::write(story_dir.join("main.ink"), "BROKEN").unwrap();

        let project = Project::load(&story_dir).unwrap();
        let err = compile(&project, &story_dir.join("main.ink"), &StubCompiler::default())
            .unwrap_err();
        assert!(err.to_string().contains("Unexpected token 'BROKEN'"));
    }

    #[test]
    fn test_load_relative_current_dir() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        fs::write(story_dir.join("main.ink"), "=== Start ===").unwrap();

        let project = Project::load_in(&story_dir, Path::new(".")).unwrap();
        assert_eq!(project.story.root_dir(), &story_dir);
        assert_eq!(project.story.document_count(), 1);
    }

    #[test]
    fn test_around_bare_file_name_uses_current_dir() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        fs::write(story_dir.join("main.ink"), "=== Start ===").unwrap();

        let project = Project::around_in(&story_dir, Path::new("main.ink"), None).unwrap();
        assert_eq!(project.story.root_dir(), &story_dir);
        assert!(project.story.get_file(&story_dir.join("main.ink")).is_some());
    }

    #[test]
    fn test_absolutize() {
        let cwd = Path::new("/work/story");
        assert_eq!(absolutize(Path::new("."), cwd), PathBuf::from("/work/story"));
        assert_eq!(
            absolutize(Path::new("../other/main.ink"), cwd),
            PathBuf::from("/work/other/main.ink")
        );
        assert_eq!(absolutize(Path::new("/abs.ink"), cwd), PathBuf::from("/abs.ink"));
    }

    #[test]
    fn test_load_rejects_missing_root() {
        let (_temp_dir, story_dir) = create_test_story_dir();
        assert!(Project::load(&story_dir.join("nope")).is_err());
    }
}
