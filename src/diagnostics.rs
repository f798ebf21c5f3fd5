//! Diagnostics for ink documents.
//!
//! A diagnostics pass combines three independent sources:
//!
//! | Source | Severity | Range |
//! |--------|----------|-------|
//! | Compiler issues | as reported | the whole reported line |
//! | Include checker | Error (missing) / Warning (extension) | the `INCLUDE` line |
//! | Story graph | Warning (shadowed knot), Information (include cycle) | the header / `INCLUDE` line |
//!
//! Compiler issues without a line are file-level and are not shown as ranges.
//! Each pass replaces the document's previous diagnostics wholesale;
//! [`DiagnosticsLedger`] makes sure a slow pass cannot overwrite the results
//! of a newer one.

use std::collections::HashMap;
use std::path::Path;

use itertools::Itertools;
use ropey::Rope;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Url};

use crate::{
    compiler::{collect_issues, FileHandler, InkCompiler, Issue, SelfHealer, Severity},
    config::{Engine, Settings},
    story::{check_includes, InkRange, IncludeProblem, Story},
};

pub const SOURCE: &str = "inkline";

/// Run the configured engine over `text` and return its issues.
pub fn compiler_issues(
    compiler: &dyn InkCompiler,
    settings: &Settings,
    text: &str,
    file_handler: Option<&dyn FileHandler>,
) -> Vec<Issue> {
    match settings.engine {
        Engine::Ink => collect_issues(compiler, text, file_handler),
        Engine::PixiVn => {
            let healed = SelfHealer::new(compiler, file_handler, settings.self_heal_max_iterations)
                .heal_issues(text);
            if !healed.patches.is_empty() {
                tracing::debug!(
                    knots = ?healed.patches.knots,
                    variables = ?healed.patches.variables,
                    "self-healing compile patched missing symbols"
                );
            }
            healed.issues
        }
    }
}

fn lsp_severity(severity: Severity) -> DiagnosticSeverity {
    match severity {
        Severity::Error => DiagnosticSeverity::ERROR,
        Severity::Warning => DiagnosticSeverity::WARNING,
        Severity::Information => DiagnosticSeverity::INFORMATION,
    }
}

/// Turn compiler issues into diagnostics spanning their (1-based) line.
pub fn issue_diagnostics(issues: &[Issue], rope: &Rope) -> Vec<Diagnostic> {
    issues
        .iter()
        .filter_map(|issue| {
            let line = issue.line?.checked_sub(1)? as usize;
            let text = if line < rope.len_lines() {
                rope.line(line).to_string()
            } else {
                String::new()
            };

            Some(Diagnostic {
                range: *InkRange::whole_line(line as u32, &text),
                severity: Some(lsp_severity(issue.severity)),
                message: issue.message.clone(),
                source: Some(SOURCE.into()),
                ..Default::default()
            })
        })
        .collect()
}

/// One diagnostic per problematic `INCLUDE` line of the document.
pub fn include_diagnostics(text: &str, root: &Path) -> Vec<Diagnostic> {
    check_includes(text, root)
        .into_iter()
        .map(|problem| Diagnostic {
            range: *problem.directive().range,
            severity: Some(match problem {
                IncludeProblem::Missing { .. } => DiagnosticSeverity::ERROR,
                IncludeProblem::WrongExtension { .. } => DiagnosticSeverity::WARNING,
            }),
            message: problem.message(),
            source: Some(SOURCE.into()),
            ..Default::default()
        })
        .collect()
}

/// Warnings on knot headers in `path` that another definition shadows, and
/// notes on `INCLUDE` lines that close an include cycle.
pub fn story_diagnostics(story: &Story, path: &Path) -> Vec<Diagnostic> {
    let shadowed = story
        .shadowed_knots()
        .into_iter()
        .filter(|(shadowed, _)| shadowed.path() == path)
        .map(|(shadowed, winner)| Diagnostic {
            range: *shadowed.range(),
            severity: Some(DiagnosticSeverity::WARNING),
            message: format!(
                "Duplicate knot '{}': the definition in {} line {} is used",
                shadowed.qualified_name(),
                story.display_path(winner.path()),
                winner.line() + 1
            ),
            source: Some(SOURCE.into()),
            ..Default::default()
        });

    let cycles = story
        .include_graph()
        .cyclic_includes(path)
        .into_iter()
        .filter_map(|(line, cycle)| {
            let text = story.select_line(path, line as usize)?;
            Some(Diagnostic {
                range: *InkRange::whole_line(line, &text),
                severity: Some(DiagnosticSeverity::INFORMATION),
                message: format!(
                    "Include cycle: {}",
                    cycle.iter().map(|p| story.display_path(p)).join(", ")
                ),
                source: Some(SOURCE.into()),
                ..Default::default()
            })
        });

    shadowed.chain(cycles).collect()
}

/// The diagnostics that need only the index, not the compiler.
pub fn index_diagnostics(
    story: &Story,
    settings: &Settings,
    (path, text): (&Path, &str),
) -> Vec<Diagnostic> {
    let mut diags = vec![];
    if settings.include_diagnostics {
        diags.extend(include_diagnostics(text, story.root_dir()));
    }
    diags.extend(story_diagnostics(story, path));
    diags
}

/// The compiler's diagnostics for one document, if enabled.
pub fn compiler_diagnostics(
    compiler: &dyn InkCompiler,
    settings: &Settings,
    text: &str,
    file_handler: Option<&dyn FileHandler>,
) -> Vec<Diagnostic> {
    if !settings.compiler_diagnostics {
        return vec![];
    }
    let issues = compiler_issues(compiler, settings, text, file_handler);
    issue_diagnostics(&issues, &Rope::from_str(text))
}

/// All diagnostics for one document.
pub fn diagnostics(
    story: &Story,
    settings: &Settings,
    compiler: &dyn InkCompiler,
    file_handler: Option<&dyn FileHandler>,
    (path, text): (&Path, &str),
) -> Vec<Diagnostic> {
    let mut diags = compiler_diagnostics(compiler, settings, text, file_handler);
    diags.extend(index_diagnostics(story, settings, (path, text)));
    diags
}

/// Open documents and the latest diagnostics version committed for each.
///
/// Passes are not cancelled when a newer edit arrives; instead a finished
/// pass commits only if its document is still open in the session the pass
/// started in and no newer version has been committed already.
#[derive(Debug, Default)]
pub struct DiagnosticsLedger {
    sessions: HashMap<Url, Session>,
    next_session: u64,
}

#[derive(Debug)]
struct Session {
    id: u64,
    committed: Option<i32>,
}

impl DiagnosticsLedger {
    /// Start a new session for `uri`. Passes from earlier sessions can no
    /// longer commit.
    pub fn open(&mut self, uri: &Url) -> u64 {
        self.next_session += 1;
        self.sessions.insert(
            uri.clone(),
            Session {
                id: self.next_session,
                committed: None,
            },
        );
        self.next_session
    }

    /// The current session of `uri`, if it is open.
    pub fn session(&self, uri: &Url) -> Option<u64> {
        self.sessions.get(uri).map(|session| session.id)
    }

    /// Record `version` for `uri` and report whether its results may be published.
    pub fn commit(&mut self, uri: &Url, session: u64, version: i32) -> bool {
        match self.sessions.get_mut(uri) {
            Some(current) if current.id == session => match current.committed {
                Some(latest) if latest > version => false,
                _ => {
                    current.committed = Some(version);
                    true
                }
            },
            _ => false,
        }
    }

    pub fn close(&mut self, uri: &Url) {
        self.sessions.remove(uri);
    }
}
