//! Self-healing compilation for the pixi-vn engine.
//!
//! pixi-vn stories divert to labels and read variables that the host
//! application provides at runtime, so the plain compiler rejects them. The
//! healer keeps compiling forward: when the first error is a missing divert
//! target it appends a stub knot, when it is an unresolved variable it
//! prepends a declaration, and it recompiles. Anything else ends the loop.
//!
//! ```text
//! compile ──ok──────────────────────────────► story + issues
//!    │
//!   err ── first Error matches a repair? ─no─► terminal failure
//!    │                 │
//!    │                yes ── already patched / cap reached ─► terminal failure
//!    │                 │
//!    └──── apply patch, recompile ◄──┘
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::{
    run_compiler, Attempt, CompileError, CompiledStory, FileHandler, InkCompiler, Issue, Severity,
};

static MISSING_TARGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Divert target not found: '-> (\w+)'").expect("missing target regex")
});

static UNRESOLVED_VARIABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Unresolved variable: (\w+)").expect("unresolved variable regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repair {
    StubKnot(String),
    DeclareVariable(String),
}

impl Repair {
    fn for_issue(issue: &Issue) -> Option<Repair> {
        if let Some(caps) = MISSING_TARGET_RE.captures(&issue.message) {
            return Some(Repair::StubKnot(caps[1].to_string()));
        }
        if let Some(caps) = UNRESOLVED_VARIABLE_RE.captures(&issue.message) {
            return Some(Repair::DeclareVariable(caps[1].to_string()));
        }
        None
    }
}

/// Names the healer synthesized, in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Patches {
    pub knots: Vec<String>,
    pub variables: Vec<String>,
}

impl Patches {
    pub fn is_empty(&self) -> bool {
        self.knots.is_empty() && self.variables.is_empty()
    }

    fn contains(&self, repair: &Repair) -> bool {
        match repair {
            Repair::StubKnot(name) => self.knots.contains(name),
            Repair::DeclareVariable(name) => self.variables.contains(name),
        }
    }

    fn apply(&mut self, repair: Repair) {
        match repair {
            Repair::StubKnot(name) => self.knots.push(name),
            Repair::DeclareVariable(name) => self.variables.push(name),
        }
    }

    pub fn count(&self) -> usize {
        self.knots.len() + self.variables.len()
    }
}

/// The author's text plus the synthesized stubs around it.
#[derive(Debug)]
struct PatchedSource<'a> {
    original: &'a str,
    patches: Patches,
}

impl<'a> PatchedSource<'a> {
    fn new(original: &'a str) -> Self {
        PatchedSource {
            original,
            patches: Patches::default(),
        }
    }

    /// Each declaration is prepended in turn, so the newest sits on top;
    /// stub knots are appended in turn.
    fn render(&self) -> String {
        let mut text = String::new();
        for name in self.patches.variables.iter().rev() {
            text.push_str(&format!("VAR {} = \"\"\n\n", name));
        }
        text.push_str(self.original);
        for name in &self.patches.knots {
            text.push_str(&format!("\n\n=== {} ===\n\n-> DONE", name));
        }
        text
    }

    /// Lines occupied by prepended declarations.
    fn prefix_lines(&self) -> u32 {
        2 * self.patches.variables.len() as u32
    }

    /// Map an issue from the patched text back onto the author's text.
    /// Issues located inside synthesized text are dropped.
    fn map_issue(&self, mut issue: Issue) -> Option<Issue> {
        let original_lines = self.original.lines().count().max(1) as u32;
        match issue.line {
            None => Some(issue),
            Some(line) => {
                let prefix = self.prefix_lines();
                if line <= prefix || line - prefix > original_lines {
                    return None;
                }
                issue.line = Some(line - prefix);
                Some(issue)
            }
        }
    }

    fn map_issues(&self, issues: Vec<Issue>) -> Vec<Issue> {
        issues
            .into_iter()
            .filter_map(|issue| self.map_issue(issue))
            .collect()
    }
}

/// Outcome of a self-healing issue pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealedIssues {
    pub issues: Vec<Issue>,
    pub patches: Patches,
}

/// Outcome of a successful self-healing compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealedStory {
    pub story: CompiledStory,
    pub issues: Vec<Issue>,
    pub patches: Patches,
}

enum Healed {
    Compiled(HealedStory),
    Failed {
        issues: Vec<Issue>,
        patches: Patches,
        error: CompileError,
    },
}

pub struct SelfHealer<'a> {
    compiler: &'a dyn InkCompiler,
    file_handler: Option<&'a dyn FileHandler>,
    max_iterations: usize,
}

impl<'a> SelfHealer<'a> {
    pub fn new(
        compiler: &'a dyn InkCompiler,
        file_handler: Option<&'a dyn FileHandler>,
        max_iterations: usize,
    ) -> Self {
        SelfHealer {
            compiler,
            file_handler,
            max_iterations,
        }
    }

    /// Issues for `text` after healing. Always returns a list: when healing
    /// gives up, the issues of the last attempt are returned, plus a
    /// file-level error if the iteration cap was the reason.
    pub fn heal_issues(&self, text: &str) -> HealedIssues {
        match self.heal(text) {
            Healed::Compiled(healed) => HealedIssues {
                issues: healed.issues,
                patches: healed.patches,
            },
            Healed::Failed {
                mut issues,
                patches,
                error,
            } => {
                if let CompileError::Exhausted { .. } = error {
                    issues.push(Issue {
                        severity: Severity::Error,
                        message: error.to_string(),
                        line: None,
                    });
                }
                HealedIssues { issues, patches }
            }
        }
    }

    /// Compile `text`, healing as needed.
    pub fn compile(&self, text: &str) -> Result<HealedStory, CompileError> {
        match self.heal(text) {
            Healed::Compiled(healed) => Ok(healed),
            Healed::Failed { error, .. } => Err(error),
        }
    }

    fn heal(&self, text: &str) -> Healed {
        let mut source = PatchedSource::new(text);

        loop {
            let Attempt {
                result,
                issues,
                raw_errors,
            } = run_compiler(self.compiler, &source.render(), self.file_handler);

            let failure = match result {
                Ok(story) => {
                    return Healed::Compiled(HealedStory {
                        story,
                        issues: source.map_issues(issues),
                        patches: source.patches,
                    })
                }
                Err(failure) => failure,
            };

            let first_error = issues
                .iter()
                .position(|issue| issue.severity == Severity::Error);

            let Some(first_error) = first_error else {
                return Healed::Failed {
                    issues: source.map_issues(issues),
                    patches: source.patches,
                    error: CompileError::Failed(failure),
                };
            };

            let raw = raw_errors
                .first()
                .cloned()
                .unwrap_or_else(|| issues[first_error].message.clone());

            let repair = Repair::for_issue(&issues[first_error])
                .filter(|repair| !source.patches.contains(repair));

            let Some(repair) = repair else {
                return Healed::Failed {
                    issues: source.map_issues(issues),
                    patches: source.patches,
                    error: CompileError::Rejected { message: raw },
                };
            };

            if source.patches.count() >= self.max_iterations {
                tracing::warn!(
                    iterations = self.max_iterations,
                    "self-healing compile reached its repair limit"
                );
                return Healed::Failed {
                    issues: source.map_issues(issues),
                    patches: source.patches,
                    error: CompileError::Exhausted {
                        iterations: self.max_iterations,
                        message: raw,
                    },
                };
            }

            tracing::debug!(?repair, "patching source and recompiling");
            source.patches.apply(repair);
        }
    }
}
