//! [`InkCompiler`] backed by the `inklecate` command line compiler.
//!
//! inklecate reads its includes from disk, relative to the root file. The
//! root text and every file reachable through the include callbacks are
//! written into a scratch directory with the same relative layout, so the
//! compiler sees the editor's unsaved text rather than what is on disk.
//! Includes that would land outside the scratch directory (absolute paths,
//! `..`) are staged under `__external__/` and their `INCLUDE` lines rewritten.

use std::path::{Component, Path, PathBuf};
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{CompileFailure, CompiledStory, CompilerOptions, ErrorType, FileHandler, InkCompiler};
use crate::story::include_path;

const ROOT_FILE: &str = "__root__.ink";
const OUTPUT_FILE: &str = "__root__.ink.json";
/// Scratch subfolder for includes that live outside the root file's folder.
const EXTERNAL_DIR: &str = "__external__";

static MESSAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?<tag>RUNTIME ERROR|RUNTIME WARNING|ERROR|WARNING|TODO):\s*(?:'(?<file>[^']*)'\s*)?(?:line (?<line>\d+):\s*)?(?<message>.*)$",
    )
    .expect("inklecate message regex")
});

#[derive(Debug, Clone)]
pub struct ProcessCompiler {
    executable: PathBuf,
}

impl ProcessCompiler {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        ProcessCompiler {
            executable: executable.into(),
        }
    }

    /// Copy the include closure of `source` into `dir` and return `source`
    /// with its includes pointing at the staged copies.
    fn stage_includes(
        &self,
        source: &str,
        dir: &Path,
        handler: &dyn FileHandler,
        staged: &mut Vec<(String, String)>,
    ) -> std::io::Result<String> {
        let mut lines = vec![];
        for line in source.lines() {
            let Some(name) = include_path(line) else {
                lines.push(line.to_string());
                continue;
            };

            let known = staged
                .iter()
                .find(|(include, _)| include == name)
                .map(|(_, target)| target.clone());
            let target = match known {
                Some(target) => target,
                None => {
                    let target = staged_name(name, staged.len());
                    staged.push((name.to_string(), target.clone()));

                    let resolved = handler.resolve_ink_filename(name);
                    // A file that cannot be loaded is left for inklecate to report.
                    if let Ok(contents) = handler.load_ink_file_contents(&resolved) {
                        let contents = self.stage_includes(&contents, dir, handler, staged)?;
                        let path = dir.join(&target);
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&path, contents)?;
                    }
                    target
                }
            };

            if target == name {
                lines.push(line.to_string());
            } else {
                lines.push(line.replacen(name, &target, 1));
            }
        }
        Ok(lines.join("\n"))
    }
}

/// Where an include is staged inside the scratch dir. Plain relative names
/// keep their layout; absolute names and names climbing out with `..` are
/// moved under [`EXTERNAL_DIR`].
fn staged_name(name: &str, index: usize) -> String {
    let path = Path::new(name);
    let contained = path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if contained {
        return name.to_string();
    }
    let file_name = path
        .file_name()
        .map(|file| file.to_string_lossy().into_owned())
        .unwrap_or_else(|| "include.ink".to_string());
    format!("{EXTERNAL_DIR}/{index}_{file_name}")
}

/// Rewrite one line of inklecate output into the `TAG: line N: message` shape
/// the bridge expects. Messages about other files lose their line token so
/// they are reported file-level.
pub(crate) fn translate_message(raw: &str) -> Option<(String, ErrorType)> {
    let caps = MESSAGE_RE.captures(raw.trim())?;
    let tag = caps.name("tag")?.as_str();
    let error_type = match tag {
        "ERROR" | "RUNTIME ERROR" => ErrorType::Error,
        "WARNING" | "RUNTIME WARNING" => ErrorType::Warning,
        _ => ErrorType::Author,
    };
    let message = caps.name("message").map(|m| m.as_str()).unwrap_or_default();
    let file = caps.name("file").map(|m| m.as_str());
    let line = caps.name("line").map(|m| m.as_str());

    let translated = match (file, line) {
        (Some(file), Some(line)) if file != ROOT_FILE => {
            format!("{tag}: {message} ({file}:{line})")
        }
        (_, Some(line)) => format!("{tag}: line {line}: {message}"),
        (Some(file), None) if file != ROOT_FILE => format!("{tag}: {message} ({file})"),
        _ => format!("{tag}: {message}"),
    };
    Some((translated, error_type))
}

impl InkCompiler for ProcessCompiler {
    fn compile(
        &self,
        source: &str,
        options: &CompilerOptions<'_>,
        on_error: &mut dyn FnMut(&str, ErrorType),
    ) -> Result<CompiledStory, CompileFailure> {
        let dir = tempfile::tempdir()?;
        let root_name = options.source_filename.as_deref().unwrap_or(ROOT_FILE);

        let mut staged = vec![];
        let root_source = match options.file_handler {
            Some(handler) => self.stage_includes(source, dir.path(), handler, &mut staged)?,
            None => source.to_string(),
        };
        std::fs::write(dir.path().join(ROOT_FILE), root_source)?;

        let mut command = Command::new(&self.executable);
        if options.count_all_visits {
            command.arg("-c");
        }
        let output = command
            .arg("-o")
            .arg(OUTPUT_FILE)
            .arg(ROOT_FILE)
            .current_dir(dir.path())
            .output()?;

        let mut errors = 0;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            if let Some((message, error_type)) = translate_message(line) {
                if error_type == ErrorType::Error {
                    errors += 1;
                }
                let mut message = message.replace(ROOT_FILE, root_name);
                for (include, target) in &staged {
                    if include != target {
                        message = message.replace(target.as_str(), include);
                    }
                }
                on_error(&message, error_type);
            }
        }

        if !output.status.success() || errors > 0 {
            return Err(if errors > 0 {
                CompileFailure::Errors(errors)
            } else {
                CompileFailure::Other(format!(
                    "{} exited with {}",
                    self.executable.display(),
                    output.status
                ))
            });
        }

        let json = std::fs::read_to_string(dir.path().join(OUTPUT_FILE))?;
        Ok(CompiledStory {
            json: json.trim_start_matches('\u{feff}').to_string(),
        })
    }
}
