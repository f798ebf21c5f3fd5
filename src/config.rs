use std::path::{Path, PathBuf};

use anyhow::anyhow;
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::story::normalize_path;

/// One immutable snapshot of the project configuration.
///
/// A snapshot is taken when the server starts and again whenever the client
/// reports a configuration change; every indexing or diagnostics pass reads
/// the snapshot it was handed and nothing else.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Settings {
    /// Which compiler front end drives diagnostics and story compilation.
    pub engine: Engine,
    /// How hover documentation is rendered.
    pub markup: Markup,
    /// Overrides the workspace folder as the project root. Relative values
    /// resolve against the workspace folder.
    pub root_folder: Option<String>,
    /// Entry file used when compiling the whole project.
    pub main_file: Option<String>,
    /// The ink compiler executable.
    pub compiler_path: String,
    /// Upper bound on stub insertions during a self-healing compile.
    pub self_heal_max_iterations: usize,
    pub hover: bool,
    pub include_diagnostics: bool,
    pub compiler_diagnostics: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Engine {
    /// Plain ink: the compiler's errors are reported as they are.
    Ink,
    /// The pixi-vn dialect: unknown labels and variables are provided by the
    /// host, so the compiler is run in self-healing mode.
    PixiVn,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Markup {
    Markdown,
    Plain,
}

impl Settings {
    pub fn new(root_dir: &Path) -> anyhow::Result<Settings> {
        Settings::with_overrides(root_dir, None)
    }

    /// Layer, lowest first: defaults, `~/.config/inkline/settings`,
    /// `<root>/.inkline`, then client-provided JSON.
    pub fn with_overrides(
        root_dir: &Path,
        client_settings: Option<&serde_json::Value>,
    ) -> anyhow::Result<Settings> {
        let expanded = shellexpand::tilde("~/.config/inkline/settings");
        let mut builder = Config::builder()
            .add_source(File::with_name(&expanded).required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.inkline",
                    root_dir
                        .to_str()
                        .ok_or(anyhow!("Can't convert root_dir to str"))?
                ))
                .required(false),
            )
            .set_default("engine", "Ink")?
            .set_default("markup", "Markdown")?
            .set_default("compiler_path", "inklecate")?
            .set_default("self_heal_max_iterations", 32)?
            .set_default("hover", true)?
            .set_default("include_diagnostics", true)?
            .set_default("compiler_diagnostics", true)?;

        if let Some(value) = client_settings.filter(|value| value.is_object()) {
            builder = builder.add_source(File::from_str(&value.to_string(), FileFormat::Json));
        }

        let settings = builder
            .build()
            .map_err(|err| anyhow!("Build err: {err}"))?;

        let settings = settings.try_deserialize::<Settings>()?;

        anyhow::Ok(settings)
    }

    /// The project root: the `root_folder` override if set, else the
    /// workspace folder.
    pub fn project_root(&self, workspace_root: &Path) -> PathBuf {
        match &self.root_folder {
            Some(folder) if !folder.trim().is_empty() => {
                let expanded = shellexpand::tilde(folder.trim());
                let path = Path::new(expanded.as_ref());
                if path.is_absolute() {
                    normalize_path(path)
                } else {
                    normalize_path(&workspace_root.join(path))
                }
            }
            _ => normalize_path(workspace_root),
        }
    }

    /// The configured main file, resolved against the project root.
    pub fn main_file_path(&self, project_root: &Path) -> Option<PathBuf> {
        let main = self.main_file.as_deref()?.trim();
        if main.is_empty() {
            return None;
        }
        let path = Path::new(main);
        Some(if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&project_root.join(path))
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            engine: Engine::Ink,
            markup: Markup::Markdown,
            root_folder: None,
            main_file: None,
            compiler_path: "inklecate".to_string(),
            self_heal_max_iterations: 32,
            hover: true,
            include_diagnostics: true,
            compiler_diagnostics: true,
        }
    }
}
