//! The language server.
//!
//! [`Backend`] owns one [`Story`] index for the workspace and routes editor
//! events into it. Index updates take the story's write lock for a single
//! re-parse; queries take read locks. Compiler runs happen on the blocking
//! pool against a snapshot of the document and the loaded project files, and
//! their results are published only if no newer pass for the same document
//! has been published already.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tower_lsp::jsonrpc::{Error, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};

use crate::{
    compiler::{compile_with_engine, InkCompiler, ProcessCompiler, StoryFileHandler},
    completion::get_completions,
    config::Settings,
    diagnostics::{compiler_diagnostics, index_diagnostics, DiagnosticsLedger},
    gotodef::goto_definition,
    hover::hover,
    references::references,
    story::{normalize_path, Story, INK_EXTENSION},
    symbol::{document_symbol, workspace_symbol},
};

/// Compile the main file (or the file given as the first argument) and
/// return the story JSON tagged with the engine and markup settings.
pub const COMPILE_STORY_COMMAND: &str = "inkline.compileStory";

pub struct Backend {
    client: Client,
    /// Used instead of the configured `inklecate` when set.
    compiler_override: Option<Arc<dyn InkCompiler>>,
    workspace_root: RwLock<Option<PathBuf>>,
    client_settings: RwLock<Option<Value>>,
    settings: RwLock<Arc<Settings>>,
    story: RwLock<Story>,
    /// Open documents and their latest version.
    open_documents: RwLock<HashMap<Url, i32>>,
    ledger: Mutex<DiagnosticsLedger>,
}

/// Client settings may arrive wrapped in an `inkline` section.
fn client_section(value: Option<Value>) -> Option<Value> {
    let value = value?;
    match value.get("inkline") {
        Some(section) => Some(section.clone()),
        None => Some(value),
    }
}

fn is_ink_file(path: &Path) -> bool {
    path.extension() == Some(OsStr::new(INK_EXTENSION))
}

impl Backend {
    pub fn new(client: Client, compiler_override: Option<Arc<dyn InkCompiler>>) -> Self {
        Backend {
            client,
            compiler_override,
            workspace_root: RwLock::new(None),
            client_settings: RwLock::new(None),
            settings: RwLock::new(Arc::new(Settings::default())),
            story: RwLock::new(Story::empty(Path::new("."))),
            open_documents: RwLock::new(HashMap::new()),
            ledger: Mutex::new(DiagnosticsLedger::default()),
        }
    }

    fn compiler(&self, settings: &Settings) -> Arc<dyn InkCompiler> {
        match &self.compiler_override {
            Some(compiler) => compiler.clone(),
            None => Arc::new(ProcessCompiler::new(
                shellexpand::tilde(&settings.compiler_path).into_owned(),
            )),
        }
    }

    /// Take a fresh settings snapshot and re-index the project. Unsaved text
    /// of open documents survives the re-index.
    async fn reload(&self) {
        let workspace_root = match self.workspace_root.read().await.clone() {
            Some(root) => root,
            None => match std::env::current_dir() {
                Ok(dir) => dir,
                Err(err) => {
                    tracing::error!(%err, "no workspace root");
                    return;
                }
            },
        };
        let client_settings = self.client_settings.read().await.clone();

        let settings = match Settings::with_overrides(&workspace_root, client_settings.as_ref()) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(%err, "invalid configuration, using defaults");
                self.client
                    .show_message(
                        MessageType::WARNING,
                        format!("inkline: invalid configuration ({err}), using defaults"),
                    )
                    .await;
                Settings::default()
            }
        };
        let settings = Arc::new(settings);
        let project_root = settings.project_root(&workspace_root);

        let scan_settings = settings.clone();
        let scan_root = project_root.clone();
        let mut story = match tokio::task::spawn_blocking(move || {
            Story::construct_story(&scan_settings, &scan_root)
        })
        .await
        {
            Ok(story) => story,
            Err(err) => {
                tracing::error!(%err, "project scan failed");
                Story::empty(&project_root)
            }
        };

        {
            let open = self.open_documents.read().await;
            let old = self.story.read().await;
            for uri in open.keys() {
                let Ok(path) = uri.to_file_path() else {
                    continue;
                };
                if let Some(file) = old.get_file(&normalize_path(&path)) {
                    story.update_story(&file.path, &file.text);
                }
            }
        }

        let document_count = story.document_count();
        *self.story.write().await = story;
        *self.settings.write().await = settings;

        self.client
            .log_message(
                MessageType::INFO,
                format!(
                    "inkline: indexed {} ink files under {}",
                    document_count,
                    project_root.display()
                ),
            )
            .await;
    }

    async fn update_document(&self, uri: &Url, version: i32, text: &str) {
        let Ok(path) = uri.to_file_path() else {
            return;
        };
        self.open_documents.write().await.insert(uri.clone(), version);
        self.story.write().await.update_story(&path, text);
    }

    async fn open_document(&self, uri: &Url, version: i32, text: &str) {
        self.ledger.lock().await.open(uri);
        self.update_document(uri, version, text).await;
    }

    /// Forget an open document. Its file stays indexed from disk if it is part
    /// of the project: under the project root, or included by a project file.
    async fn close_document(&self, uri: &Url) {
        self.open_documents.write().await.remove(uri);
        self.ledger.lock().await.close(uri);

        let Ok(path) = uri.to_file_path() else {
            return;
        };
        let path = normalize_path(&path);
        let mut story = self.story.write().await;
        let in_project = path.starts_with(story.root_dir()) || story.is_included(&path);
        match std::fs::read_to_string(&path) {
            Ok(text) if in_project => story.update_story(&path, &text),
            _ => {
                story.remove_file(&path);
            }
        }
    }

    /// Run a diagnostics pass for an open document. Returns nothing if the
    /// document was closed meanwhile or a newer pass got there first.
    async fn diagnostics_pass(&self, uri: &Url) -> Option<(Vec<Diagnostic>, i32)> {
        let path = uri.to_file_path().ok()?;
        let version = self.open_documents.read().await.get(uri).copied()?;
        let session = self.ledger.lock().await.session(uri)?;
        let settings = self.settings.read().await.clone();

        let (text, mut diags, handler) = {
            let story = self.story.read().await;
            let file = story.get_file(&normalize_path(&path))?;
            let text = file.text.clone();
            let diags = index_diagnostics(&story, &settings, (&file.path, &text));
            (text, diags, StoryFileHandler::new(&story))
        };

        let compiler = self.compiler(&settings);
        let compiled = tokio::task::spawn_blocking(move || {
            compiler_diagnostics(compiler.as_ref(), &settings, &text, Some(&handler))
        })
        .await;
        match compiled {
            Ok(mut compiled) => {
                compiled.append(&mut diags);
                diags = compiled;
            }
            Err(err) => tracing::error!(%err, uri = %uri, "compiler task failed"),
        }

        if !self.ledger.lock().await.commit(uri, session, version) {
            tracing::debug!(uri = %uri, version, "discarding stale diagnostics");
            return None;
        }
        Some((diags, version))
    }

    async fn publish_diagnostics(&self, uri: Url) {
        if let Some((diags, version)) = self.diagnostics_pass(&uri).await {
            self.client
                .publish_diagnostics(uri, diags, Some(version))
                .await;
        }
    }

    async fn publish_open_documents(&self) {
        let uris: Vec<Url> = self.open_documents.read().await.keys().cloned().collect();
        for uri in uris {
            self.publish_diagnostics(uri).await;
        }
    }

    async fn compile_story(&self, target: Option<PathBuf>) -> anyhow::Result<Value> {
        let settings = self.settings.read().await.clone();

        let (entry, text, handler) = {
            let story = self.story.read().await;
            let entry = target
                .map(|path| normalize_path(&path))
                .or_else(|| settings.main_file_path(story.root_dir()))
                .ok_or_else(|| anyhow!("no story to compile: pass a file or set main_file"))?;
            let text = story
                .load_contents(&entry)
                .with_context(|| format!("cannot read {}", entry.display()))?;
            (entry, text, StoryFileHandler::new(&story))
        };

        let compiler = self.compiler(&settings);
        let engine_settings = settings.clone();
        let healed = tokio::task::spawn_blocking(move || {
            compile_with_engine(compiler.as_ref(), &engine_settings, &text, Some(&handler))
        })
        .await??;

        tracing::info!(
            entry = %entry.display(),
            patches = healed.patches.count(),
            "compiled story"
        );

        Ok(json!({
            "engine": settings.engine,
            "markup": settings.markup,
            "story": serde_json::from_str::<Value>(&healed.story.json)?,
            "patches": healed.patches,
        }))
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        #[allow(deprecated)]
        let root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .and_then(|folder| folder.uri.to_file_path().ok())
            .or_else(|| {
                params
                    .root_uri
                    .as_ref()
                    .and_then(|uri| uri.to_file_path().ok())
            });

        *self.workspace_root.write().await = root;
        *self.client_settings.write().await = client_section(params.initialization_options);
        self.reload().await;

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![">".into(), "-".into(), " ".into()]),
                    ..Default::default()
                }),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                workspace_symbol_provider: Some(OneOf::Left(true)),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![COMPILE_STORY_COMMAND.into()],
                    work_done_progress_options: Default::default(),
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "inkline".into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        let registration = DidChangeWatchedFilesRegistrationOptions {
            watchers: vec![FileSystemWatcher {
                glob_pattern: GlobPattern::String(format!("**/*.{}", INK_EXTENSION)),
                kind: None,
            }],
        };
        let Ok(register_options) = serde_json::to_value(registration) else {
            return;
        };
        if let Err(err) = self
            .client
            .register_capability(vec![Registration {
                id: "inkline-watch-ink".into(),
                method: "workspace/didChangeWatchedFiles".into(),
                register_options: Some(register_options),
            }])
            .await
        {
            tracing::debug!(%err, "client did not accept file watching");
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        self.open_document(&document.uri, document.version, &document.text)
            .await;
        self.publish_diagnostics(document.uri).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        let document = params.text_document;
        self.update_document(&document.uri, document.version, &change.text)
            .await;
        self.publish_diagnostics(document.uri).await;
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        self.publish_diagnostics(params.text_document.uri).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.close_document(&uri).await;
        self.client.publish_diagnostics(uri, vec![], None).await;
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        *self.client_settings.write().await = client_section(Some(params.settings));
        self.reload().await;
        self.publish_open_documents().await;
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        let mut changed = false;
        for change in params.changes {
            let Ok(path) = change.uri.to_file_path() else {
                continue;
            };
            if !is_ink_file(&path) || self.open_documents.read().await.contains_key(&change.uri) {
                continue;
            }

            let mut story = self.story.write().await;
            if change.typ == FileChangeType::DELETED {
                story.remove_file(&path);
            } else if let Ok(text) = std::fs::read_to_string(&path) {
                story.update_story(&path, &text);
            }
            changed = true;
        }

        if changed {
            self.publish_open_documents().await;
        }
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let Ok(path) = params.text_document_position.text_document.uri.to_file_path() else {
            return Ok(None);
        };
        let settings = self.settings.read().await.clone();
        let story = self.story.read().await;
        Ok(get_completions(&story, &params, &normalize_path(&path), &settings))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let position = params.text_document_position_params;
        let Ok(path) = position.text_document.uri.to_file_path() else {
            return Ok(None);
        };
        let story = self.story.read().await;
        Ok(
            goto_definition(&story, position.position, &normalize_path(&path))
                .map(GotoDefinitionResponse::Array),
        )
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let Ok(path) = params
            .text_document_position_params
            .text_document
            .uri
            .to_file_path()
        else {
            return Ok(None);
        };
        let settings = self.settings.read().await.clone();
        let story = self.story.read().await;
        Ok(hover(&story, &params, &normalize_path(&path), &settings))
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let position = params.text_document_position;
        let Ok(path) = position.text_document.uri.to_file_path() else {
            return Ok(None);
        };
        let story = self.story.read().await;
        Ok(references(
            &story,
            position.position,
            &normalize_path(&path),
            params.context.include_declaration,
        ))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let Ok(path) = params.text_document.uri.to_file_path() else {
            return Ok(None);
        };
        let story = self.story.read().await;
        Ok(document_symbol(&story, &normalize_path(&path)))
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        let story = self.story.read().await;
        Ok(workspace_symbol(&story, &params))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        if params.command != COMPILE_STORY_COMMAND {
            return Err(Error::invalid_params(format!(
                "unknown command {}",
                params.command
            )));
        }

        let target = params
            .arguments
            .first()
            .and_then(Value::as_str)
            .and_then(|uri| Url::parse(uri).ok())
            .and_then(|uri| uri.to_file_path().ok());

        match self.compile_story(target).await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(%err, "compile command failed");
                self.client
                    .show_message(MessageType::ERROR, format!("inkline: {err}"))
                    .await;
                Ok(None)
            }
        }
    }
}

/// Serve LSP over stdio until the client disconnects.
pub async fn run_server(compiler_override: Option<Arc<dyn InkCompiler>>) {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(|client| Backend::new(client, compiler_override));
    Server::new(stdin, stdout, socket).serve(service).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Engine;
    use crate::test_utils::{create_test_story, StubCompiler};
    use crate::compiler::{CompileFailure, CompiledStory, CompilerOptions, ErrorType};
    use std::fs;
    use std::sync::{mpsc, Mutex as StdMutex};

    fn backend_with(compiler: Arc<dyn InkCompiler>) -> LspService<Backend> {
        let (service, _socket) =
            LspService::new(move |client| Backend::new(client, Some(compiler)));
        service
    }

    fn backend_with_stub() -> (LspService<Backend>, Arc<StubCompiler>) {
        let compiler = Arc::new(StubCompiler::default());
        (backend_with(compiler.clone()), compiler)
    }

    /// Signals when a compile starts and blocks it until released.
    struct GatedCompiler {
        started: StdMutex<mpsc::Sender<()>>,
        release: StdMutex<mpsc::Receiver<()>>,
    }

    impl InkCompiler for GatedCompiler {
        fn compile(
            &self,
            _source: &str,
            _options: &CompilerOptions<'_>,
            on_error: &mut dyn FnMut(&str, ErrorType),
        ) -> std::result::Result<CompiledStory, CompileFailure> {
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            on_error("ERROR: line 1: Divert target not found: '-> Gone'", ErrorType::Error);
            Err(CompileFailure::Errors(1))
        }
    }

    #[test]
    fn test_client_section_unwraps_inkline_key() {
        let nested = json!({ "inkline": { "hover": false } });
        assert_eq!(client_section(Some(nested)), Some(json!({ "hover": false })));

        let flat = json!({ "markup": "Plain" });
        assert_eq!(client_section(Some(flat.clone())), Some(flat));
        assert_eq!(client_section(None), None);
    }

    #[test]
    fn test_is_ink_file() {
        assert!(is_ink_file(Path::new("/story/main.ink")));
        assert!(!is_ink_file(Path::new("/story/notes.txt")));
        assert!(!is_ink_file(Path::new("/story/ink")));
    }

    #[tokio::test]
    async fn test_compile_story_command_heals_and_tags_the_story() {
        let (_temp_dir, _story_dir, story) = create_test_story(|dir| {
            fs::write(dir.join("main.ink"), "=== Start ===\n{coins} -> Shop").unwrap();
        });
        let (service, compiler) = backend_with_stub();
        let backend = service.inner();

        *backend.story.write().await = story;
        *backend.settings.write().await = Arc::new(Settings {
            engine: Engine::PixiVn,
            main_file: Some("main.ink".to_string()),
            ..Settings::default()
        });

        let value = backend.compile_story(None).await.unwrap();

        assert_eq!(value["engine"], "PixiVn");
        assert_eq!(value["markup"], "Markdown");
        assert_eq!(value["story"]["inkVersion"], 21);
        assert_eq!(value["patches"]["knots"], json!(["Shop"]));
        assert_eq!(value["patches"]["variables"], json!(["coins"]));
        assert_eq!(compiler.call_count(), 3);
    }

    #[tokio::test]
    async fn test_compile_story_without_entry_is_an_error() {
        let (_temp_dir, _story_dir, story) = create_test_story(|_| {});
        let (service, _compiler) = backend_with_stub();
        let backend = service.inner();
        *backend.story.write().await = story;

        let err = backend.compile_story(None).await.unwrap_err();
        assert!(err.to_string().contains("no story to compile"));
    }

    #[tokio::test]
    async fn test_compile_story_rejected_by_ink_engine() {
        let (_temp_dir, story_dir, story) = create_test_story(|dir| {
            fs::write(dir.join("main.ink"), "-> Missing").unwrap();
        });
        let (service, _compiler) = backend_with_stub();
        let backend = service.inner();
        *backend.story.write().await = story;

        let err = backend
            .compile_story(Some(story_dir.join("main.ink")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Divert target not found"));
    }

    #[tokio::test]
    async fn test_diagnostics_pass_for_open_document() {
        let (_temp_dir, story_dir, story) = create_test_story(|dir| {
            fs::write(dir.join("main.ink"), "=== Start ===\n-> Nowhere").unwrap();
        });
        let (service, _compiler) = backend_with_stub();
        let backend = service.inner();
        *backend.story.write().await = story;

        let uri = Url::from_file_path(story_dir.join("main.ink")).unwrap();
        backend.open_document(&uri, 3, "=== Start ===\n-> Nowhere").await;

        let (diags, version) = backend.diagnostics_pass(&uri).await.unwrap();
        assert_eq!(version, 3);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].range.start.line, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pass_finishing_after_close_is_dropped() {
        let (_temp_dir, story_dir, story) = create_test_story(|dir| {
            fs::write(dir.join("main.ink"), "-> Gone").unwrap();
        });
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let service = backend_with(Arc::new(GatedCompiler {
            started: StdMutex::new(started_tx),
            release: StdMutex::new(release_rx),
        }));
        let backend = service.inner();
        *backend.story.write().await = story;

        let uri = Url::from_file_path(story_dir.join("main.ink")).unwrap();
        backend.open_document(&uri, 1, "-> Gone").await;

        let close_midway = async {
            tokio::task::spawn_blocking(move || started_rx.recv())
                .await
                .unwrap()
                .unwrap();
            backend.close_document(&uri).await;
            release_tx.send(()).unwrap();
        };
        let (pass, ()) = tokio::join!(backend.diagnostics_pass(&uri), close_midway);

        assert!(pass.is_none());
        assert!(backend.diagnostics_pass(&uri).await.is_none());
    }

    #[tokio::test]
    async fn test_close_keeps_project_files_and_drops_outside_ones() {
        let (temp_dir, story_dir, story) = create_test_story(|dir| {
            fs::write(dir.join("main.ink"), "=== Start ===").unwrap();
        });
        let outside = temp_dir.path().join("scratch.ink");
        fs::write(&outside, "=== Scratch ===").unwrap();

        let (service, _compiler) = backend_with_stub();
        let backend = service.inner();
        *backend.story.write().await = story;

        let inside_uri = Url::from_file_path(story_dir.join("main.ink")).unwrap();
        let outside_uri = Url::from_file_path(&outside).unwrap();
        backend.open_document(&inside_uri, 2, "=== Edited ===").await;
        backend.open_document(&outside_uri, 1, "=== Scratch ===").await;
        assert!(backend.story.read().await.get_file(&outside).is_some());

        backend.close_document(&inside_uri).await;
        backend.close_document(&outside_uri).await;

        let story = backend.story.read().await;
        assert!(story.select_knot("Start").is_some(), "reloaded from disk");
        assert!(story.select_knot("Edited").is_none());
        assert!(story.get_file(&outside).is_none());
        assert!(story.select_knot("Scratch").is_none());
    }
}
