use std::path::Path;

use tower_lsp::lsp_types::{CompletionItem, CompletionList, CompletionParams, CompletionResponse};

use crate::{config::Settings, story::Story};

use self::divert_completer::DivertCompleter;

mod divert_completer;

#[derive(Clone, Copy)]
pub struct Context<'a> {
    story: &'a Story,
    path: &'a Path,
    settings: &'a Settings,
}

pub trait Completer<'a>: Sized {
    fn construct(context: Context<'a>, line: usize, character: usize) -> Option<Self>
    where
        Self: Sized + Completer<'a>;

    fn completions(&self) -> Vec<impl Completable<'a, Self>>
    where
        Self: Sized;

    type FilterParams;
    /// Some clients filter on the label, which for qualified names is not what
    /// the user is typing; completers define the filter text themselves.
    fn completion_filter_text(&self, params: Self::FilterParams) -> String;
}

pub trait Completable<'a, T: Completer<'a>>: Sized {
    fn completions(&self, completer: &T) -> Option<CompletionItem>;
}

pub fn get_completions(
    story: &Story,
    params: &CompletionParams,
    path: &Path,
    config: &Settings,
) -> Option<CompletionResponse> {
    let completion_context = Context {
        story,
        path,
        settings: config,
    };

    run_completer::<DivertCompleter>(
        completion_context,
        params.text_document_position.position.line,
        params.text_document_position.position.character,
    )
}

fn run_completer<'a, T: Completer<'a>>(
    context: Context<'a>,
    line: u32,
    character: u32,
) -> Option<CompletionResponse> {
    let completer = T::construct(context, line as usize, character as usize)?;

    let items = completer
        .completions()
        .into_iter()
        .filter_map(|completable| completable.completions(&completer))
        .collect::<Vec<CompletionItem>>();

    Some(CompletionResponse::List(CompletionList {
        is_incomplete: false,
        items,
    }))
}
