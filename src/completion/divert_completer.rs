//! Divert Completer
//!
//! Offers every knot and every stitch right after a divert arrow.
//!
//! ## Trigger Patterns
//! - `->` or `-> ` at the cursor
//! - `<-` or `<- ` at the cursor (threads)
//!
//! A second arrow (`-> ->`) is a tunnel return, not a divert, and offers
//! nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use tower_lsp::lsp_types::{CompletionItem, CompletionItemKind, Documentation};

use crate::{
    config::Markup,
    hover::{documentation, render},
    story::{char_to_byte, Definition, KnotKind, Story},
};

use super::{Completable, Completer, Context};

static DIVERT_CONTEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(->|<-) ?$").expect("divert context regex"));

static TUNNEL_RETURN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-> ?-> ?$").expect("tunnel return regex"));

/// Whether the text before the cursor asks for a divert target.
pub fn in_divert_context(before_cursor: &str) -> bool {
    DIVERT_CONTEXT_RE.is_match(before_cursor) && !TUNNEL_RETURN_RE.is_match(before_cursor)
}

pub struct DivertCompleter<'a> {
    story: &'a Story,
    markup: Markup,
}

impl<'a> Completer<'a> for DivertCompleter<'a> {
    fn construct(context: Context<'a>, line: usize, character: usize) -> Option<Self>
    where
        Self: Sized + Completer<'a>,
    {
        let line_string = context.story.select_line(context.path, line)?;
        let before_cursor = &line_string[..char_to_byte(&line_string, character)];

        in_divert_context(before_cursor).then_some(DivertCompleter {
            story: context.story,
            markup: context.settings.markup,
        })
    }

    fn completions(&self) -> Vec<impl Completable<'a, Self>>
    where
        Self: Sized,
    {
        let knots = self
            .story
            .select_knots(None)
            .into_iter()
            .map(|(path, knot)| DivertTarget(Definition::Knot(path, knot)));

        let stitches = self
            .story
            .select_stitches(None)
            .into_iter()
            .map(|(path, knot, stitch)| DivertTarget(Definition::Stitch(path, knot, stitch)));

        knots.chain(stitches).collect()
    }

    type FilterParams = Definition<'a>;
    fn completion_filter_text(&self, params: Self::FilterParams) -> String {
        params.qualified_name()
    }
}

/// A knot or stitch offered after an arrow.
struct DivertTarget<'a>(Definition<'a>);

impl<'a> Completable<'a, DivertCompleter<'a>> for DivertTarget<'a> {
    fn completions(&self, completer: &DivertCompleter<'a>) -> Option<CompletionItem> {
        let (label, kind, detail) = match self.0 {
            Definition::Knot(_, knot) => (
                knot.name.clone(),
                match knot.kind {
                    KnotKind::Knot => CompletionItemKind::MODULE,
                    KnotKind::Function => CompletionItemKind::FUNCTION,
                },
                knot.signature(),
            ),
            Definition::Stitch(_, _, stitch) => (
                stitch.qualified_name(),
                CompletionItemKind::FIELD,
                stitch.qualified_signature(),
            ),
            Definition::Variable(..) => return None,
        };

        let documentation = documentation(completer.story, &self.0)
            .map(|doc| Documentation::MarkupContent(render(&detail, Some(&doc), completer.markup)));

        Some(CompletionItem {
            filter_text: Some(completer.completion_filter_text(self.0)),
            label,
            kind: Some(kind),
            detail: Some(detail),
            documentation,
            ..Default::default()
        })
    }
}
