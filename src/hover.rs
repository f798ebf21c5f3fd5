//! Hover provider for ink documents.
//!
//! Hovering a knot, stitch or variable, either at its definition or at a
//! divert that reaches it, shows its header and the documentation comment
//! written immediately above the definition:
//!
//! ```ink
//! /**
//!  * Greets the player
//!  */
//! === function greet(name) ===
//! ```
//!
//! Hover can be disabled via [`Settings::hover`].

use std::path::Path;

use tower_lsp::lsp_types::{
    Hover, HoverContents, HoverParams, MarkupContent, MarkupKind, Position,
};

use crate::{
    config::{Markup, Settings},
    story::{is_comment_line, strip_comment_line, word_at, Definition, InkFile, Story},
};

/// The documentation comment block above `line`.
///
/// Walks upwards from the line before the definition: blank lines are
/// skipped, lines starting with `/**`, `*` or `*/` are collected, and the
/// first other line ends the block. Returns `None` when nothing remains
/// after stripping the delimiters.
pub fn leading_comment(file: &InkFile, line: u32) -> Option<String> {
    let mut block = vec![];

    for idx in (0..line as usize).rev() {
        let Some(text) = file.line_text(idx) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        if !is_comment_line(&text) {
            break;
        }
        block.push(strip_comment_line(&text).to_string());
    }

    block.reverse();
    let joined = block.join("\n");
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Documentation for a definition, if it carries any.
pub fn documentation(story: &Story, definition: &Definition) -> Option<String> {
    leading_comment(story.get_file(definition.path())?, definition.line())
}

/// How a definition is written, e.g. `=== function greet(name) ===`.
pub fn signature(story: &Story, definition: &Definition) -> String {
    match definition {
        Definition::Knot(_, knot) => knot.signature(),
        Definition::Stitch(_, _, stitch) => stitch.qualified_signature(),
        Definition::Variable(path, variable) => story
            .select_line(path, variable.line as usize)
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| format!("{} {}", variable.kind.keyword(), variable.name)),
    }
}

/// Render a signature and optional documentation in the configured markup.
pub fn render(signature: &str, documentation: Option<&str>, markup: Markup) -> MarkupContent {
    match markup {
        Markup::Markdown => MarkupContent {
            kind: MarkupKind::Markdown,
            value: match documentation {
                Some(doc) => format!("```ink\n{}\n```\n\n{}", signature, doc),
                None => format!("```ink\n{}\n```", signature),
            },
        },
        Markup::Plain => MarkupContent {
            kind: MarkupKind::PlainText,
            value: match documentation {
                Some(doc) => format!("{}\n\n{}", signature, doc),
                None => signature.to_string(),
            },
        },
    }
}

/// What the word under the cursor refers to.
///
/// A definition header names itself; any other (possibly dotted) word
/// resolves with the divert scope rules, then as a variable.
pub fn definition_at<'a>(
    story: &'a Story,
    path: &Path,
    position: Position,
) -> Option<Definition<'a>> {
    if let Some(header) = story.select_header_at_position(path, position) {
        return Some(header);
    }

    let line = story.select_line(path, position.line as usize)?;
    let word = word_at(&line, position.character as usize)?;
    let word = word.text.trim_end_matches('.');
    if word.is_empty() {
        return None;
    }

    story
        .resolve_divert(path, position.line, word)
        .or_else(|| {
            story
                .select_variable(word)
                .map(|(path, variable)| Definition::Variable(path, variable))
        })
}

pub fn hover(
    story: &Story,
    params: &HoverParams,
    path: &Path,
    settings: &Settings,
) -> Option<Hover> {
    if !settings.hover {
        return None;
    }

    let position = params.text_document_position_params.position;
    let definition = definition_at(story, path, position)?;
    let documentation = documentation(story, &definition);

    Some(Hover {
        contents: HoverContents::Markup(render(
            &signature(story, &definition),
            documentation.as_deref(),
            settings.markup,
        )),
        range: None,
    })
}
