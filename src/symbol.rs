//! Symbol providers for ink documents.
//!
//! This module implements LSP symbol capabilities:
//! - `textDocument/documentSymbol` - outline view of current file
//! - `workspace/symbol` - fuzzy search across all files
//!
//! # Document Symbols
//!
//! | Symbol Type | LSP Kind | Example |
//! |-------------|----------|---------|
//! | Knot | `Module` | `=== Start ===` |
//! | Function | `Function` | `=== function greet(name) ===` |
//! | Stitch (nested under its knot) | `Field` | `= intro` |
//! | `VAR` | `Variable` | `VAR gold = 0` |
//! | `CONST` | `Constant` | `CONST MAX = 3` |
//! | `LIST` | `Enum` | `LIST mood = happy, sad` |
//!
//! A knot's range runs from its header to the line before the next knot
//! header; a stitch's range ends before the next stitch or knot.
//!
//! # Workspace Symbols
//!
//! Fuzzy search across the entire story using [`nucleo_matcher`], ranked by
//! match score.

use std::path::Path;

use itertools::Itertools;
use nucleo_matcher::{
    pattern::{self, Normalization},
    Matcher,
};
use serde::Serialize;
use tower_lsp::lsp_types::{
    DocumentSymbol, DocumentSymbolResponse, Location, Position, Range, SymbolInformation,
    SymbolKind, Url, WorkspaceSymbolParams,
};

use crate::story::{InkFile, Knot, KnotKind, Stitch, Story, Variable, VariableKind};

fn compute_match_score(
    matcher: &mut Matcher,
    pattern: &pattern::Pattern,
    symbol: SymbolInformation,
) -> (u32, SymbolInformation) {
    let mut buf = Vec::new();
    (
        pattern
            .score(
                nucleo_matcher::Utf32Str::new(symbol.name.as_str(), &mut buf),
                matcher,
            )
            .unwrap_or_default(),
        symbol,
    )
}

fn knot_kind(knot: &Knot) -> SymbolKind {
    match knot.kind {
        KnotKind::Knot => SymbolKind::MODULE,
        KnotKind::Function => SymbolKind::FUNCTION,
    }
}

fn variable_kind(variable: &Variable) -> SymbolKind {
    match variable.kind {
        VariableKind::Var => SymbolKind::VARIABLE,
        VariableKind::Const => SymbolKind::CONSTANT,
        VariableKind::List => SymbolKind::ENUM,
    }
}

#[allow(deprecated)] // field deprecated has been deprecated in favor of using tags
fn symbol_information(
    name: String,
    kind: SymbolKind,
    path: &Path,
    range: Range,
    container_name: Option<String>,
) -> Option<SymbolInformation> {
    Some(SymbolInformation {
        name,
        kind,
        tags: None,
        deprecated: None,
        location: Location {
            uri: Url::from_file_path(path).ok()?,
            range,
        },
        container_name,
    })
}

/// Search for knots, stitches and variables across the entire story.
///
/// Returns matching symbols sorted by fuzzy match score (best first); an
/// empty query matches nothing.
pub fn workspace_symbol(
    story: &Story,
    params: &WorkspaceSymbolParams,
) -> Option<Vec<SymbolInformation>> {
    let mut matcher = Matcher::new(nucleo_matcher::Config::DEFAULT);
    let pattern = pattern::Pattern::parse(
        &params.query,
        pattern::CaseMatching::Smart,
        Normalization::Smart,
    );

    let knots = story.select_knots(None).into_iter().filter_map(|(path, knot)| {
        symbol_information(
            knot.name.clone(),
            knot_kind(knot),
            path,
            *knot.range,
            Some(story.display_path(path)),
        )
    });
    let stitches = story
        .select_stitches(None)
        .into_iter()
        .filter_map(|(path, knot, stitch)| {
            symbol_information(
                stitch.qualified_name(),
                SymbolKind::FIELD,
                path,
                *stitch.range,
                Some(knot.name.clone()),
            )
        });
    let variables = story
        .select_variables(None)
        .into_iter()
        .filter_map(|(path, variable)| {
            symbol_information(
                variable.name.clone(),
                variable_kind(variable),
                path,
                *variable.range,
                Some(story.display_path(path)),
            )
        });

    Some(
        knots
            .chain(stitches)
            .chain(variables)
            .map(|symbol| compute_match_score(&mut matcher, &pattern, symbol))
            .filter(|(score, _)| *score > 0)
            .sorted_by(|(a, _), (b, _)| Ord::cmp(b, a))
            .map(|(_score, symbol)| symbol)
            .collect_vec(),
    )
}

/// Range from the start of `start` to the end of `end` (both 0-based lines).
fn block_range(file: &InkFile, start: u32, end: u32) -> Range {
    let end_character = file
        .line_text(end as usize)
        .map(|text| text.chars().count() as u32)
        .unwrap_or_default();
    Range {
        start: Position::new(start, 0),
        end: Position::new(end, end_character),
    }
}

/// Last line of a block that ends where the next header begins.
fn block_end(file: &InkFile, next_header: Option<u32>) -> u32 {
    match next_header {
        Some(line) => line.saturating_sub(1),
        None => file.rope.len_lines().saturating_sub(1) as u32,
    }
}

#[allow(deprecated)] // field deprecated has been deprecated in favor of using tags
fn stitch_symbol(file: &InkFile, stitch: &Stitch, end: u32) -> DocumentSymbol {
    DocumentSymbol {
        name: stitch.name.clone(),
        detail: Some(stitch.signature()),
        kind: SymbolKind::FIELD,
        tags: None,
        deprecated: None,
        range: block_range(file, stitch.line, end.max(stitch.line)),
        selection_range: *stitch.range,
        children: None,
    }
}

#[allow(deprecated)] // field deprecated has been deprecated in favor of using tags
fn knot_symbol(file: &InkFile, knot: &Knot, end: u32) -> DocumentSymbol {
    let end = end.max(knot.line);
    let children = knot
        .stitches
        .iter()
        .enumerate()
        .map(|(idx, stitch)| {
            let next = knot.stitches.get(idx + 1).map(|next| next.line);
            let stitch_end = next.map(|line| line.saturating_sub(1)).unwrap_or(end);
            stitch_symbol(file, stitch, stitch_end)
        })
        .collect_vec();

    DocumentSymbol {
        name: knot.name.clone(),
        detail: Some(knot.signature()),
        kind: knot_kind(knot),
        tags: None,
        deprecated: None,
        range: block_range(file, knot.line, end),
        selection_range: *knot.range,
        children: (!children.is_empty()).then_some(children),
    }
}

#[allow(deprecated)] // field deprecated has been deprecated in favor of using tags
fn variable_symbol(variable: &Variable) -> DocumentSymbol {
    DocumentSymbol {
        name: variable.name.clone(),
        detail: Some(variable.kind.keyword().to_string()),
        kind: variable_kind(variable),
        tags: None,
        deprecated: None,
        range: *variable.range,
        selection_range: *variable.range,
        children: None,
    }
}

/// Document outline: knots with their stitches nested, plus variables and
/// orphan stitches, in document order. `None` for an unknown or empty file.
pub fn document_symbol(story: &Story, path: &Path) -> Option<DocumentSymbolResponse> {
    let file = story.get_file(path)?;

    let knots = file.knots.iter().enumerate().map(|(idx, knot)| {
        let next = file.knots.get(idx + 1).map(|next| next.line);
        (knot.line, knot_symbol(file, knot, block_end(file, next)))
    });

    let first_knot = file.knots.first().map(|knot| knot.line);
    #[allow(deprecated)]
    let orphans = file.orphan_stitches.iter().map(|header| {
        let next_orphan = file
            .orphan_stitches
            .iter()
            .map(|other| other.line)
            .find(|line| *line > header.line);
        let end = block_end(file, next_orphan.or(first_knot)).max(header.line);
        (
            header.line,
            DocumentSymbol {
                name: header.name.clone(),
                detail: Some("stitch outside any knot".to_string()),
                kind: SymbolKind::FIELD,
                tags: None,
                deprecated: None,
                range: block_range(file, header.line, end),
                selection_range: *header.range,
                children: None,
            },
        )
    });

    let variables = file
        .variables
        .iter()
        .map(|variable| (variable.line, variable_symbol(variable)));

    let symbols = knots
        .chain(orphans)
        .chain(variables)
        .sorted_by_key(|(line, _)| *line)
        .map(|(_, symbol)| symbol)
        .collect_vec();

    if symbols.is_empty() {
        return None;
    }

    Some(DocumentSymbolResponse::Nested(symbols))
}

/// One file of a serializable story outline.
#[derive(Debug, Serialize)]
pub struct FileOutline<'a> {
    pub path: String,
    pub includes: Vec<&'a str>,
    pub knots: &'a [Knot],
    pub variables: &'a [Variable],
}

/// The whole story as plain data, ordered by path.
pub fn story_outline(story: &Story) -> Vec<FileOutline<'_>> {
    story
        .files()
        .into_iter()
        .map(|file| FileOutline {
            path: story.display_path(&file.path),
            includes: file.includes.iter().map(|include| include.path.as_str()).collect(),
            knots: &file.knots,
            variables: &file.variables,
        })
        .collect()
}
