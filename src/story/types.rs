//! Core types for story data structures.
//!
//! This module contains the entities the indexer extracts from ink files:
//! - `InkRange`: A wrapper around LSP Range with line-local constructors
//! - `Header`: A raw knot or stitch header as seen by the line tokenizer
//! - `Knot`, `Stitch`, `Variable`, `Divert`, `IncludeDirective`

use std::ops::{Deref, Range};

use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::Position;

/// A wrapper around `tower_lsp::lsp_types::Range` with additional utilities.
///
/// Columns are counted in chars, matching how the rest of the server slices
/// line text.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct InkRange(pub tower_lsp::lsp_types::Range);

impl InkRange {
    /// Creates a range on a single line from a byte range into that line's text.
    pub fn on_line(line: u32, line_text: &str, bytes: Range<usize>) -> InkRange {
        let start = char_column(line_text, bytes.start);
        let end = char_column(line_text, bytes.end);

        tower_lsp::lsp_types::Range {
            start: Position {
                line,
                character: start,
            },
            end: Position {
                line,
                character: end,
            },
        }
        .into()
    }

    /// A range covering the whole of `line_text`.
    pub fn whole_line(line: u32, line_text: &str) -> InkRange {
        let trimmed = line_text.trim_end_matches(&['\r', '\n'][..]);
        InkRange::on_line(line, trimmed, 0..trimmed.len())
    }
}

fn char_column(line_text: &str, byte: usize) -> u32 {
    let byte = byte.min(line_text.len());
    line_text
        .char_indices()
        .take_while(|(idx, _)| *idx < byte)
        .count() as u32
}

impl Deref for InkRange {
    type Target = tower_lsp::lsp_types::Range;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<tower_lsp::lsp_types::Range> for InkRange {
    fn from(range: tower_lsp::lsp_types::Range) -> Self {
        InkRange(range)
    }
}

/// Whether a top-level header introduces a knot or a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KnotKind {
    Knot,
    Function,
}

/// A knot or stitch header line as recognised by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub parameters: Vec<String>,
    /// 0-based line of the header.
    pub line: u32,
    /// Range of the name on the header line.
    pub range: InkRange,
}

/// A named top-level narrative unit (`=== name ===`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Knot {
    pub name: String,
    pub kind: KnotKind,
    pub parameters: Vec<String>,
    pub line: u32,
    pub range: InkRange,
    /// Stitches in file order.
    pub stitches: Vec<Stitch>,
}

impl Knot {
    pub fn stitch(&self, name: &str) -> Option<&Stitch> {
        self.stitches.iter().find(|stitch| stitch.name == name)
    }

    /// The header as it would be written, e.g. `=== function greet(name) ===`.
    pub fn signature(&self) -> String {
        let prefix = match self.kind {
            KnotKind::Knot => "",
            KnotKind::Function => "function ",
        };
        format!(
            "=== {}{}{} ===",
            prefix,
            self.name,
            format_parameters(&self.parameters)
        )
    }
}

/// A sub-unit of a knot (`= name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stitch {
    pub name: String,
    /// Name of the owning knot.
    pub knot: String,
    pub parameters: Vec<String>,
    pub line: u32,
    pub range: InkRange,
}

impl Stitch {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.knot, self.name)
    }

    pub fn signature(&self) -> String {
        format!("= {}{}", self.name, format_parameters(&self.parameters))
    }

    /// Like [`Stitch::signature`] but with the owning knot, e.g. `= Start.intro`.
    pub fn qualified_signature(&self) -> String {
        format!(
            "= {}{}",
            self.qualified_name(),
            format_parameters(&self.parameters)
        )
    }
}

fn format_parameters(parameters: &[String]) -> String {
    if parameters.is_empty() {
        String::new()
    } else {
        format!("({})", parameters.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VariableKind {
    Var,
    Const,
    List,
}

impl VariableKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            VariableKind::Var => "VAR",
            VariableKind::Const => "CONST",
            VariableKind::List => "LIST",
        }
    }
}

/// A global declaration: `VAR`, `CONST` or `LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub line: u32,
    pub range: InkRange,
}

/// A divert occurrence (`-> target` or `<- target`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divert {
    /// The raw target: `Knot`, `Knot.Stitch` or `.Stitch`.
    pub target: String,
    pub line: u32,
    /// Range of the target text.
    pub range: InkRange,
}

/// An `INCLUDE path` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncludeDirective {
    /// The path exactly as written, trimmed.
    pub path: String,
    pub line: u32,
    /// Range of the whole directive line.
    pub range: InkRange,
}

/// Trait for types that have a range (position span in the document).
pub trait Rangeable {
    fn range(&self) -> &InkRange;

    fn includes_position(&self, position: Position) -> bool {
        let range = self.range();
        (range.start.line < position.line
            || (range.start.line == position.line && range.start.character <= position.character))
            && (range.end.line > position.line
                || (range.end.line == position.line && range.end.character >= position.character))
    }
}

impl Rangeable for Knot {
    fn range(&self) -> &InkRange {
        &self.range
    }
}

impl Rangeable for Stitch {
    fn range(&self) -> &InkRange {
        &self.range
    }
}

impl Rangeable for Variable {
    fn range(&self) -> &InkRange {
        &self.range
    }
}

impl Rangeable for Divert {
    fn range(&self) -> &InkRange {
        &self.range
    }
}

impl Rangeable for IncludeDirective {
    fn range(&self) -> &InkRange {
        &self.range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_line_counts_chars_not_bytes() {
        let text = "é -> Start";
        let start = text.find("Start").unwrap();
        let range = InkRange::on_line(3, text, start..text.len());
        assert_eq!(range.start.line, 3);
        assert_eq!(range.start.character, 5);
        assert_eq!(range.end.character, 10);
    }

    #[test]
    fn test_whole_line_ignores_line_ending() {
        let range = InkRange::whole_line(0, "INCLUDE a.ink\r\n");
        assert_eq!(range.start.character, 0);
        assert_eq!(range.end.character, 13);
    }

    #[test]
    fn test_knot_signature_with_function_and_parameters() {
        let knot = Knot {
            name: "greet".to_string(),
            kind: KnotKind::Function,
            parameters: vec!["who".to_string(), "ref mood".to_string()],
            line: 0,
            range: InkRange::default(),
            stitches: vec![],
        };
        assert_eq!(knot.signature(), "=== function greet(who, ref mood) ===");
    }

    #[test]
    fn test_includes_position_is_inclusive() {
        let divert = Divert {
            target: "Start".to_string(),
            line: 2,
            range: InkRange::on_line(2, "-> Start", 3..8),
        };
        assert!(divert.includes_position(Position::new(2, 3)));
        assert!(divert.includes_position(Position::new(2, 8)));
        assert!(!divert.includes_position(Position::new(2, 9)));
        assert!(!divert.includes_position(Position::new(1, 4)));
    }
}
