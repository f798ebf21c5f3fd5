//! Line tokenizer for ink source.
//!
//! The ink grammar belongs to the compiler; the indexer only needs to spot a
//! handful of line shapes. Every pattern the server relies on lives here so
//! the edge cases (orphan stitches, headers with parameters, double arrows)
//! can be tested without a project on disk.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::VariableKind;

static KNOT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*={2,}\s*(?:(?<function>function)\s+)?(?<name>\w+)\s*(?:\((?<params>[^)]*)\))?")
        .expect("knot header regex")
});

static STITCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*=\s*(?<name>\w+)\s*(?:\((?<params>[^)]*)\))?").expect("stitch header regex")
});

static INCLUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*INCLUDE\s+(?<path>.+)$").expect("include regex"));

static VARIABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?<kind>VAR|CONST|LIST)\s+(?<name>\w+)\s*=").expect("variable regex")
});

static DIVERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:->|<-)\s*(?<target>\.?\w+(?:\.\w+)*)").expect("divert regex")
});

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w.]+").expect("word regex"));

/// The shape of a single line of ink, as far as the indexer cares.
#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    Knot {
        function: bool,
        name: Token<'a>,
        parameters: Vec<String>,
    },
    Stitch {
        name: Token<'a>,
        parameters: Vec<String>,
    },
    Include {
        path: &'a str,
    },
    Variable {
        kind: VariableKind,
        name: Token<'a>,
    },
    Other,
}

/// A slice of a line together with its byte span.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Token<'a> {
    pub text: &'a str,
    pub span: (usize, usize),
}

impl<'a> Token<'a> {
    fn from_match(m: regex::Match<'a>) -> Token<'a> {
        Token {
            text: m.as_str(),
            span: (m.start(), m.end()),
        }
    }

    pub fn bytes(&self) -> Range<usize> {
        self.span.0..self.span.1
    }
}

impl<'a> Line<'a> {
    /// Classify one line. Knot headers are tried before stitch headers since
    /// every knot header also looks like a stitch header.
    pub fn classify(line: &'a str) -> Line<'a> {
        if let Some(caps) = KNOT_RE.captures(line) {
            if let Some(name) = caps.name("name") {
                return Line::Knot {
                    function: caps.name("function").is_some(),
                    name: Token::from_match(name),
                    parameters: parse_parameters(caps.name("params").map(|m| m.as_str())),
                };
            }
        }

        if let Some(caps) = STITCH_RE.captures(line) {
            if let Some(name) = caps.name("name") {
                return Line::Stitch {
                    name: Token::from_match(name),
                    parameters: parse_parameters(caps.name("params").map(|m| m.as_str())),
                };
            }
        }

        if let Some(path) = include_path(line) {
            return Line::Include { path };
        }

        if let Some(caps) = VARIABLE_RE.captures(line) {
            let kind = match caps.name("kind").map(|m| m.as_str()) {
                Some("CONST") => VariableKind::Const,
                Some("LIST") => VariableKind::List,
                _ => VariableKind::Var,
            };
            if let Some(name) = caps.name("name") {
                return Line::Variable {
                    kind,
                    name: Token::from_match(name),
                };
            }
        }

        Line::Other
    }
}

fn parse_parameters(params: Option<&str>) -> Vec<String> {
    params
        .map(|params| {
            params
                .split(',')
                .map(str::trim)
                .filter(|param| !param.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// The trimmed path of an `INCLUDE` line, if this is one.
pub fn include_path(line: &str) -> Option<&str> {
    let path = INCLUDE_RE.captures(line)?.name("path")?.as_str().trim();
    (!path.is_empty()).then_some(path)
}

/// All divert targets on a line, skipping `//` line comments.
pub fn divert_targets(line: &str) -> Vec<Token<'_>> {
    let code = match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    };

    DIVERT_RE
        .captures_iter(code)
        .filter_map(|caps| caps.name("target"))
        .map(Token::from_match)
        .collect()
}

/// The `[\w.]+` word that contains the char column `character`, if any.
pub fn word_at(line: &str, character: usize) -> Option<Token<'_>> {
    let byte = char_to_byte(line, character);
    WORD_RE
        .find_iter(line)
        .find(|m| m.start() <= byte && byte <= m.end())
        .map(Token::from_match)
}

/// Byte offset of a char column, clamped to the line length.
pub fn char_to_byte(line: &str, character: usize) -> usize {
    line.char_indices()
        .nth(character)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len())
}

/// Whether a line can be part of a documentation comment block.
pub fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("/**") || trimmed.starts_with('*') || trimmed.starts_with("*/")
}

/// Strip comment delimiters from one documentation comment line.
pub fn strip_comment_line(line: &str) -> &str {
    let mut text = line.trim();
    if let Some(rest) = text.strip_prefix("/**") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("*/") {
        text = rest;
    }
    text.trim_start_matches('*').trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_knot_header() {
        match Line::classify("=== Start ===") {
            Line::Knot {
                function,
                name,
                parameters,
            } => {
                assert!(!function);
                assert_eq!(name.text, "Start");
                assert_eq!(name.span, (4, 9));
                assert!(parameters.is_empty());
            }
            other => panic!("Expected knot header, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_two_equals_is_a_knot() {
        assert!(matches!(Line::classify("==Start"), Line::Knot { .. }));
    }

    #[test]
    fn test_classify_function_with_parameters() {
        match Line::classify("== function add(a, b) ==") {
            Line::Knot {
                function,
                name,
                parameters,
            } => {
                assert!(function);
                assert_eq!(name.text, "add");
                assert_eq!(parameters, vec!["a", "b"]);
            }
            other => panic!("Expected function header, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_stitch_header() {
        match Line::classify("= intro(-> back)") {
            Line::Stitch { name, parameters } => {
                assert_eq!(name.text, "intro");
                assert_eq!(parameters, vec!["-> back"]);
            }
            other => panic!("Expected stitch header, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_indented_stitch() {
        assert!(matches!(
            Line::classify("   =   lobby"),
            Line::Stitch { name, .. } if name.text == "lobby"
        ));
    }

    #[test]
    fn test_classify_include_trims_path() {
        assert_eq!(
            Line::classify("  INCLUDE   chapters/one.ink   "),
            Line::Include {
                path: "chapters/one.ink"
            }
        );
    }

    #[test]
    fn test_classify_variables() {
        assert!(matches!(
            Line::classify("VAR gold = 5"),
            Line::Variable { kind: VariableKind::Var, name } if name.text == "gold"
        ));
        assert!(matches!(
            Line::classify("CONST MAX=10"),
            Line::Variable { kind: VariableKind::Const, name } if name.text == "MAX"
        ));
        assert!(matches!(
            Line::classify("LIST mood = happy, sad"),
            Line::Variable { kind: VariableKind::List, name } if name.text == "mood"
        ));
    }

    #[test]
    fn test_classify_prose_is_other() {
        assert_eq!(Line::classify("Hello there -> Start"), Line::Other);
        assert_eq!(Line::classify("* [Choice] -> End"), Line::Other);
        assert_eq!(Line::classify(""), Line::Other);
    }

    #[test]
    fn test_divert_targets_on_line() {
        let targets = divert_targets("* [Go] -> Knot.stitch <- thread -> .local");
        let names: Vec<_> = targets.iter().map(|t| t.text).collect();
        assert_eq!(names, vec!["Knot.stitch", "thread", ".local"]);
    }

    #[test]
    fn test_divert_targets_double_arrow_yields_nothing_extra() {
        let targets = divert_targets("-> ->");
        assert!(targets.is_empty());
    }

    #[test]
    fn test_divert_targets_ignore_line_comments() {
        let targets = divert_targets("Hello // -> Hidden");
        assert!(targets.is_empty());
    }

    #[test]
    fn test_word_at_cursor_includes_dots() {
        let line = "-> Knot.stitch here";
        let word = word_at(line, 6).unwrap();
        assert_eq!(word.text, "Knot.stitch");
        assert!(word_at(line, 2).is_none());
    }

    #[test]
    fn test_strip_comment_line() {
        assert_eq!(strip_comment_line("/** Greets the player */"), "Greets the player");
        assert_eq!(strip_comment_line(" * second line"), "second line");
        assert_eq!(strip_comment_line(" */"), "");
        assert!(is_comment_line("  * bullet"));
        assert!(!is_comment_line("// plain comment"));
    }
}
