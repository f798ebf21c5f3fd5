use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tower_lsp::lsp_types::{Location, Position, Url};

use crate::story::{char_to_byte, word_at, Definition, Story};

static BEFORE_CURSOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((?:->|<-)\s*\.?[\w.]*)$").expect("before cursor regex"));

static AFTER_CURSOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w.]*)").expect("after cursor regex"));

static TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:->|<-)\s*(\.?[\w.]+)").expect("divert target regex"));

/// The lookup key of the divert under the cursor.
///
/// Only the first dotted segment is used, so `-> Knot.Stitch` leads to the
/// knot. A leading dot keeps the stitch name: `-> .Stitch` means the stitch of
/// the enclosing knot.
pub fn divert_key_at(line: &str, character: usize) -> Option<String> {
    let split = char_to_byte(line, character);
    let (before, after) = line.split_at(split);

    let before = BEFORE_CURSOR_RE.captures(before)?.get(1)?.as_str();
    let after = AFTER_CURSOR_RE
        .captures(after)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();

    let joined = format!("{}{}", before, after);
    let target = TARGET_RE.captures(&joined)?.get(1)?.as_str();

    match target.strip_prefix('.') {
        Some(local) => {
            let stitch = local.split('.').next().filter(|s| !s.is_empty())?;
            Some(format!(".{}", stitch))
        }
        None => target.split('.').next().map(String::from),
    }
}

fn location(definition: &Definition) -> Option<Location> {
    Some(Location {
        uri: Url::from_file_path(definition.path()).ok()?,
        range: *definition.range(),
    })
}

pub fn goto_definition(
    story: &Story,
    cursor_position: Position,
    path: &Path,
) -> Option<Vec<Location>> {
    let line = story.select_line(path, cursor_position.line as usize)?;
    let character = cursor_position.character as usize;

    let definition = match divert_key_at(&line, character) {
        Some(key) => story.resolve_divert(path, cursor_position.line, &key)?,
        None => {
            let word = word_at(&line, character)?;
            let (var_path, variable) = story.select_variable(word.text)?;
            Definition::Variable(var_path, variable)
        }
    };

    Some(vec![location(&definition)?])
}
