use std::path::Path;

use tower_lsp::lsp_types::{Location, Position, Url};

use crate::{hover::definition_at, story::Story};

/// Every divert that lands on the knot or stitch under the cursor.
///
/// The cursor may be on the definition header itself or on any divert that
/// reaches it. Each divert is resolved from its own line, so `-> intro` in one
/// knot and `-> intro` in another refer to different stitches.
pub fn references(
    story: &Story,
    cursor_position: Position,
    path: &Path,
    include_declaration: bool,
) -> Option<Vec<Location>> {
    let definition = match story.select_divert_at_position(path, cursor_position) {
        Some(divert) => story.resolve_divert(path, divert.line, &divert.target)?,
        None => definition_at(story, path, cursor_position)?,
    };

    let declaration = include_declaration
        .then(|| {
            Url::from_file_path(definition.path())
                .ok()
                .map(|uri| Location {
                    uri,
                    range: *definition.range(),
                })
        })
        .flatten();

    let uses = story
        .select_diverts(None)
        .into_iter()
        .filter(|(divert_path, divert)| {
            story
                .resolve_divert(divert_path, divert.line, &divert.target)
                .is_some_and(|target| target.same_site(&definition))
        })
        .filter_map(|(divert_path, divert)| {
            Some(Location {
                uri: Url::from_file_path(divert_path).ok()?,
                range: *divert.range,
            })
        });

    Some(declaration.into_iter().chain(uses).collect())
}
