//! Maps tile files on disk to the names they carry inside an archive.

use std::path::{Component, Path};

/// The top-level folder every tile is stored under inside an archive
pub const TILE_ROOT: &str = "tiles";

/// Returns the archive-internal name for `file`, found under `root`.
///
/// The root prefix is stripped and replaced with `top_level`,
/// and components are joined with `/` whatever the host separator is,
/// since ZIP names are always slash-separated.
///
/// ```
/// # use std::path::Path;
/// # use tilezip::path::*;
/// let name = archive_path(Path::new("/tmp/x"), Path::new("/tmp/x/full/90,/0/default.jpg"), TILE_ROOT);
/// assert_eq!(name, "tiles/full/90,/0/default.jpg");
/// ```
///
/// Never fails: names that aren't UTF-8 are converted lossily,
/// and a file outside `root` keeps all of its normal components.
pub fn archive_path(root: &Path, file: &Path, top_level: &str) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);

    let mut parts: Vec<String> = top_level
        .split(['/', '\\'])
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect();

    // Prefixes, roots, `.` and `..` have no meaning inside the archive.
    parts.extend(relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }));

    parts.join("/")
}
