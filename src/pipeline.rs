//! Runs tile sets through packing, then index extraction.
//!
//! Each tile set gets an identifier (say, `pub/1897-03-02/page-4`),
//! and ends up as two files in parallel trees:
//!
//! ```text
//! <archive store>/pub/1897-03-02/page-4/tiles.zip
//! <index store>/pub/1897-03-02/page-4/dir.bin
//! ```
//!
//! so the small indexes and the big archives can live on different storage.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::*;

use crate::extract;
use crate::result::*;
use crate::write::{self, PackOptions};

/// Something that produces a tree of tiles,
/// like an external tile-cutting tool.
pub trait TileSource {
    /// Fills the (empty) directory `into` with tiles for the given tile set.
    fn produce(&self, identifier: &str, into: &Path) -> io::Result<()>;
}

impl<F> TileSource for F
where
    F: Fn(&str, &Path) -> io::Result<()>,
{
    fn produce(&self, identifier: &str, into: &Path) -> io::Result<()> {
        self(identifier, into)
    }
}

/// Where pipeline output goes, and how it's made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Root of the tree that receives archives
    pub archive_store: PathBuf,
    /// Root of the tree that receives directory indexes
    pub index_store: PathBuf,
    pub archive_file_name: String,
    pub index_file_name: String,
    /// Leave tile sets that already have an archive alone.
    pub skip_existing: bool,
    pub pack: PackOptions,
}

impl PipelineConfig {
    pub fn new<A: Into<PathBuf>, I: Into<PathBuf>>(archive_store: A, index_store: I) -> Self {
        Self {
            archive_store: archive_store.into(),
            index_store: index_store.into(),
            archive_file_name: String::from("tiles.zip"),
            index_file_name: String::from("dir.bin"),
            skip_existing: false,
            pack: PackOptions::default(),
        }
    }
}

/// What happened to a tile set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    pub archive: PathBuf,
    pub index: PathBuf,
    /// Tiles packed, or `None` if the tile set was skipped
    pub entries: Option<usize>,
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Where the given tile set's archive and index go
    pub fn destinations(&self, identifier: &str) -> PipelineResult<(PathBuf, PathBuf)> {
        let relative = checked_identifier(identifier)?;
        Ok((
            self.config
                .archive_store
                .join(relative)
                .join(&self.config.archive_file_name),
            self.config
                .index_store
                .join(relative)
                .join(&self.config.index_file_name),
        ))
    }

    /// Packs the tiles under `tiles_root`, then extracts the archive's index.
    ///
    /// The index is only extracted from a freshly packed archive.
    /// Any index already at the destination is removed if extraction fails,
    /// or if packing fails with no archive left behind,
    /// since an index is only good alongside the archive it came from.
    pub fn process(&self, tiles_root: &Path, identifier: &str) -> PipelineResult<Outputs> {
        let (archive, index) = self.destinations(identifier)?;

        if self.config.skip_existing && archive.exists() {
            info!("{} already exists; skipping {}", archive.display(), identifier);
            return Ok(Outputs {
                archive,
                index,
                entries: None,
            });
        }

        let entries = match write::pack_with(tiles_root, &archive, &self.config.pack) {
            Ok(entries) => entries,
            Err(source) => {
                // A failed pack leaves any previous archive in place,
                // and its index still matches it.
                if !archive.exists() {
                    remove_stale_index(&index);
                }
                return Err(PipelineError::Pack {
                    identifier: identifier.to_owned(),
                    source,
                });
            }
        };

        extracted(identifier, &index, extract::extract_index(&archive, &index))?;

        Ok(Outputs {
            archive,
            index,
            entries: Some(entries),
        })
    }

    /// Has `source` produce tiles into a scratch directory, then processes them.
    ///
    /// The scratch directory is removed afterwards, tiles and all;
    /// the archive is the only place they're kept.
    pub fn produce_and_process<S: TileSource + ?Sized>(
        &self,
        source: &S,
        identifier: &str,
    ) -> PipelineResult<Outputs> {
        checked_identifier(identifier)?;
        let tile_source_error = |source| PipelineError::TileSource {
            identifier: identifier.to_owned(),
            source,
        };

        let scratch = tempfile::Builder::new()
            .prefix("tilezip-tiles-")
            .tempdir()
            .map_err(tile_source_error)?;
        debug!(
            "Producing tiles for {} in {}",
            identifier,
            scratch.path().display()
        );
        source
            .produce(identifier, scratch.path())
            .map_err(tile_source_error)?;

        let outputs = self.process(scratch.path(), identifier)?;
        if let Err(e) = scratch.close() {
            warn!("Couldn't clean up tiles for {}: {}", identifier, e);
        }
        Ok(outputs)
    }
}

/// Removes the index at `index` (if there is one) when extraction failed.
fn extracted(identifier: &str, index: &Path, result: ExtractResult<()>) -> PipelineResult<()> {
    result.map_err(|source| {
        remove_stale_index(index);
        PipelineError::Extract {
            identifier: identifier.to_owned(),
            source,
        }
    })
}

fn remove_stale_index(index: &Path) {
    match fs::remove_file(index) {
        Ok(()) => warn!("Removed stale index {}", index.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Couldn't remove stale index {}: {}", index.display(), e),
    }
}

/// Identifiers become paths under both stores,
/// so they have to stay inside them.
fn checked_identifier(identifier: &str) -> PipelineResult<&Path> {
    let path = Path::new(identifier.trim_start_matches('/'));
    let valid = path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(path)
    } else {
        Err(PipelineError::InvalidIdentifier(identifier.to_owned()))
    }
}
