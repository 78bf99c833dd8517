use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::*;
use log::*;
use rayon::prelude::*;
use structopt::*;

use tilezip::pipeline::{Outputs, Pipeline, PipelineConfig};
use tilezip::write::Timestamp;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "tilepack",
    about = "Packs folders of tiles into archives, and their central directories into indexes"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Root of the tree that receives tiles.zip archives
    #[structopt(short, long)]
    archive_store: PathBuf,

    /// Root of the tree that receives dir.bin indexes
    #[structopt(short, long)]
    index_store: PathBuf,

    /// Leave tile sets that already have an archive alone.
    #[structopt(long)]
    skip_existing: bool,

    /// Stamp entries with their files' modification times.
    /// (By default they all get the same time so archives are reproducible.)
    #[structopt(long)]
    keep_mtime: bool,

    /// Folders of tiles. Each one's name becomes its identifier in both stores.
    #[structopt(name("TILE DIR"), required = true)]
    tile_dirs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    let mut config = PipelineConfig::new(&args.archive_store, &args.index_store);
    config.skip_existing = args.skip_existing;
    if args.keep_mtime {
        config.pack.timestamp = Timestamp::Modified;
    }
    let pipeline = Pipeline::new(config);

    let tile_sets = identify(&args.tile_dirs)?;

    // Tile sets don't share anything, so do them all at once.
    let failures = tile_sets
        .par_iter()
        .map(|(dir, identifier)| process(&pipeline, dir, identifier))
        .filter_map(|result| result.err())
        .inspect(|e| error!("{:#}", e))
        .count();

    if failures > 0 {
        bail!("{} of {} tile sets failed", failures, args.tile_dirs.len());
    }
    Ok(())
}

/// Pairs each tile folder with its identifier (its name).
///
/// Two folders with the same name would land on the same archive and index,
/// so that's an error.
fn identify(tile_dirs: &[PathBuf]) -> Result<Vec<(&Path, &str)>> {
    let mut seen = BTreeMap::new();
    let mut tile_sets = Vec::with_capacity(tile_dirs.len());
    for dir in tile_dirs {
        let identifier = dir
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Couldn't get an identifier from {}", dir.display()))?;
        if let Some(other) = seen.insert(identifier, dir) {
            bail!(
                "{} and {} would both be stored as {}",
                other.display(),
                dir.display(),
                identifier
            );
        }
        tile_sets.push((dir.as_path(), identifier));
    }
    Ok(tile_sets)
}

fn process(pipeline: &Pipeline, tile_dir: &Path, identifier: &str) -> Result<()> {
    match pipeline.process(tile_dir, identifier)? {
        Outputs {
            archive,
            index,
            entries: Some(entries),
        } => info!(
            "{}: {} tiles -> {}, {}",
            identifier,
            entries,
            archive.display(),
            index.display()
        ),
        Outputs { archive, .. } => info!("{}: kept {}", identifier, archive.display()),
    }
    Ok(())
}
