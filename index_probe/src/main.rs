use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::*;
use log::*;
use memmap2::Mmap;
use structopt::*;

use tilezip::index::{read_tile, DirectoryIndex};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "index_probe",
    about = "Examines a directory index, and finds tiles with it"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Print the byte range of this tile (relative to the tile root)
    /// instead of listing the index.
    #[structopt(short, long)]
    tile: Option<String>,

    /// With --tile, read the tile out of this archive and write it to stdout.
    #[structopt(short, long, requires("tile"))]
    archive: Option<PathBuf>,

    #[structopt(name("INDEX file"))]
    index_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    let index_bytes = fs::read(&args.index_path)
        .with_context(|| format!("Couldn't read {}", args.index_path.display()))?;
    let index = DirectoryIndex::new(&index_bytes).context("Couldn't parse index")?;

    let tile = match &args.tile {
        Some(t) => index.lookup_tile(t)?,
        None => {
            for entry in index.entries() {
                let range = entry.data_range();
                println!(
                    "{}\t{} bytes\tcrc {:08x}\tbytes={}-{}",
                    entry.path,
                    entry.size,
                    entry.crc32,
                    range.start,
                    range.end.saturating_sub(1)
                );
            }
            return Ok(());
        }
    };

    match &args.archive {
        None => {
            let range = tile.data_range();
            println!("bytes={}-{}", range.start, range.end.saturating_sub(1));
        }
        Some(archive_path) => {
            info!("Memory mapping {:#?}", archive_path);
            let archive_file = File::open(archive_path).context("Couldn't open archive")?;
            let mapping =
                unsafe { Mmap::map(&archive_file).context("Couldn't mmap archive")? };
            let mut reader = read_tile(&mapping, tile)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut reader, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}
