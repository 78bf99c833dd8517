//! tilezip packs folders of image tiles into uncompressed ZIP archives,
//! then copies each archive's central directory out into a small index file:
//!
//! ```no_run
//! # use std::path::Path;
//! # use tilezip::*;
//! let tiles = pack(Path::new("scratch/page-4"), Path::new("cloud/page-4/tiles.zip"))?;
//! extract_index(Path::new("cloud/page-4/tiles.zip"), Path::new("cache/page-4/dir.bin"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Why bother? Tiled image viewers (IIIF and friends) ask for thousands
//! of little files per image. Object storage is happy to hold them,
//! but it's slow and pricey to upload and manage that many.
//! One archive per image is much nicer, and since ZIP keeps every entry separate,
//! with a central directory saying where each one is,
//! a server holding the index can find any tile's bytes
//! and fetch just those with an HTTP range request.
//!
//! That only works if the tiles are stored verbatim, so we never compress.
//! (JPEGs don't shrink much anyways.)
//!
//! Reading an index back, the way a tile server would:
//!
//! ```no_run
//! # use std::fs;
//! # use tilezip::index::*;
//! let index_bytes = fs::read("cache/page-4/dir.bin")?;
//! let index = DirectoryIndex::new(&index_bytes)?;
//! let range = index.lookup_tile("full/90,/0/default.jpg")?.data_range();
//! println!("Range: bytes={}-{}", range.start, range.end - 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod extract;
pub mod format;
pub mod index;
pub mod locate;
pub mod path;
pub mod pipeline;
pub mod result;
pub mod write;

pub use extract::extract_index;
pub use locate::locate;
pub use pipeline::{Pipeline, PipelineConfig};
pub use write::pack;

mod crc_reader;
