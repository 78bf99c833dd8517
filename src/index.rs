//! Tools for reading a directory index.
//!
//! A directory index is an archive's central directory, copied out verbatim.
//! This is what a byte-range tile server does with one:
//! find a tile's entry by name, then work out which bytes of the archive to ask for.
//!
//! ```no_run
//! # use std::fs;
//! # use tilezip::index::*;
//! let bytes = fs::read("dir.bin")?;
//! let index = DirectoryIndex::new(&bytes)?;
//! let tile = index.lookup_tile("full/90,/0/default.jpg")?;
//! // Ask the archive's storage for exactly these bytes:
//! let range = tile.data_range();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;
use std::ops::Range;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use codepage_437::*;
use log::*;

use crate::crc_reader::Crc32Reader;
use crate::format::{self, CentralDirectoryEntry, LocalFileHeader};
use crate::path::TILE_ROOT;
use crate::result::*;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed, the only method we serve
    Stored,
    /// The file is compressed with some other format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

impl CompressionMethod {
    fn from_u16(u: u16) -> Self {
        match u {
            format::METHOD_STORED => CompressionMethod::Stored,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

/// Metadata for a tile in the archive, from its central directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry<'a> {
    /// Uncompressed size of the file in bytes
    pub size: u32,

    /// Compressed size of the file in bytes (the same as `size` when stored)
    pub compressed_size: u32,

    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// True if the file is encrypted (which we can't serve)
    pub encrypted: bool,

    /// The file's path inside the archive
    pub path: Cow<'a, Utf8Path>,

    /// When the file was last modified, if the archive recorded a valid time
    pub last_modified: Option<NaiveDateTime>,

    /// The offset to the local file header in the archive
    pub header_offset: u32,

    /// Length of the raw (undecoded) name, which the local header repeats
    name_length: u16,
}

/// Decodes an entry name: UTF-8 if the flags say so, CP437 otherwise.
fn decode_path(raw: &[u8], flags: u16) -> IndexResult<Cow<'_, Utf8Path>> {
    if format::is_utf8(flags) {
        let utf8 = std::str::from_utf8(raw)?;
        Ok(Cow::Borrowed(Utf8Path::new(utf8)))
    } else {
        let str_cow: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
        // Annoying: doesn't seem to be any Cow<str> -> Cow<Utf8Path>
        Ok(match str_cow {
            Cow::Borrowed(s) => Cow::Borrowed(Utf8Path::new(s)),
            Cow::Owned(s) => Cow::Owned(s.into()),
        })
    }
}

impl<'a> IndexEntry<'a> {
    fn from_cde(cde: &CentralDirectoryEntry<'a>) -> IndexResult<Self> {
        let path = decode_path(cde.path, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(IndexError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                path, cde.disk_number,
            )));
        }

        Ok(Self {
            size: cde.uncompressed_size,
            compressed_size: cde.compressed_size,
            compression_method: CompressionMethod::from_u16(cde.compression_method),
            crc32: cde.crc32,
            encrypted: format::is_encrypted(cde.flags),
            path,
            last_modified: format::parse_msdos(cde.last_modified_time, cde.last_modified_date),
            header_offset: cde.header_offset,
            name_length: cde.path.len() as u16,
        })
    }

    /// The byte range of the tile's stored data in the archive.
    ///
    /// The local header repeats the name, so its length is known,
    /// and the archives we write never give local headers extra fields.
    /// Archives from other tools might; use [`read_tile()`] for those,
    /// which parses the local header to be sure.
    ///
    /// [`read_tile()`]: fn.read_tile.html
    pub fn data_range(&self) -> Range<u64> {
        let start = self.header_offset as u64
            + LocalFileHeader::FIXED_SIZE as u64
            + self.name_length as u64;
        start..start + self.compressed_size as u64
    }

    /// Checks the local header against this entry, like a careful reader should.
    fn matches_local(&self, local: &LocalFileHeader) -> IndexResult<bool> {
        Ok(decode_path(local.path, local.flags)? == self.path
            && local.crc32 == self.crc32
            && local.compressed_size == self.compressed_size
            && local.uncompressed_size == self.size
            && CompressionMethod::from_u16(local.compression_method) == self.compression_method)
    }
}

/// A parsed directory index
#[derive(Debug)]
pub struct DirectoryIndex<'a> {
    /// Entries in central directory (and so archive) order
    entries: Vec<IndexEntry<'a>>,
    by_path: BTreeMap<Utf8PathBuf, usize>,
}

impl<'a> DirectoryIndex<'a> {
    /// Parses the central directory headers in `bytes`,
    /// which should be all of them and nothing else.
    pub fn new(mut bytes: &'a [u8]) -> IndexResult<Self> {
        let mut entries = Vec::new();
        let mut by_path = BTreeMap::new();

        while !bytes.is_empty() {
            let cde = CentralDirectoryEntry::parse_and_consume(&mut bytes)?;
            trace!("{:?}", cde);
            let entry = IndexEntry::from_cde(&cde)?;
            debug!("{:?}", entry);

            if by_path
                .insert(entry.path.to_path_buf(), entries.len())
                .is_some()
            {
                warn!("Duplicate entry for {}; using the last one", entry.path);
            }
            entries.push(entry);
        }

        Ok(Self { entries, by_path })
    }

    /// Returns the entries in the order they're stored in the archive.
    pub fn entries(&self) -> &[IndexEntry<'a>] {
        &self.entries
    }

    /// Looks up an entry by its full path inside the archive.
    pub fn lookup<P: AsRef<Utf8Path>>(&self, path: P) -> IndexResult<&IndexEntry<'a>> {
        let path = path.as_ref();
        self.by_path
            .get(path)
            .map(|i| &self.entries[*i])
            .ok_or_else(|| IndexError::NoSuchTile(path.to_owned()))
    }

    /// Looks up a tile by its path relative to the tile root,
    /// e.g. `full/90,/0/default.jpg` for `tiles/full/90,/0/default.jpg`.
    pub fn lookup_tile<P: AsRef<Utf8Path>>(&self, tile: P) -> IndexResult<&IndexEntry<'a>> {
        let tile = tile.as_ref();
        let full = format!("{}/{}", TILE_ROOT, tile.as_str().trim_start_matches('/'));
        self.lookup(Utf8Path::new(&full))
    }
}

/// Reads the given tile out of `archive`, the archive's full contents.
///
/// The returned reader checks the tile's CRC-32 when it reaches the end.
pub fn read_tile<'a>(
    archive: &'a [u8],
    entry: &IndexEntry,
) -> IndexResult<Box<dyn io::Read + Send + 'a>> {
    if entry.encrypted {
        return Err(IndexError::UnsupportedArchive(format!(
            "Can't read encrypted file {}",
            entry.path
        )));
    }
    if entry.compression_method != CompressionMethod::Stored {
        return Err(IndexError::UnsupportedArchive(format!(
            "{} isn't stored ({:?})",
            entry.path, entry.compression_method
        )));
    }

    let mut file_slice = archive
        .get(entry.header_offset as usize..)
        .ok_or(IndexError::InvalidIndex(
            "Local header offset is past the end of the archive",
        ))?;
    let local_header = LocalFileHeader::parse_and_consume(&mut file_slice)?;
    trace!("{:?}", local_header);
    if cfg!(feature = "check-local-metadata") && !entry.matches_local(&local_header)? {
        return Err(IndexError::InvalidIndex(
            "Directory index entry doesn't match local file header",
        ));
    }

    let data = file_slice
        .get(..entry.compressed_size as usize)
        .ok_or(IndexError::InvalidIndex(
            "Tile runs past the end of the archive",
        ))?;
    debug!("Reading {} ({} bytes)", entry.path, data.len());
    Ok(Box::new(Crc32Reader::new(data, entry.crc32)))
}
