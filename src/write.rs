//! Tools for packing a folder of tiles into a ZIP archive.
//!
//! Entries are always _stored_ (uncompressed),
//! so a tile's bytes sit verbatim inside the archive
//! and can be handed straight to an HTTP client from a byte range.
//! Zip64 is never written; anything that would need it is an error.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use log::*;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::format::{self, CentralDirectoryEntry, EndOfCentralDirectory, LocalFileHeader};
use crate::path::{archive_path, TILE_ROOT};
use crate::result::*;

/// Entry counts are 16 bits, and 0xFFFF means "look in the Zip64 record".
pub const MAX_ENTRIES: usize = 0xFFFE;

/// Archives and indexes are read by other users (web servers, sync jobs).
#[cfg(unix)]
pub const OUTPUT_MODE: u32 = 0o644;

/// Which timestamp to give each entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// Every entry gets the same time,
    /// so packing the same tiles always gives the same bytes.
    Fixed(NaiveDateTime),
    /// Each entry gets its source file's modification time (local time).
    Modified,
}

/// Knobs for [`pack_with()`]
///
/// [`pack_with()`]: fn.pack_with.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackOptions {
    /// The folder every tile is placed under inside the archive
    pub top_level: String,
    pub timestamp: Timestamp,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            top_level: TILE_ROOT.to_owned(),
            timestamp: Timestamp::Fixed(format::dos_epoch()),
        }
    }
}

/// Packs every regular file under `source_root` into a stored ZIP archive
/// at `destination`, using the default [`PackOptions`].
/// Returns the number of entries written.
///
/// [`PackOptions`]: struct.PackOptions.html
pub fn pack(source_root: &Path, destination: &Path) -> PackResult<usize> {
    pack_with(source_root, destination, &PackOptions::default())
}

/// Like [`pack()`], with the given options.
///
/// Files are written in byte order of their archive names,
/// so offsets are reproducible from run to run.
/// The archive is written to a temporary file next to `destination`
/// and renamed into place once it's complete;
/// on failure `destination` is left as it was.
///
/// [`pack()`]: fn.pack.html
pub fn pack_with(
    source_root: &Path,
    destination: &Path,
    options: &PackOptions,
) -> PackResult<usize> {
    let tiles = collect_tiles(source_root, &options.top_level)?;
    debug!(
        "Packing {} files from {} into {}",
        tiles.len(),
        source_root.display(),
        destination.display()
    );

    let temp = temp_file_beside(destination)?;

    let mut writer = ArchiveWriter::new(BufWriter::new(temp));
    for tile in &tiles {
        let contents = fs::read(&tile.source)?;
        let modified = match options.timestamp {
            Timestamp::Fixed(when) => when,
            Timestamp::Modified => modified_time(&tile.source)?,
        };
        writer.add_entry(&tile.name, &contents, modified)?;
    }
    let count = writer.entries();

    let temp = writer.finish()?.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().sync_all()?;
    temp.persist(destination).map_err(|e| e.error)?;

    info!("Packed {} tiles into {}", count, destination.display());
    Ok(count)
}

/// Creates a temporary file in `destination`'s directory (creating that if needed)
/// to be persisted over `destination` once it's complete.
///
/// Unlike most temporary files, it's readable by everyone.
pub(crate) fn temp_file_beside(destination: &Path) -> io::Result<NamedTempFile> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut builder = tempfile::Builder::new();
    builder.prefix(".tilezip-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(OUTPUT_MODE));
    }
    builder.tempfile_in(parent)
}

/// A file to pack, and the name it gets in the archive
#[derive(Debug)]
struct Tile {
    name: String,
    source: PathBuf,
}

fn collect_tiles(root: &Path, top_level: &str) -> PackResult<Vec<Tile>> {
    let mut tiles = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            trace!("Skipping {}", entry.path().display());
            continue;
        }
        let name = archive_path(root, entry.path(), top_level);
        tiles.push(Tile {
            name,
            source: entry.into_path(),
        });
    }
    tiles.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tiles)
}

fn modified_time(path: &Path) -> io::Result<NaiveDateTime> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified).naive_local())
}

/// Checks that a value fits a 32-bit ZIP field
/// (without being 0xFFFFFFFF, which means "look in the Zip64 extra field").
fn fits_u32(value: u64, what: &str) -> PackResult<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v != u32::MAX)
        .ok_or_else(|| PackError::TooLarge(format!("{what} ({value}) needs Zip64")))
}

/// Writes stored entries to a stream, then the central directory
/// and End of central directory record on [`finish()`].
///
/// The stream is only ever appended to, so anything that implements
/// `Write` works, no seeking required.
///
/// [`finish()`]: struct.ArchiveWriter.html#method.finish
pub struct ArchiveWriter<W: Write> {
    inner: W,
    /// Bytes written to `inner` so far
    offset: u64,
    /// Central directory headers, written out at the end
    central_directory: Vec<u8>,
    entries: usize,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            central_directory: Vec::new(),
            entries: 0,
        }
    }

    /// The number of entries added so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Appends a stored entry named `name` holding `contents`.
    pub fn add_entry(
        &mut self,
        name: &str,
        contents: &[u8],
        modified: NaiveDateTime,
    ) -> PackResult<()> {
        if self.entries >= MAX_ENTRIES {
            return Err(PackError::TooLarge(format!(
                "more than {MAX_ENTRIES} entries needs Zip64"
            )));
        }
        if name.len() > u16::MAX as usize {
            return Err(PackError::TooLarge(format!(
                "name of {} bytes doesn't fit in 16 bits",
                name.len()
            )));
        }
        let header_offset = fits_u32(self.offset, "local header offset")?;
        let size = fits_u32(contents.len() as u64, "entry size")?;
        // Whatever comes next (another entry or the central directory)
        // has to start below 4 GiB too, so don't bother writing this one if it can't.
        let entry_length = (LocalFileHeader::FIXED_SIZE + name.len() + contents.len()) as u64;
        fits_u32(self.offset + entry_length, "end of entry")?;

        let crc32 = crc32fast::hash(contents);
        let (last_modified_time, last_modified_date) = format::to_msdos(modified);
        let flags = format::flags_for_name(name);

        let local = LocalFileHeader {
            minimum_extract_version: format::VERSION_NEEDED,
            flags,
            compression_method: format::METHOD_STORED,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size: size,
            uncompressed_size: size,
            path: name.as_bytes(),
            extra_field: &[],
        };
        let mut header = Vec::with_capacity(local.size_in_file());
        local.write(&mut header);
        self.inner.write_all(&header)?;
        self.inner.write_all(contents)?;
        self.offset += (header.len() + contents.len()) as u64;

        CentralDirectoryEntry {
            source_version: format::VERSION_MADE_BY,
            minimum_extract_version: format::VERSION_NEEDED,
            flags,
            compression_method: format::METHOD_STORED,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size: size,
            uncompressed_size: size,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: format::REGULAR_FILE_ATTRIBUTES,
            header_offset,
            path: name.as_bytes(),
            extra_field: &[],
            file_comment: &[],
        }
        .write(&mut self.central_directory);
        self.entries += 1;

        trace!("{} ({} bytes) at {}", name, size, header_offset);
        Ok(())
    }

    /// Writes the central directory and End of central directory record,
    /// flushes, and hands back the underlying stream.
    pub fn finish(mut self) -> PackResult<W> {
        let central_directory_offset = fits_u32(self.offset, "central directory offset")?;
        let central_directory_size = fits_u32(
            self.central_directory.len() as u64,
            "central directory size",
        )?;
        fits_u32(
            self.offset + self.central_directory.len() as u64,
            "end of central directory",
        )?;
        // Checked against MAX_ENTRIES as they were added.
        let entries = self.entries as u16;

        let eocdr = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: entries,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment: &[],
        };
        trace!("{:?}", eocdr);
        eocdr.write(&mut self.central_directory);

        self.inner.write_all(&self.central_directory)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}
