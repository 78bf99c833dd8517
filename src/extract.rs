//! Copying an archive's central directory into a standalone index file.
//!
//! The index holds the raw central directory bytes and nothing else,
//! so whoever serves tiles can find any entry's offset and size
//! without touching the (much larger) archive.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::*;

use crate::locate::{self, MAX_EOCDR_SEARCH};
use crate::result::*;
use crate::write::temp_file_beside;

/// Where an archive's central directory lives, per its EOCDR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralDirectoryLocation {
    /// Offset of the End of central directory record in the archive
    pub eocdr_offset: u64,
    pub offset: u32,
    pub size: u32,
    pub entries: u16,
}

fn open_archive(archive: &Path) -> ExtractResult<File> {
    File::open(archive).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ExtractError::NotFound(archive.to_owned()),
        _ => ExtractError::IOFailure(e),
    })
}

/// Finds the central directory of the archive at `archive`.
///
/// Only the tail of the file (where the EOCDR must be) is read.
pub fn find_central_directory(archive: &Path) -> ExtractResult<CentralDirectoryLocation> {
    let mut file = open_archive(archive)?;
    let length = file.metadata()?.len();
    let tail_length = length.min(MAX_EOCDR_SEARCH as u64);
    let tail_start = length - tail_length;

    file.seek(SeekFrom::Start(tail_start))?;
    let mut tail = Vec::with_capacity(tail_length as usize);
    file.take(tail_length).read_to_end(&mut tail)?;

    let posit = locate::locate(&tail)?;
    let eocdr = posit.record(&tail)?;
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory {
        warn!(
            "{} claims to be a multi-disk archive (disk {} != disk with central directory {})",
            archive.display(),
            eocdr.disk_number,
            eocdr.disk_with_central_directory
        );
    }

    let location = CentralDirectoryLocation {
        eocdr_offset: tail_start + posit.offset as u64,
        offset: eocdr.central_directory_offset,
        size: eocdr.central_directory_size,
        entries: eocdr.entries,
    };
    if location.offset as u64 + location.size as u64 != location.eocdr_offset {
        // Prepended data, or a Zip64 archive. We copy what the EOCDR says regardless.
        warn!(
            "{}: central directory ({} bytes at {}) doesn't end at the EOCDR ({})",
            archive.display(),
            location.size,
            location.offset,
            location.eocdr_offset
        );
    }
    Ok(location)
}

/// Reads the raw central directory of the archive at `archive`.
pub fn read_central_directory(archive: &Path) -> ExtractResult<Vec<u8>> {
    let location = find_central_directory(archive)?;
    debug!("{}: {:?}", archive.display(), location);

    // Start fresh instead of trusting wherever the search left off.
    let mut file = open_archive(archive)?;
    let length = file.metadata()?.len();
    file.seek(SeekFrom::Start(location.offset as u64))?;

    // A corrupt EOCDR can claim up to 4 GiB; only reserve what could be there.
    let available = length.saturating_sub(location.offset as u64);
    let mut central_directory =
        Vec::with_capacity((location.size as u64).min(available) as usize);
    file.take(location.size as u64)
        .read_to_end(&mut central_directory)?;

    if central_directory.len() != location.size as usize {
        return Err(ExtractError::TruncatedRead {
            offset: location.offset as u64,
            expected: location.size as u64,
            actual: central_directory.len() as u64,
        });
    }
    Ok(central_directory)
}

/// Writes the central directory of the archive at `archive` to `index`.
///
/// Like packing, the index is written to a temporary file and renamed into place,
/// so it only ever exists complete.
/// Running this twice on the same archive gives the same bytes.
pub fn extract_index(archive: &Path, index: &Path) -> ExtractResult<()> {
    let central_directory = read_central_directory(archive)?;

    let temp = temp_file_beside(index)?;
    let mut out = BufWriter::new(temp);
    out.write_all(&central_directory)?;
    let temp = out.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().sync_all()?;
    temp.persist(index).map_err(|e| e.error)?;

    info!(
        "Wrote {} byte directory index for {} to {}",
        central_directory.len(),
        archive.display(),
        index.display()
    );
    Ok(())
}
