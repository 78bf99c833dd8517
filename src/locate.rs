//! Finding the End of central directory record.
//!
//! It should be right at the end of the archive,
//! but its variable-length comment means we can't jump to a known offset.

use memchr::memmem;

use crate::format::{EndOfCentralDirectory, EOCDR_MAGIC, MAX_COMMENT_LENGTH};
use crate::result::*;

/// The furthest from the end of an archive an EOCDR can start:
/// the fixed record plus the longest comment the format allows.
pub const MAX_EOCDR_SEARCH: usize = EndOfCentralDirectory::FIXED_SIZE + MAX_COMMENT_LENGTH;

/// Where [`locate()`] found the End of central directory record
///
/// [`locate()`]: fn.locate.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EocdPosition {
    /// Offset of the record's signature in the searched bytes
    pub offset: usize,
}

impl EocdPosition {
    /// Decodes the record from the bytes it was found in.
    pub fn record<'a>(&self, bytes: &'a [u8]) -> LocateResult<EndOfCentralDirectory<'a>> {
        let eocdr = bytes
            .get(self.offset..)
            .ok_or(LocateError::MalformedArchive(
                "End Of Central Directory Record is past the end of the archive",
            ))?;
        EndOfCentralDirectory::parse(eocdr)
    }
}

/// Searches backward through `bytes` for the End of central directory record.
///
/// Only the last [`MAX_EOCDR_SEARCH`] bytes are searched,
/// so records with comments up to 65535 bytes long (the format's limit) are found.
/// The last signature with room for a whole record after it wins.
///
/// [`MAX_EOCDR_SEARCH`]: constant.MAX_EOCDR_SEARCH.html
pub fn locate(bytes: &[u8]) -> LocateResult<EocdPosition> {
    let record_room = EndOfCentralDirectory::FIXED_SIZE - EOCDR_MAGIC.len();
    let search_end = bytes
        .len()
        .checked_sub(record_room)
        .filter(|end| *end >= EOCDR_MAGIC.len())
        .ok_or(LocateError::MalformedArchive(
            "Too small for an End Of Central Directory Record",
        ))?;
    let search_start = bytes.len().saturating_sub(MAX_EOCDR_SEARCH);

    memmem::rfind(&bytes[search_start..search_end], &EOCDR_MAGIC)
        .map(|found| EocdPosition {
            offset: search_start + found,
        })
        .ok_or(LocateError::MalformedArchive(
            "Couldn't find End Of Central Directory Record",
        ))
}
