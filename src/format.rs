//! Code specific to the ZIP file format.
//!
//! We try to keep the nitty gritty here,
//! and the packing/extracting/indexing in their own modules.
//!
//! Most comments quote the ZIP application note, [`APPNOTE.TXT`].
//! Only the subset of the format we write (stored entries, no Zip64,
//! no extra fields) is encoded here; decoding is a little more lenient
//! so indexes from other tools can be read too.
//!
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
pub const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Central directory magic number
pub const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
pub const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];

/// The largest comment an End of central directory record can carry.
pub const MAX_COMMENT_LENGTH: usize = u16::MAX as usize;

/// "Version made by": UNIX (3) in the upper byte, ZIP 2.0 in the lower.
pub const VERSION_MADE_BY: u16 = (3 << 8) | 20;
/// "Version needed to extract": ZIP 2.0
pub const VERSION_NEEDED: u16 = 20;

/// The "store" compression method (no compression)
pub const METHOD_STORED: u16 = 0;

/// A regular file, rw-r--r--, in the upper half of the external attributes.
pub const REGULAR_FILE_ATTRIBUTES: u32 = 0o100644 << 16;

/// Bit 11: Language encoding flag (EFS).
const FLAG_UTF8: u16 = 1 << 11;
/// Bit 0: If set, indicates that the file is encrypted
const FLAG_ENCRYPTED: u16 = 1;

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    /// Size of the record without its comment
    pub const FIXED_SIZE: usize = 22;

    /// Offset of the "size of the central directory" field in the record
    pub const SIZE_FIELD_OFFSET: usize = 12;

    pub fn parse(mut eocdr: &'a [u8]) -> LocateResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        if eocdr.len() < Self::FIXED_SIZE || eocdr[..4] != EOCDR_MAGIC {
            return Err(LocateError::MalformedArchive(
                "Invalid End Of Central Directory Record",
            ));
        }
        eocdr = &eocdr[4..];
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        let comment_length = read_u16(&mut eocdr) as usize;
        // Some writers get the comment length wrong; take what's there.
        let file_comment = &eocdr[..comment_length.min(eocdr.len())];

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&EOCDR_MAGIC);
        put_u16(out, self.disk_number);
        put_u16(out, self.disk_with_central_directory);
        put_u16(out, self.entries_on_this_disk);
        put_u16(out, self.entries);
        put_u32(out, self.central_directory_size);
        put_u32(out, self.central_directory_offset);
        put_u16(out, self.file_comment.len() as u16);
        out.extend_from_slice(self.file_comment);
    }
}

/// Data from a central directory entry
///
/// Each of these records contains information about a file
/// stored in the ZIP archive.
/// A directory index is nothing but a run of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    /// Size of the header without its variable-length fields
    pub const FIXED_SIZE: usize = 46;

    pub fn parse_and_consume(entry: &mut &'a [u8]) -> IndexResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        if entry.len() < Self::FIXED_SIZE {
            return Err(IndexError::InvalidIndex(
                "Truncated central directory entry",
            ));
        }
        if entry[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(IndexError::InvalidIndex("Invalid central directory entry"));
        }
        *entry = &entry[4..];
        let source_version = read_u16(entry);
        let minimum_extract_version = read_u16(entry);
        let flags = read_u16(entry);
        let compression_method = read_u16(entry);
        let last_modified_time = read_u16(entry);
        let last_modified_date = read_u16(entry);
        let crc32 = read_u32(entry);
        let compressed_size = read_u32(entry);
        let uncompressed_size = read_u32(entry);
        let path_length = read_u16(entry) as usize;
        let extra_field_length = read_u16(entry) as usize;
        let file_comment_length = read_u16(entry) as usize;
        let disk_number = read_u16(entry);
        let internal_file_attributes = read_u16(entry);
        let external_file_attributes = read_u32(entry);
        let header_offset = read_u32(entry);
        if entry.len() < path_length + extra_field_length + file_comment_length {
            return Err(IndexError::InvalidIndex(
                "Central directory entry runs past the end of the index",
            ));
        }
        let (path, remaining) = entry.split_at(path_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        let (file_comment, remaining) = remaining.split_at(file_comment_length);
        *entry = remaining;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }

    /// Appends the header to `out`.
    ///
    /// Callers must have checked that the variable-length fields
    /// fit their 16-bit lengths.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        put_u16(out, self.source_version);
        put_u16(out, self.minimum_extract_version);
        put_u16(out, self.flags);
        put_u16(out, self.compression_method);
        put_u16(out, self.last_modified_time);
        put_u16(out, self.last_modified_date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.path.len() as u16);
        put_u16(out, self.extra_field.len() as u16);
        put_u16(out, self.file_comment.len() as u16);
        put_u16(out, self.disk_number);
        put_u16(out, self.internal_file_attributes);
        put_u32(out, self.external_file_attributes);
        put_u32(out, self.header_offset);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
        out.extend_from_slice(self.file_comment);
    }

    pub fn size_in_file(&self) -> usize {
        Self::FIXED_SIZE + self.path.len() + self.extra_field.len() + self.file_comment.len()
    }
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// Byte-range readers skip over it to get to the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader<'a> {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    /// Size of the header without its variable-length fields
    pub const FIXED_SIZE: usize = 30;

    pub fn parse_and_consume(header: &mut &'a [u8]) -> IndexResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        if header.len() < Self::FIXED_SIZE || header[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(IndexError::InvalidIndex(
                "No local file header at the indexed offset",
            ));
        }
        *header = &header[4..];
        let minimum_extract_version = read_u16(header);
        let flags = read_u16(header);
        let compression_method = read_u16(header);
        let last_modified_time = read_u16(header);
        let last_modified_date = read_u16(header);
        let crc32 = read_u32(header);
        let compressed_size = read_u32(header);
        let uncompressed_size = read_u32(header);
        let path_length = read_u16(header) as usize;
        let extra_field_length = read_u16(header) as usize;
        if header.len() < path_length + extra_field_length {
            return Err(IndexError::InvalidIndex(
                "Local file header runs past the end of the archive",
            ));
        }
        let (path, remaining) = header.split_at(path_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        *header = remaining;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        put_u16(out, self.minimum_extract_version);
        put_u16(out, self.flags);
        put_u16(out, self.compression_method);
        put_u16(out, self.last_modified_time);
        put_u16(out, self.last_modified_date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.path.len() as u16);
        put_u16(out, self.extra_field.len() as u16);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
    }

    pub fn size_in_file(&self) -> usize {
        Self::FIXED_SIZE + self.path.len() + self.extra_field.len()
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumed to be CP437.
pub fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & FLAG_UTF8 != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
pub fn is_encrypted(flags: u16) -> bool {
    flags & FLAG_ENCRYPTED != 0
}

/// General purpose flags for an entry with the given name.
///
/// Plain ASCII is valid CP437, so only other names need the EFS bit.
pub fn flags_for_name(name: &str) -> u16 {
    if name.is_ascii() {
        0
    } else {
        FLAG_UTF8
    }
}

/// The earliest moment MS-DOS timestamps can express
pub fn dos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("1980-01-01 is a valid date")
}

/// Packs a timestamp into MS-DOS (time, date) fields.
///
/// Times outside 1980..=2107 are clamped to the representable range.
pub fn to_msdos(when: NaiveDateTime) -> (u16, u16) {
    if when.year() < 1980 {
        return to_msdos(dos_epoch());
    }
    if when.year() > 2107 {
        return (0xBF7D, 0xFF9F); // 2107-12-31 23:59:58
    }
    let time = (when.hour() << 11) | (when.minute() << 5) | (when.second() / 2);
    let date = (((when.year() - 1980) as u32) << 9) | (when.month() << 5) | when.day();
    (time as u16, date as u16)
}

/// Unpacks MS-DOS (time, date) fields.
///
/// Returns `None` for fields that don't name a real moment
/// (a zeroed date, for example).
pub fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}
