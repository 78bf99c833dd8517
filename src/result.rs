//! Error types and the related `Result<T>`s

use std::path::PathBuf;

use camino::Utf8PathBuf;
use thiserror::Error;

pub type PackResult<T> = Result<T, PackError>;
pub type LocateResult<T> = Result<T, LocateError>;
pub type ExtractResult<T> = Result<T, ExtractError>;
pub type IndexResult<T> = Result<T, IndexError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors from packing a folder of tiles into an archive
#[derive(Debug, Error)]
pub enum PackError {
    /// A size, offset, or entry count doesn't fit the 32-bit ZIP fields.
    /// (We don't write Zip64 archives.)
    #[error("Archive too large: {0}")]
    TooLarge(String),

    /// An error from underlying I/O
    #[error("I/O Error")]
    IOFailure(#[from] std::io::Error),
}

/// Errors from searching for the End of central directory record
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("Malformed Zip archive: {0}")]
    MalformedArchive(&'static str),
}

/// Errors from copying an archive's central directory into an index file
#[derive(Debug, Error)]
pub enum ExtractError {
    /// There's no archive at the given path.
    #[error("No archive at {0}")]
    NotFound(PathBuf),

    /// The archive ended before the central directory did.
    #[error("Central directory truncated: expected {expected} bytes at offset {offset}, got {actual}")]
    TruncatedRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Locate(#[from] LocateError),

    /// An error from underlying I/O
    #[error("I/O Error")]
    IOFailure(#[from] std::io::Error),
}

/// Errors from reading a directory index (or tiles through it)
#[derive(Debug, Error)]
pub enum IndexError {
    /// The index contained invalid data per the ZIP format.
    #[error("Invalid directory index: {0}")]
    InvalidIndex(&'static str),

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The entry uses a ZIP feature we don't serve (compression, encryption, ...)
    #[error("Unsupported entry: {0}")]
    UnsupportedArchive(String),

    /// No entry in the index has the given path
    #[error("No tile in the index with the path {0}")]
    NoSuchTile(Utf8PathBuf),
}

/// Errors from running a tile set through the pack-then-extract pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Couldn't pack {identifier}")]
    Pack {
        identifier: String,
        #[source]
        source: PackError,
    },

    #[error("Couldn't extract the directory index of {identifier}")]
    Extract {
        identifier: String,
        #[source]
        source: ExtractError,
    },

    /// Identifiers become relative paths under both stores.
    #[error("Invalid tile set identifier {0:?}")]
    InvalidIdentifier(String),

    /// The injected tile producer failed.
    #[error("Tile source failed for {identifier}")]
    TileSource {
        identifier: String,
        #[source]
        source: std::io::Error,
    },
}
