//! Error and Result types for Burrow storage operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Burrow operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for WAL and index operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid magic number in a file header.
    #[error("invalid magic number {actual:#010x}, expected {expected:#010x}")]
    InvalidMagic {
        /// Magic number the format requires.
        expected: u32,
        /// Magic number found in the file.
        actual: u32,
    },

    /// Unsupported file format version.
    #[error("unsupported format version {0}")]
    UnsupportedFormat(u8),

    /// Encoded data is inconsistent with its framing.
    #[error("invalid size: {0}")]
    InvalidSize(&'static str),

    /// Encoded data ended before a value could be fully read.
    #[error("unexpected end of data: {0}")]
    UnexpectedEof(&'static str),

    /// A varint did not fit the target integer width.
    #[error("varint overflows target width")]
    IntOverflow,

    /// CRC verification failure.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored on disk.
        expected: u32,
        /// Checksum computed over the data read.
        actual: u32,
    },

    /// Index writer method called out of stage order.
    #[error("invalid stage {requested:?}, currently at {current:?}")]
    StageOrder {
        /// Stage the writer is currently in.
        current: &'static str,
        /// Stage the call would have required.
        requested: &'static str,
    },

    /// `add_series` called twice with the same reference.
    #[error("series with reference {0} already added")]
    DuplicateSeries(u64),

    /// A postings list referenced a series that was never added.
    #[error("series for reference {0} not found")]
    MissingSeriesRef(u64),

    /// A label index referenced a value that is not in the symbol table.
    #[error("symbol {0:?} not registered")]
    UnknownSymbol(String),

    /// The index file would exceed its maximum size of 4 GiB.
    #[error("index file exceeds maximum size of 4 GiB")]
    FileTooLarge,

    /// A symbol or section offset pointed outside the mapped file.
    #[error("invalid offset {0}")]
    InvalidOffset(u64),

    /// A label name or value failed validation.
    #[error("invalid label {0:?}")]
    InvalidLabel(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O error annotated with the operation that failed.
    #[error("{op}: {source}")]
    IoOp {
        /// Short description of the failed operation.
        op: &'static str,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Extension adding operation context to raw I/O results.
pub(crate) trait IoResultExt<T> {
    /// Wraps the error with a short description of the failed operation.
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|source| StoreError::IoOp { op, source })
    }
}
