use std::io;

use thiserror::Error;

use crate::ctype::CompressionType;

/// Errors that can occur while reading a cabinet or decoding its folders.
///
/// `Format` errors are fatal to the whole cabinet.  All decode-time errors
/// are scoped to the folder that produced them; files in other folders can
/// still be extracted.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying reader.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The cabinet header or directory is malformed.
    #[error("Invalid cabinet: {0}")]
    Format(String),

    /// The folder uses a compression method other than LZX.
    #[error("Folder {folder} uses unsupported compression method {ctype:?}")]
    UnsupportedMethod {
        /// Index of the folder within its cabinet.
        folder: usize,
        /// The compression type declared in the folder header.
        ctype: CompressionType,
    },

    /// A Huffman code-length array did not form a valid prefix code.
    #[error("Invalid Huffman table: {0}")]
    InvalidHuffmanTable(String),

    /// An LZX block header declared a block type other than verbatim,
    /// aligned offset or uncompressed.
    #[error("Unknown LZX block type {0}")]
    UnknownBlockType(u8),

    /// A match referred back further than the data decoded so far.
    #[error(
        "Match distance {distance} exceeds the {available} bytes available"
    )]
    InvalidMatchDistance {
        /// The decoded match distance.
        distance: u32,
        /// Bytes of history that could legally be referenced.
        available: u64,
    },

    /// The compressed data ran out in the middle of a token or header.
    #[error("Compressed stream ended unexpectedly")]
    TruncatedStream,

    /// The compressed stream is structurally inconsistent.
    #[error("Corrupt LZX stream: {0}")]
    Corrupt(String),

    /// A data block's stored checksum did not match its contents.
    #[error(
        "Checksum error in data block {block} \
         (expected {expected:08x}, actual {actual:08x})"
    )]
    Checksum {
        /// Index of the data block within its folder.
        block: usize,
        /// The checksum stored in the data block header.
        expected: u32,
        /// The checksum computed over the block.
        actual: u32,
    },

    /// A file spans into a cabinet volume that was not supplied.
    #[error("File {name:?} spans into a cabinet volume that is not available")]
    MissingVolume {
        /// Name of the file whose data is incomplete.
        name: String,
        /// The portion of the file that could be decoded from the volumes
        /// at hand, if the caller asked for it.
        partial: Option<Vec<u8>>,
    },

    /// A requested file or folder does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error only affects a single folder, so that
    /// other folders of the same cabinet can still be decoded.
    pub fn is_folder_scoped(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::Format(_))
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        match error {
            Error::Io(error) => error,
            Error::NotFound(_) => {
                io::Error::new(io::ErrorKind::NotFound, error)
            }
            Error::TruncatedStream => {
                io::Error::new(io::ErrorKind::UnexpectedEof, error)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
