//! A library for reading [Windows
//! cabinet](https://en.wikipedia.org/wiki/Cabinet_(file_format)) (CAB) files
//! whose folders are compressed with LZX.
//!
//! Open a cabinet with [`Cabinet::new`] (or [`open_cabinet`] for an
//! in-memory archive), list its folders and files, then either decode whole
//! folders or extract individual files.  Cabinets belonging to a
//! multi-volume set can be linked with [`CabinetSet`] so that folders
//! spanning several volumes decode as one stream.
//!
//! The LZX engine itself is exposed as [`LzxDecompressor`] for callers that
//! hold raw LZX data outside of a cabinet.

#![warn(missing_docs)]

#[macro_use]
mod macros;

mod assemble;
mod bits;
mod cabinet;
mod checksum;
mod consts;
mod ctype;
mod datetime;
mod error;
mod file;
mod folder;
mod huffman;
mod lzx;
mod options;
mod string;
mod translate;
mod volume;

#[cfg(test)]
mod testutil;

use std::io::Cursor;

pub use crate::assemble::{slice_file, slice_files, FilePart};
pub use crate::cabinet::{Cabinet, CabinetHeader, VolumeLink};
pub use crate::ctype::CompressionType;
pub use crate::error::{Error, Result};
pub use crate::file::{FileEntries, FileEntry, FileReader};
pub use crate::folder::{CancelToken, FolderEntries, FolderEntry, FolderOutput};
pub use crate::lzx::{
    LzxDecompressor, LzxParams, FRAME_SIZE, MAX_WINDOW_BITS, MIN_WINDOW_BITS,
};
pub use crate::options::{ChecksumPolicy, ExtractOptions, MissingVolumePolicy};
pub use crate::volume::CabinetSet;

/// Opens a cabinet held entirely in memory.
pub fn open_cabinet(bytes: &[u8]) -> Result<Cabinet<Cursor<&[u8]>>> {
    Cabinet::new(Cursor::new(bytes))
}
