use std::io::{self, Read, Seek, SeekFrom};
use std::iter::Enumerate;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, warn};

use crate::cabinet::Cabinet;
use crate::checksum::data_block_checksum;
use crate::consts;
use crate::ctype::CompressionType;
use crate::error::{Error, Result};
use crate::file::{FileEntries, FileEntry};
use crate::lzx::{LzxDecompressor, LzxParams, FRAME_SIZE};
use crate::options::ChecksumPolicy;

/// An iterator over the folder entries in a cabinet.
#[derive(Clone)]
pub struct FolderEntries<'a> {
    pub(crate) iter: Enumerate<slice::Iter<'a, FolderInfo>>,
    pub(crate) files: &'a [FileEntry],
}

/// Metadata about one folder in a cabinet.
pub struct FolderEntry<'a> {
    index: usize,
    entry: &'a FolderInfo,
    files: &'a [FileEntry],
}

pub(crate) struct FolderInfo {
    first_data_block_offset: u32,
    num_data_blocks: u16,
    pub(crate) compression_type: CompressionType,
    reserve_data: Vec<u8>,
    pub(crate) blocks: Vec<DataBlock>,
}

/// The header of one CFDATA record.
#[derive(Debug, Clone)]
pub(crate) struct DataBlock {
    pub(crate) checksum: u32,
    pub(crate) compressed_size: u16,
    pub(crate) uncompressed_size: u16,
    pub(crate) reserve_data: Vec<u8>,
    pub(crate) data_offset: u64,
    /// Uncompressed bytes in the folder up to and including this block.
    pub(crate) cumulative_size: u64,
}

/// A data block together with its compressed payload.
#[derive(Debug, Clone)]
pub(crate) struct RawBlock {
    pub(crate) header: DataBlock,
    pub(crate) data: Vec<u8>,
}

/// A handle for cancelling folder decoding from another thread.
///
/// Cancellation is checked between data blocks; a cancelled decode returns
/// the bytes produced so far with [`FolderOutput::complete`] unset.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

/// The result of decoding one folder.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FolderOutput {
    /// The decompressed folder stream (or a prefix of it, if cancelled).
    pub data: Vec<u8>,
    /// False if decoding was cancelled before the last data block.
    pub complete: bool,
    /// Indices of data blocks whose checksum did not match, when checksum
    /// mismatches are tolerated.
    pub bad_checksum_blocks: Vec<usize>,
}

impl<'a> Iterator for FolderEntries<'a> {
    type Item = FolderEntry<'a>;

    fn next(&mut self) -> Option<FolderEntry<'a>> {
        let (index, entry) = self.iter.next()?;
        Some(FolderEntry { index, entry, files: self.files })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl<'a> ExactSizeIterator for FolderEntries<'a> {}

impl<'a> FolderEntry<'a> {
    /// Returns the index of this folder within its cabinet.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the scheme used to compress this folder's data.
    pub fn compression_type(&self) -> CompressionType {
        self.entry.compression_type
    }

    /// Returns the LZX parameters for this folder, if it is LZX-compressed.
    pub fn lzx_params(&self) -> Option<LzxParams> {
        self.entry.compression_type.lzx_params()
    }

    /// Returns the offset of this folder's first data block in the cabinet.
    pub fn first_data_block_offset(&self) -> u32 {
        self.entry.first_data_block_offset
    }

    /// Returns the number of data blocks used to store this folder's data.
    pub fn num_data_blocks(&self) -> u16 {
        self.entry.num_data_blocks
    }

    /// Returns the total size of this folder's data when decompressed.
    pub fn uncompressed_size(&self) -> u64 {
        self.entry.uncompressed_size()
    }

    /// Returns the application-defined reserve data for this folder.
    pub fn reserve_data(&self) -> &[u8] {
        &self.entry.reserve_data
    }

    /// Returns an iterator over the file entries in this folder.
    pub fn file_entries(&self) -> FileEntries<'a> {
        FileEntries { iter: self.files.iter(), folder: Some(self.index) }
    }
}

impl FolderInfo {
    pub(crate) fn uncompressed_size(&self) -> u64 {
        self.blocks.last().map_or(0, |block| block.cumulative_size)
    }
}

impl DataBlock {
    pub(crate) fn start(&self) -> u64 {
        self.cumulative_size - self.uncompressed_size as u64
    }
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation of every decode holding a clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](CancelToken::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ========================================================================= //

/// Checks a data block's stored checksum.  Returns false for a mismatch
/// that the policy tolerates.
pub(crate) fn verify_block(
    index: usize,
    block: &DataBlock,
    data: &[u8],
    policy: ChecksumPolicy,
) -> Result<bool> {
    if block.checksum == 0 || policy == ChecksumPolicy::Ignore {
        return Ok(true);
    }
    let actual = data_block_checksum(
        data,
        block.compressed_size,
        block.uncompressed_size,
        &block.reserve_data,
    );
    if actual == block.checksum {
        return Ok(true);
    }
    if policy == ChecksumPolicy::Strict {
        return Err(Error::Checksum {
            block: index,
            expected: block.checksum,
            actual,
        });
    }
    warn!(
        "Checksum mismatch in data block {} (expected {:08x}, actual {:08x})",
        index, block.checksum, actual
    );
    Ok(false)
}

const MAX_PREALLOCATED_FRAMES: u64 = 32;

/// Feeds one folder's data blocks, in order, through an LZX decompressor.
pub(crate) struct FolderDecoder {
    folder: usize,
    lzx: LzxDecompressor,
    policy: ChecksumPolicy,
    next_block: usize,
    bad_checksum_blocks: Vec<usize>,
}

impl FolderDecoder {
    pub(crate) fn new(
        folder: usize,
        ctype: CompressionType,
        policy: ChecksumPolicy,
    ) -> Result<FolderDecoder> {
        let params = match ctype.lzx_params() {
            Some(params) => params,
            None => return Err(Error::UnsupportedMethod { folder, ctype }),
        };
        Ok(FolderDecoder {
            folder,
            lzx: LzxDecompressor::new(params)?,
            policy,
            next_block: 0,
            bad_checksum_blocks: Vec::new(),
        })
    }

    /// Verifies and decodes the next data block of the folder.
    pub(crate) fn decode_block(&mut self, block: &RawBlock) -> Result<Vec<u8>> {
        let index = self.next_block;
        if !verify_block(index, &block.header, &block.data, self.policy)? {
            self.bad_checksum_blocks.push(index);
        }
        let output = self
            .lzx
            .decompress_next(&block.data, block.header.uncompressed_size as usize)?;
        self.next_block += 1;
        Ok(output)
    }

    pub(crate) fn reset(&mut self) {
        self.lzx.reset();
        self.next_block = 0;
        self.bad_checksum_blocks.clear();
    }

    /// Decodes every block produced by `blocks`, stopping early (with
    /// `complete` unset) if `cancel` fires.
    pub(crate) fn run<I>(
        mut self,
        blocks: I,
        expected_size: u64,
        cancel: &CancelToken,
    ) -> Result<FolderOutput>
    where
        I: IntoIterator<Item = Result<RawBlock>>,
    {
        debug!("Decoding folder {} ({} bytes)", self.folder, expected_size);
        // Declared sizes are untrusted; beyond this the buffer grows as
        // blocks actually decode.
        let reserve = expected_size.min(MAX_PREALLOCATED_FRAMES * FRAME_SIZE as u64);
        let mut data = Vec::with_capacity(reserve as usize);
        for block in blocks {
            if cancel.is_cancelled() {
                debug!(
                    "Decoding of folder {} cancelled after {} bytes",
                    self.folder,
                    data.len()
                );
                return Ok(FolderOutput {
                    data,
                    complete: false,
                    bad_checksum_blocks: self.bad_checksum_blocks,
                });
            }
            let block = block?;
            data.extend(self.decode_block(&block)?);
        }
        debug!("Decoded folder {} ({} bytes)", self.folder, data.len());
        Ok(FolderOutput {
            data,
            complete: true,
            bad_checksum_blocks: self.bad_checksum_blocks,
        })
    }
}

// ========================================================================= //

/// A reader for reading decompressed data from a cabinet folder.
pub(crate) struct FolderReader<'a, R> {
    cabinet: &'a Cabinet<R>,
    decoder: FolderDecoder,
    total_size: u64,
    data_blocks: &'a [DataBlock],
    current_block_index: usize,
    current_block_data: Vec<u8>,
    current_offset_within_block: usize,
    current_offset_within_folder: u64,
    failed_block: Option<usize>,
}

impl<'a, R: Read + Seek> FolderReader<'a, R> {
    pub(crate) fn new(
        cabinet: &'a Cabinet<R>,
        index: usize,
    ) -> Result<FolderReader<'a, R>> {
        let entry = cabinet.folder_info(index)?;
        let decoder = FolderDecoder::new(
            index,
            entry.compression_type,
            cabinet.options().checksum,
        )?;
        let mut folder_reader = FolderReader {
            cabinet,
            decoder,
            total_size: entry.uncompressed_size(),
            data_blocks: &entry.blocks,
            current_block_index: 0,
            current_block_data: Vec::new(),
            current_offset_within_block: 0,
            current_offset_within_folder: 0,
            failed_block: None,
        };
        folder_reader.load_block()?;
        Ok(folder_reader)
    }

    fn current_block_start(&self) -> u64 {
        self.data_blocks
            .get(self.current_block_index)
            .map_or(0, DataBlock::start)
    }

    fn rewind(&mut self) -> Result<()> {
        self.current_offset_within_block = 0;
        self.current_offset_within_folder = 0;
        if self.current_block_index != 0 || self.failed_block.is_some() {
            self.current_block_index = 0;
            self.failed_block = None;
            self.decoder.reset();
            self.load_block()?;
        }
        Ok(())
    }

    fn load_block(&mut self) -> Result<()> {
        if self.current_block_index >= self.data_blocks.len() {
            self.current_block_data = Vec::new();
            return Ok(());
        }
        // Nothing from the previous block may be served once this one fails.
        self.current_block_data.clear();
        let result = self
            .cabinet
            .read_raw_block(&self.data_blocks[self.current_block_index])
            .and_then(|raw| self.decoder.decode_block(&raw));
        match result {
            Ok(data) => {
                self.current_block_data = data;
                Ok(())
            }
            Err(error) => {
                self.failed_block = Some(self.current_block_index);
                Err(error)
            }
        }
    }

    fn check_failed(&self) -> io::Result<()> {
        match self.failed_block {
            Some(index) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Data block {} failed to decode; seek back to retry",
                    index
                ),
            )),
            None => Ok(()),
        }
    }
}

impl<'a, R: Read + Seek> Read for FolderReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_failed()?;
        // Skip over exhausted (or empty) blocks.
        while self.current_offset_within_block == self.current_block_data.len()
        {
            if self.current_block_index + 1 >= self.data_blocks.len() {
                return Ok(0);
            }
            self.current_block_index += 1;
            self.current_offset_within_block = 0;
            self.load_block()?;
        }
        let max_bytes = buf.len().min(
            self.current_block_data.len() - self.current_offset_within_block,
        );
        buf[..max_bytes].copy_from_slice(
            &self.current_block_data[self.current_offset_within_block..]
                [..max_bytes],
        );
        self.current_offset_within_block += max_bytes;
        self.current_offset_within_folder += max_bytes as u64;
        Ok(max_bytes)
    }
}

impl<'a, R: Read + Seek> Seek for FolderReader<'a, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => {
                self.current_offset_within_folder as i64 + delta
            }
            SeekFrom::End(delta) => self.total_size as i64 + delta,
        };
        if new_offset < 0 || (new_offset as u64) > self.total_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Cannot seek to {}, data length is {}",
                    new_offset, self.total_size
                ),
            ));
        }
        let new_offset = new_offset as u64;
        if self.failed_block.is_some()
            || new_offset < self.current_block_start()
        {
            self.rewind()?;
        }
        if new_offset > 0 {
            while self.data_blocks[self.current_block_index].cumulative_size
                < new_offset
            {
                self.current_block_index += 1;
                self.load_block()?;
            }
        }
        debug_assert!(new_offset >= self.current_block_start());
        self.current_offset_within_block =
            (new_offset - self.current_block_start()) as usize;
        self.current_offset_within_folder = new_offset;
        Ok(new_offset)
    }
}

// ========================================================================= //

pub(crate) fn parse_folder_entry<R: Read>(
    mut reader: R,
    reserve_size: usize,
) -> Result<FolderInfo> {
    let first_data_offset = reader.read_u32::<LittleEndian>()?;
    let num_data_blocks = reader.read_u16::<LittleEndian>()?;
    let compression_bits = reader.read_u16::<LittleEndian>()?;
    let compression_type = CompressionType::from_bitfield(compression_bits)?;
    let mut folder_reserve_data = vec![0u8; reserve_size];
    if reserve_size > 0 {
        reader.read_exact(&mut folder_reserve_data)?;
    }
    Ok(FolderInfo {
        first_data_block_offset: first_data_offset,
        num_data_blocks,
        compression_type,
        reserve_data: folder_reserve_data,
        blocks: Vec::new(),
    })
}

/// Walks the headers of a folder's data blocks, recording where each
/// payload lives.
pub(crate) fn parse_data_blocks<R: Read + Seek>(
    mut reader: R,
    folder: &mut FolderInfo,
    data_reserve_size: usize,
    cabinet_size: u64,
) -> Result<()> {
    let first_offset = folder.first_data_block_offset as u64;
    if first_offset > cabinet_size {
        format_error!(
            "Folder data offset {} is beyond the end of the cabinet ({} bytes)",
            first_offset,
            cabinet_size
        );
    }
    reader.seek(SeekFrom::Start(first_offset))?;
    let mut blocks = Vec::with_capacity(folder.num_data_blocks as usize);
    let mut total_size = 0;
    for _ in 0..folder.num_data_blocks {
        let block = parse_block_entry(
            &mut reader,
            total_size,
            data_reserve_size,
            cabinet_size,
        )?;
        total_size = block.cumulative_size;
        blocks.push(block);
    }
    folder.blocks = blocks;
    Ok(())
}

fn parse_block_entry<R: Read + Seek>(
    mut reader: R,
    cumulative_size: u64,
    data_reserve_size: usize,
    cabinet_size: u64,
) -> Result<DataBlock> {
    let checksum = reader.read_u32::<LittleEndian>()?;
    let compressed_size = reader.read_u16::<LittleEndian>()?;
    let uncompressed_size = reader.read_u16::<LittleEndian>()?;
    if compressed_size > consts::MAX_COMPRESSED_BLOCK_SIZE {
        format_error!(
            "Data block holds {} compressed bytes (max is {})",
            compressed_size,
            consts::MAX_COMPRESSED_BLOCK_SIZE
        );
    }
    if uncompressed_size > consts::MAX_UNCOMPRESSED_BLOCK_SIZE {
        format_error!(
            "Data block decompresses to {} bytes (max is {})",
            uncompressed_size,
            consts::MAX_UNCOMPRESSED_BLOCK_SIZE
        );
    }
    let mut reserve_data = vec![0u8; data_reserve_size];
    reader.read_exact(&mut reserve_data)?;
    let data_offset = reader.stream_position()?;
    if data_offset + compressed_size as u64 > cabinet_size {
        format_error!(
            "Data block at offset {} runs past the end of the cabinet",
            data_offset
        );
    }
    reader.seek(SeekFrom::Current(compressed_size as i64))?;
    let cumulative_size = cumulative_size + uncompressed_size as u64;

    Ok(DataBlock {
        checksum,
        compressed_size,
        uncompressed_size,
        reserve_data,
        cumulative_size,
        data_offset,
    })
}
