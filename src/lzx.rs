//! The LZX decompressor used by cabinet folders.
//!
//! An LZX stream is a sequence of blocks (verbatim, aligned offset or
//! uncompressed) whose decoded output is divided into 32 KiB frames.  In a
//! cabinet, each data block carries exactly one frame of output, and the
//! compressed bitstream is padded to a 16-bit boundary at the end of each
//! frame.  All decoder state (window, repeated offsets, trees, position
//! within the current block) carries over from one frame to the next.

use tracing::{debug, trace};

use crate::bits::BitReader;
use crate::error::{Error, Result};
use crate::huffman::{read_delta_lengths, HuffmanTable};
use crate::translate::translate_frame;

/// Number of uncompressed bytes in one LZX frame.
pub const FRAME_SIZE: usize = 0x8000;

/// Smallest supported window exponent (32 KiB window).
pub const MIN_WINDOW_BITS: u8 = 15;
/// Largest supported window exponent (2 MiB window).
pub const MAX_WINDOW_BITS: u8 = 21;

const MIN_MATCH: usize = 2;
const NUM_CHARS: usize = 256;
const NUM_PRIMARY_LENGTHS: usize = 7;
pub(crate) const LENGTH_TREE_SIZE: usize = 249;
pub(crate) const ALIGNED_TREE_SIZE: usize = 8;

const MAIN_TABLE_BITS: u32 = 12;
const LENGTH_TABLE_BITS: u32 = 12;
const ALIGNED_TABLE_BITS: u32 = 7;

const NUM_POSITION_SLOTS: [usize; 7] = [30, 32, 34, 36, 38, 42, 50];
const MAX_POSITION_SLOTS: usize = 50;

/// Number of footer bits that follow a match in the given position slot.
pub(crate) const fn extra_bits(slot: usize) -> u32 {
    if slot < 4 {
        0
    } else if slot < 36 {
        (slot / 2 - 1) as u32
    } else {
        17
    }
}

/// Smallest offset encoded by each position slot (plus two; slots 0-2 are
/// the repeated offsets).
pub(crate) const POSITION_BASE: [u32; MAX_POSITION_SLOTS + 1] = {
    let mut base = [0u32; MAX_POSITION_SLOTS + 1];
    let mut slot = 1;
    while slot < base.len() {
        base[slot] = base[slot - 1] + (1 << extra_bits(slot - 1));
        slot += 1;
    }
    base
};

/// Number of symbols in the main tree for the given window exponent.
pub(crate) fn main_tree_size(window_bits: u8) -> usize {
    NUM_CHARS + 8 * position_slots(window_bits)
}

fn position_slots(window_bits: u8) -> usize {
    NUM_POSITION_SLOTS[(window_bits - MIN_WINDOW_BITS) as usize]
}

// ========================================================================= //

/// Parameters governing one folder's LZX stream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LzxParams {
    /// Base-2 logarithm of the sliding window size (15-21).
    pub window_bits: u8,
    /// If set, the repeated-offset cache returns to its initial state after
    /// this many input chunks.  Cabinet folders never set this.
    pub reset_interval: Option<u32>,
}

impl LzxParams {
    /// Parameters for a cabinet folder with the given window exponent.
    pub fn new(window_bits: u8) -> LzxParams {
        LzxParams { window_bits, reset_interval: None }
    }

    /// Returns the window capacity in bytes.
    pub fn window_size(&self) -> usize {
        1 << self.window_bits
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BlockKind {
    Verbatim,
    AlignedOffset,
    Uncompressed,
}

impl BlockKind {
    fn from_bits(bits: u32) -> Result<BlockKind> {
        match bits {
            1 => Ok(BlockKind::Verbatim),
            2 => Ok(BlockKind::AlignedOffset),
            3 => Ok(BlockKind::Uncompressed),
            other => Err(Error::UnknownBlockType(other as u8)),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Block {
    kind: BlockKind,
    size: usize,
    remaining: usize,
}

enum Token {
    Literal(u8),
    Match { length: usize, distance: u32 },
}

/// The three most recently used match distances.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct RepeatedOffsets {
    r: [u32; 3],
}

impl RepeatedOffsets {
    fn new() -> RepeatedOffsets {
        RepeatedOffsets { r: [1, 1, 1] }
    }

    /// Returns the distance cached in `slot` and promotes it to R0.
    fn reuse(&mut self, slot: usize) -> u32 {
        self.r.swap(0, slot);
        self.r[0]
    }

    fn push(&mut self, distance: u32) {
        self.r = [distance, self.r[0], self.r[1]];
    }
}

/// The circular history buffer.
struct Window {
    data: Vec<u8>,
    pos: usize,
    produced: u64,
}

impl Window {
    fn new(size: usize) -> Window {
        Window { data: vec![0; size], pos: 0, produced: 0 }
    }

    fn mask(&self) -> usize {
        self.data.len() - 1
    }

    fn push(&mut self, byte: u8) {
        self.data[self.pos] = byte;
        self.pos = (self.pos + 1) & self.mask();
        self.produced += 1;
    }

    fn push_slice(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push(byte);
        }
    }

    fn copy_match(&mut self, distance: u32, length: usize) -> Result<()> {
        let available = self.produced.min(self.data.len() as u64);
        if distance == 0 || distance as u64 > available {
            return Err(Error::InvalidMatchDistance { distance, available });
        }
        let mask = self.mask();
        let mut src = (self.pos + self.data.len() - distance as usize) & mask;
        // Byte by byte: the source may overlap the bytes being written.
        for _ in 0..length {
            self.data[self.pos] = self.data[src];
            self.pos = (self.pos + 1) & mask;
            src = (src + 1) & mask;
        }
        self.produced += length as u64;
        Ok(())
    }

    /// Copies out the `len` bytes that end at the write cursor.
    fn tail(&self, len: usize) -> Vec<u8> {
        let mask = self.mask();
        let start = (self.pos + self.data.len() - len) & mask;
        if start + len <= self.data.len() {
            self.data[start..start + len].to_vec()
        } else {
            let mut out = self.data[start..].to_vec();
            out.extend_from_slice(&self.data[..len - out.len()]);
            out
        }
    }
}

// ========================================================================= //

/// Decompresses one folder's LZX stream, one chunk at a time.
///
/// Chunks must be supplied in order: every chunk's output depends on the
/// window, repeated offsets and trees left behind by the previous one.
pub struct LzxDecompressor {
    params: LzxParams,
    window: Window,
    offsets: RepeatedOffsets,
    main_lengths: Vec<u8>,
    length_lengths: Vec<u8>,
    main_tree: HuffmanTable,
    length_tree: HuffmanTable,
    aligned_tree: HuffmanTable,
    block: Option<Block>,
    pending_pad: bool,
    header_read: bool,
    translation_size: Option<u32>,
    chunks: u64,
}

impl LzxDecompressor {
    /// Creates a decompressor for a fresh folder.
    pub fn new(params: LzxParams) -> Result<LzxDecompressor> {
        if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&params.window_bits)
        {
            format_error!(
                "LZX window exponent {} is outside {}..={}",
                params.window_bits,
                MIN_WINDOW_BITS,
                MAX_WINDOW_BITS
            );
        }
        if params.reset_interval == Some(0) {
            format_error!("LZX reset interval must be non-zero");
        }
        Ok(LzxDecompressor {
            params,
            window: Window::new(params.window_size()),
            offsets: RepeatedOffsets::new(),
            main_lengths: vec![0; main_tree_size(params.window_bits)],
            length_lengths: vec![0; LENGTH_TREE_SIZE],
            main_tree: HuffmanTable::empty(),
            length_tree: HuffmanTable::empty(),
            aligned_tree: HuffmanTable::empty(),
            block: None,
            pending_pad: false,
            header_read: false,
            translation_size: None,
            chunks: 0,
        })
    }

    /// Returns the parameters this decompressor was created with.
    pub fn params(&self) -> LzxParams {
        self.params
    }

    /// Returns the total number of bytes produced since the folder start.
    pub fn bytes_produced(&self) -> u64 {
        self.window.produced
    }

    /// Returns the call-translation size announced by the stream header, or
    /// `None` if translation is disabled (or the header was not read yet).
    pub fn translation_size(&self) -> Option<u32> {
        self.translation_size
    }

    /// Returns the decoder to its state at the start of a folder.
    pub fn reset(&mut self) {
        let params = self.params;
        self.window = Window::new(params.window_size());
        self.offsets = RepeatedOffsets::new();
        self.main_lengths = vec![0; main_tree_size(params.window_bits)];
        self.length_lengths = vec![0; LENGTH_TREE_SIZE];
        self.main_tree = HuffmanTable::empty();
        self.length_tree = HuffmanTable::empty();
        self.aligned_tree = HuffmanTable::empty();
        self.block = None;
        self.pending_pad = false;
        self.header_read = false;
        self.translation_size = None;
        self.chunks = 0;
    }

    /// Decodes the next chunk of compressed input into exactly
    /// `output_len` bytes.
    ///
    /// Output is produced in frames of [`FRAME_SIZE`] bytes counted from the
    /// start of the folder; every chunk except the last one of a folder must
    /// end on a frame boundary.
    pub fn decompress_next(
        &mut self,
        input: &[u8],
        output_len: usize,
    ) -> Result<Vec<u8>> {
        if let Some(interval) = self.params.reset_interval {
            if self.chunks > 0 && self.chunks % interval as u64 == 0 {
                trace!("Resetting repeated offsets at chunk {}", self.chunks);
                self.offsets = RepeatedOffsets::new();
            }
        }
        self.chunks += 1;

        let mut reader = BitReader::new(input);
        if !self.header_read {
            self.read_stream_header(&mut reader)?;
        }
        let mut output = Vec::with_capacity(output_len);
        while output.len() < output_len {
            let frame_start = self.window.produced;
            let into_frame = (frame_start % FRAME_SIZE as u64) as usize;
            let frame_len =
                (FRAME_SIZE - into_frame).min(output_len - output.len());
            self.decode_run(&mut reader, frame_len)?;
            let mut frame = self.window.tail(frame_len);
            if let Some(size) = self.translation_size {
                translate_frame(&mut frame, frame_start, size);
            }
            output.extend_from_slice(&frame);
            if self.window.produced % FRAME_SIZE as u64 == 0 {
                reader.align_to_word();
            }
        }
        let unused = reader.bytes_remaining();
        if unused > 0 {
            trace!("{} bytes of chunk input left unused", unused);
        }
        Ok(output)
    }

    fn read_stream_header(&mut self, reader: &mut BitReader) -> Result<()> {
        if reader.read_bits(1)? == 1 {
            let high = reader.read_bits(16)?;
            let low = reader.read_bits(16)?;
            let size = (high << 16) | low;
            debug!("LZX call translation enabled (size {})", size);
            self.translation_size = Some(size);
        }
        self.header_read = true;
        Ok(())
    }

    fn read_block_header(&mut self, reader: &mut BitReader) -> Result<Block> {
        if self.pending_pad {
            reader.take_bytes(1);
            self.pending_pad = false;
        }
        let kind = BlockKind::from_bits(reader.read_bits(3)?)?;
        let high = reader.read_bits(16)? as usize;
        let low = reader.read_bits(8)? as usize;
        let size = (high << 8) | low;
        trace!("LZX {:?} block of {} bytes", kind, size);
        match kind {
            BlockKind::AlignedOffset => {
                let mut lengths = [0u8; ALIGNED_TREE_SIZE];
                for length in lengths.iter_mut() {
                    *length = reader.read_bits(3)? as u8;
                }
                self.aligned_tree =
                    HuffmanTable::new(&lengths, ALIGNED_TABLE_BITS)?;
                self.read_trees(reader)?;
            }
            BlockKind::Verbatim => self.read_trees(reader)?,
            BlockKind::Uncompressed => {
                // The encoder always pads with 1-16 bits here.
                if reader.is_word_aligned() {
                    reader.consume_bits(16)?;
                }
                reader.align_to_bytes();
                let r0 = reader.read_u32_le()?;
                let r1 = reader.read_u32_le()?;
                let r2 = reader.read_u32_le()?;
                self.offsets = RepeatedOffsets { r: [r0, r1, r2] };
            }
        }
        Ok(Block { kind, size, remaining: size })
    }

    fn read_trees(&mut self, reader: &mut BitReader) -> Result<()> {
        read_delta_lengths(reader, &mut self.main_lengths[..NUM_CHARS])?;
        read_delta_lengths(reader, &mut self.main_lengths[NUM_CHARS..])?;
        self.main_tree = HuffmanTable::new(&self.main_lengths, MAIN_TABLE_BITS)?;
        read_delta_lengths(reader, &mut self.length_lengths)?;
        self.length_tree =
            HuffmanTable::new(&self.length_lengths, LENGTH_TABLE_BITS)?;
        Ok(())
    }

    /// Decodes exactly `len` bytes into the window.  The run never crosses a
    /// frame boundary.
    fn decode_run(&mut self, reader: &mut BitReader, len: usize) -> Result<()> {
        let mut todo = len;
        while todo > 0 {
            let mut block = match self.block {
                Some(block) if block.remaining > 0 => block,
                _ => self.read_block_header(reader)?,
            };
            let run = block.remaining.min(todo);
            match block.kind {
                BlockKind::Uncompressed => {
                    let mut left = run;
                    while left > 0 {
                        let bytes = reader.take_bytes(left);
                        if bytes.is_empty() {
                            return Err(Error::TruncatedStream);
                        }
                        self.window.push_slice(bytes);
                        left -= bytes.len();
                    }
                }
                BlockKind::Verbatim | BlockKind::AlignedOffset => {
                    let mut left = run;
                    while left > 0 {
                        match self.decode_token(reader, block.kind)? {
                            Token::Literal(byte) => {
                                self.window.push(byte);
                                left -= 1;
                            }
                            Token::Match { length, distance } => {
                                if length > left {
                                    corrupt!(
                                        "match of {} bytes overruns the \
                                         {} bytes left in the frame or block",
                                        length,
                                        left
                                    );
                                }
                                self.window.copy_match(distance, length)?;
                                left -= length;
                            }
                        }
                    }
                }
            }
            block.remaining -= run;
            todo -= run;
            if block.remaining == 0
                && block.kind == BlockKind::Uncompressed
                && block.size % 2 == 1
            {
                self.pending_pad = true;
            }
            self.block = Some(block);
        }
        Ok(())
    }

    fn decode_token(
        &mut self,
        reader: &mut BitReader,
        kind: BlockKind,
    ) -> Result<Token> {
        let symbol = self.main_tree.decode(reader)? as usize;
        if symbol < NUM_CHARS {
            return Ok(Token::Literal(symbol as u8));
        }
        let symbol = symbol - NUM_CHARS;
        let mut length = symbol & 7;
        if length == NUM_PRIMARY_LENGTHS {
            length += self.length_tree.decode(reader)? as usize;
        }
        let length = length + MIN_MATCH;

        let slot = symbol >> 3;
        let distance = match slot {
            0..=2 => self.offsets.reuse(slot),
            _ => {
                let extra = extra_bits(slot);
                let footer = if kind == BlockKind::AlignedOffset && extra >= 3
                {
                    let verbatim = reader.read_bits(extra - 3)? << 3;
                    verbatim + self.aligned_tree.decode(reader)? as u32
                } else {
                    reader.read_bits(extra)?
                };
                let distance = POSITION_BASE[slot] - 2 + footer;
                self.offsets.push(distance);
                distance
            }
        };
        Ok(Token::Match { length, distance })
    }
}

// ========================================================================= //
