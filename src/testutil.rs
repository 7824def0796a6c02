//! Helpers for building LZX streams and cabinet files in unit tests.

use crate::checksum::data_block_checksum;
use crate::huffman::canonical_codes;
use crate::lzx::{
    extra_bits, main_tree_size, ALIGNED_TREE_SIZE, FRAME_SIZE,
    LENGTH_TREE_SIZE, POSITION_BASE,
};

/// Writes bits into 16-bit little-endian words, most significant bit first.
pub struct BitWriter {
    out: Vec<u8>,
    buffer: u32,
    bits: u32,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter { out: Vec::new(), buffer: 0, bits: 0 }
    }

    pub fn write_bits(&mut self, value: u32, n: u32) {
        if n > 16 {
            self.write_bits(value >> 16, n - 16);
            self.write_bits(value & 0xffff, 16);
            return;
        }
        if n == 0 {
            return;
        }
        self.buffer = (self.buffer << n) | (value & ((1 << n) - 1));
        self.bits += n;
        if self.bits >= 16 {
            self.bits -= 16;
            let word = (self.buffer >> self.bits) as u16;
            self.out.extend_from_slice(&word.to_le_bytes());
            self.buffer &= (1 << self.bits) - 1;
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.bits == 0
    }

    pub fn align(&mut self) {
        if self.bits > 0 {
            self.write_bits(0, 16 - self.bits);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        assert!(self.is_aligned());
        self.out.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.out
    }
}

/// Returns lengths forming a complete code over `n` symbols (n >= 2), using
/// the two shortest possible lengths.
pub fn complete_lengths(n: usize) -> Vec<u8> {
    let long = n.next_power_of_two().trailing_zeros() as u8;
    let num_short = (1usize << long) - n;
    (0..n).map(|i| if i < num_short { long - 1 } else { long }).collect()
}

/// Writes a pretree and the deltas that turn `previous` into `target`.
pub fn write_delta_lengths(
    writer: &mut BitWriter,
    target: &[u8],
    previous: &[u8],
) {
    let pretree = complete_lengths(20);
    for &length in &pretree {
        writer.write_bits(length as u32, 4);
    }
    let codes = canonical_codes(&pretree);
    for (&new, &old) in target.iter().zip(previous.iter()) {
        let symbol = ((old as usize + 17 - new as usize) % 17) as usize;
        writer.write_bits(codes[symbol], pretree[symbol] as u32);
    }
}

// ========================================================================= //

#[derive(Clone, Copy, Debug)]
pub enum LzxToken {
    Literal(u8),
    /// A match with an explicitly coded distance.
    Match { length: usize, distance: u32 },
    /// A match reusing repeated-offset slot 0, 1 or 2.
    Repeat { length: usize, slot: usize },
}

impl LzxToken {
    fn len(&self) -> usize {
        match *self {
            LzxToken::Literal(_) => 1,
            LzxToken::Match { length, .. } => length,
            LzxToken::Repeat { length, .. } => length,
        }
    }
}

/// Produces LZX streams, with the bitstream padded at every frame boundary
/// the way a cabinet encoder does.
pub struct LzxWriter {
    window_bits: u8,
    bits: BitWriter,
    main_lengths: Vec<u8>,
    length_lengths: Vec<u8>,
    produced: usize,
    splits: Vec<usize>,
}

impl LzxWriter {
    pub fn new(window_bits: u8) -> LzxWriter {
        let mut writer = LzxWriter::bare(window_bits);
        writer.bits.write_bits(0, 1);
        writer
    }

    pub fn with_translation(window_bits: u8, size: u32) -> LzxWriter {
        let mut writer = LzxWriter::bare(window_bits);
        writer.bits.write_bits(1, 1);
        writer.bits.write_bits(size, 32);
        writer
    }

    fn bare(window_bits: u8) -> LzxWriter {
        LzxWriter {
            window_bits,
            bits: BitWriter::new(),
            main_lengths: vec![0; main_tree_size(window_bits)],
            length_lengths: vec![0; LENGTH_TREE_SIZE],
            produced: 0,
            splits: Vec::new(),
        }
    }

    pub fn raw_block_header(&mut self, kind: u32, size: usize) {
        self.bits.write_bits(kind, 3);
        self.bits.write_bits((size >> 8) as u32, 16);
        self.bits.write_bits((size & 0xff) as u32, 8);
    }

    pub fn verbatim_block(&mut self, tokens: &[LzxToken]) {
        self.compressed_block(tokens, false);
    }

    pub fn aligned_block(&mut self, tokens: &[LzxToken]) {
        self.compressed_block(tokens, true);
    }

    fn compressed_block(&mut self, tokens: &[LzxToken], aligned: bool) {
        let size: usize = tokens.iter().map(LzxToken::len).sum();
        self.raw_block_header(if aligned { 2 } else { 1 }, size);
        let aligned_lengths = [3u8; ALIGNED_TREE_SIZE];
        if aligned {
            for &length in &aligned_lengths {
                self.bits.write_bits(length as u32, 3);
            }
        }
        let main = complete_lengths(main_tree_size(self.window_bits));
        let lengths = complete_lengths(LENGTH_TREE_SIZE);
        write_delta_lengths(&mut self.bits, &main[..256], &self.main_lengths[..256]);
        write_delta_lengths(&mut self.bits, &main[256..], &self.main_lengths[256..]);
        write_delta_lengths(&mut self.bits, &lengths, &self.length_lengths);
        let main_codes = canonical_codes(&main);
        let length_codes = canonical_codes(&lengths);

        for token in tokens {
            let (slot, length) = match *token {
                LzxToken::Literal(byte) => {
                    let symbol = byte as usize;
                    self.bits.write_bits(main_codes[symbol], main[symbol] as u32);
                    self.advance(1);
                    continue;
                }
                LzxToken::Match { length, distance } => {
                    let formatted = distance + 2;
                    let slot = (3..POSITION_BASE.len() - 1)
                        .find(|&slot| POSITION_BASE[slot + 1] > formatted)
                        .expect("distance too large");
                    (slot, length)
                }
                LzxToken::Repeat { length, slot } => (slot, length),
            };
            let header = (length - 2).min(7);
            let symbol = 256 + slot * 8 + header;
            self.bits.write_bits(main_codes[symbol], main[symbol] as u32);
            if header == 7 {
                let symbol = length - 2 - 7;
                self.bits.write_bits(length_codes[symbol], lengths[symbol] as u32);
            }
            if let LzxToken::Match { distance, .. } = *token {
                let footer = distance + 2 - POSITION_BASE[slot];
                let extra = extra_bits(slot);
                if aligned && extra >= 3 {
                    self.bits.write_bits(footer >> 3, extra - 3);
                    // All aligned codes are three bits long, so each symbol
                    // is its own code.
                    self.bits.write_bits(footer & 7, 3);
                } else {
                    self.bits.write_bits(footer, extra);
                }
            }
            self.advance(length);
        }
        self.main_lengths = main;
        self.length_lengths = lengths;
    }

    pub fn uncompressed_block(&mut self, data: &[u8], offsets: [u32; 3]) {
        self.raw_block_header(3, data.len());
        if self.bits.is_aligned() {
            self.bits.write_bits(0, 16);
        } else {
            self.bits.align();
        }
        for offset in offsets {
            self.bits.write_bytes(&offset.to_le_bytes());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let room = FRAME_SIZE - self.produced % FRAME_SIZE;
            let count = room.min(rest.len());
            self.bits.write_bytes(&rest[..count]);
            rest = &rest[count..];
            self.advance(count);
        }
        if data.len() % 2 == 1 {
            self.bits.write_bytes(&[0]);
        }
    }

    fn advance(&mut self, count: usize) {
        let before = self.produced / FRAME_SIZE;
        self.produced += count;
        if self.produced % FRAME_SIZE == 0 {
            self.bits.align();
            self.splits.push(self.bits.len());
        } else {
            assert_eq!(before, self.produced / FRAME_SIZE, "token crosses frame");
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.bits.finish()
    }

    /// Finishes the stream and splits it into one chunk per output frame.
    pub fn finish_frames(self) -> Vec<Vec<u8>> {
        let splits = self.splits.clone();
        let stream = self.bits.finish();
        let mut chunks = Vec::new();
        let mut start = 0;
        for split in splits {
            if split < stream.len() {
                chunks.push(stream[start..split].to_vec());
                start = split;
            }
        }
        chunks.push(stream[start..].to_vec());
        chunks
    }
}

/// Compresses `data` as literal-only verbatim blocks, one per frame.
pub fn lzx_literal_stream(window_bits: u8, data: &[u8]) -> Vec<Vec<u8>> {
    let mut writer = LzxWriter::new(window_bits);
    for frame in data.chunks(FRAME_SIZE) {
        let tokens: Vec<LzxToken> =
            frame.iter().map(|&byte| LzxToken::Literal(byte)).collect();
        writer.verbatim_block(&tokens);
    }
    writer.finish_frames()
}

// ========================================================================= //

pub fn lzx_ctype(window_bits: u8) -> u16 {
    3 | ((window_bits as u16) << 8)
}

pub struct TestBlock {
    pub data: Vec<u8>,
    pub uncompressed_size: u16,
    pub checksum: Option<u32>,
}

impl TestBlock {
    /// A block whose checksum will be computed when the cabinet is built.
    pub fn new(data: Vec<u8>, uncompressed_size: usize) -> TestBlock {
        TestBlock {
            data,
            uncompressed_size: uncompressed_size as u16,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: u32) -> TestBlock {
        self.checksum = Some(checksum);
        self
    }
}

pub struct TestFolder {
    pub ctype: u16,
    pub blocks: Vec<TestBlock>,
}

pub struct TestFile {
    pub name: String,
    pub folder: u16,
    pub offset: u32,
    pub size: u32,
    pub attributes: u16,
}

impl TestFile {
    pub fn new(name: &str, folder: u16, offset: u32, size: u32) -> TestFile {
        TestFile { name: name.to_string(), folder, offset, size, attributes: 0x20 }
    }
}

#[derive(Default)]
pub struct CabBuilder {
    pub folders: Vec<TestFolder>,
    pub files: Vec<TestFile>,
    pub set_id: u16,
    pub set_index: u16,
    pub prev: Option<(String, String)>,
    pub next: Option<(String, String)>,
    pub header_reserve: Vec<u8>,
    pub folder_reserve: u8,
    pub data_reserve: u8,
}

impl CabBuilder {
    pub fn new() -> CabBuilder {
        CabBuilder::default()
    }

    /// Adds an LZX folder whose chunks are the given frame-sized streams.
    pub fn lzx_folder(
        &mut self,
        window_bits: u8,
        chunks: Vec<Vec<u8>>,
        total_size: usize,
    ) -> u16 {
        let mut blocks = Vec::new();
        let mut left = total_size;
        for chunk in chunks {
            let size = left.min(FRAME_SIZE);
            left -= size;
            blocks.push(TestBlock::new(chunk, size));
        }
        self.folders.push(TestFolder { ctype: lzx_ctype(window_bits), blocks });
        (self.folders.len() - 1) as u16
    }

    pub fn file(&mut self, name: &str, folder: u16, offset: u32, size: u32) {
        self.files.push(TestFile::new(name, folder, offset, size));
    }

    pub fn build(&self) -> Vec<u8> {
        let has_reserve = !self.header_reserve.is_empty()
            || self.folder_reserve > 0
            || self.data_reserve > 0;
        let mut flags = 0u16;
        let mut names = Vec::new();
        if let Some((cabinet, disk)) = &self.prev {
            flags |= 0x1;
            push_string(&mut names, cabinet);
            push_string(&mut names, disk);
        }
        if let Some((cabinet, disk)) = &self.next {
            flags |= 0x2;
            push_string(&mut names, cabinet);
            push_string(&mut names, disk);
        }
        if has_reserve {
            flags |= 0x4;
        }
        let header_len = 36
            + if has_reserve { 4 + self.header_reserve.len() } else { 0 }
            + names.len();
        let folders_len =
            self.folders.len() * (8 + self.folder_reserve as usize);
        let files_len: usize =
            self.files.iter().map(|file| 17 + file.name.len()).sum();
        let mut data_offset = header_len + folders_len + files_len;
        let mut folder_offsets = Vec::new();
        for folder in &self.folders {
            folder_offsets.push(data_offset);
            for block in &folder.blocks {
                data_offset += 8 + self.data_reserve as usize + block.data.len();
            }
        }
        let total_len = data_offset;

        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(b"MSCF");
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(total_len as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&((header_len + folders_len) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&[3, 1]);
        out.extend_from_slice(&(self.folders.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.files.len() as u16).to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.set_id.to_le_bytes());
        out.extend_from_slice(&self.set_index.to_le_bytes());
        if has_reserve {
            out.extend_from_slice(&(self.header_reserve.len() as u16).to_le_bytes());
            out.push(self.folder_reserve);
            out.push(self.data_reserve);
            out.extend_from_slice(&self.header_reserve);
        }
        out.extend_from_slice(&names);
        for (folder, &offset) in self.folders.iter().zip(folder_offsets.iter()) {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(folder.blocks.len() as u16).to_le_bytes());
            out.extend_from_slice(&folder.ctype.to_le_bytes());
            out.extend(std::iter::repeat(0xf0).take(self.folder_reserve as usize));
        }
        for file in &self.files {
            out.extend_from_slice(&file.size.to_le_bytes());
            out.extend_from_slice(&file.offset.to_le_bytes());
            out.extend_from_slice(&file.folder.to_le_bytes());
            out.extend_from_slice(&0x226cu16.to_le_bytes()); // 1997-03-12
            out.extend_from_slice(&0x59bau16.to_le_bytes()); // 11:13:52
            out.extend_from_slice(&file.attributes.to_le_bytes());
            push_string(&mut out, &file.name);
        }
        let reserve = vec![0xd0u8; self.data_reserve as usize];
        for folder in &self.folders {
            for block in &folder.blocks {
                let compressed_size = block.data.len() as u16;
                let checksum = block.checksum.unwrap_or_else(|| {
                    data_block_checksum(
                        &block.data,
                        compressed_size,
                        block.uncompressed_size,
                        &reserve,
                    )
                });
                out.extend_from_slice(&checksum.to_le_bytes());
                out.extend_from_slice(&compressed_size.to_le_bytes());
                out.extend_from_slice(&block.uncompressed_size.to_le_bytes());
                out.extend_from_slice(&reserve);
                out.extend_from_slice(&block.data);
            }
        }
        assert_eq!(out.len(), total_len);
        out
    }
}

fn push_string(out: &mut Vec<u8>, string: &str) {
    out.extend_from_slice(string.as_bytes());
    out.push(0);
}
