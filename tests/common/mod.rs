//! Builds cabinets for the integration tests.  Folders hold LZX streams made
//! of uncompressed blocks, one block per 32 KiB frame.

#![allow(dead_code)]

pub const FRAME_SIZE: usize = 0x8000;

struct BitWriter {
    out: Vec<u8>,
    buffer: u32,
    bits: u32,
}

impl BitWriter {
    fn new() -> BitWriter {
        BitWriter { out: Vec::new(), buffer: 0, bits: 0 }
    }

    fn put(&mut self, value: u32, n: u32) {
        for shift in (0..n).rev() {
            self.buffer = (self.buffer << 1) | ((value >> shift) & 1);
            self.bits += 1;
            if self.bits == 16 {
                self.out.extend_from_slice(&(self.buffer as u16).to_le_bytes());
                self.buffer = 0;
                self.bits = 0;
            }
        }
    }

    fn flush(&mut self) {
        if self.bits > 0 {
            self.put(0, 16 - self.bits);
        }
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

/// Applies the encoder side of the x86 call translation to one frame.
fn encode_calls(frame: &mut [u8], frame_start: usize, size: u32) {
    if frame.len() <= 10 {
        return;
    }
    let size = size as i64;
    let end = frame.len() - 10;
    let mut index = 0;
    while index < end {
        if frame[index] != 0xe8 {
            index += 1;
            continue;
        }
        let current = (frame_start + index) as i64;
        let operand = &mut frame[index + 1..index + 5];
        let relative =
            i32::from_le_bytes([operand[0], operand[1], operand[2], operand[3]])
                as i64;
        let absolute = if relative >= -current && relative < size - current {
            Some(relative + current)
        } else if relative >= size - current && relative < size {
            Some(relative - size)
        } else {
            None
        };
        if let Some(absolute) = absolute {
            operand.copy_from_slice(&(absolute as i32).to_le_bytes());
        }
        index += 5;
    }
}

/// Encodes `data` as an LZX stream of uncompressed blocks and returns one
/// chunk of compressed bytes per output frame.
pub fn stored_lzx(data: &[u8], translation: Option<u32>) -> Vec<Vec<u8>> {
    let mut writer = BitWriter::new();
    match translation {
        Some(size) => {
            writer.put(1, 1);
            writer.put(size >> 16, 16);
            writer.put(size & 0xffff, 16);
        }
        None => writer.put(0, 1),
    }
    let mut chunks = Vec::new();
    for (index, frame) in data.chunks(FRAME_SIZE).enumerate() {
        let mut frame = frame.to_vec();
        if let Some(size) = translation {
            encode_calls(&mut frame, index * FRAME_SIZE, size);
        }
        writer.put(3, 3);
        writer.put((frame.len() >> 8) as u32, 16);
        writer.put((frame.len() & 0xff) as u32, 8);
        writer.flush();
        let mut chunk = writer.take();
        for _ in 0..3 {
            chunk.extend_from_slice(&1u32.to_le_bytes());
        }
        chunk.extend_from_slice(&frame);
        if frame.len() % 2 == 1 {
            chunk.push(0);
        }
        chunks.push(chunk);
    }
    chunks
}

/// Computes the CAB checksum of one data block.
pub fn block_checksum(data: &[u8], uncompressed_size: u16) -> u32 {
    let fold = |bytes: &[u8], seed: u32| {
        let mut sum = seed;
        let mut words = bytes.chunks_exact(4);
        for word in &mut words {
            sum ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        }
        let mut rest = 0u32;
        for &byte in words.remainder() {
            rest = (rest << 8) | byte as u32;
        }
        sum ^ rest
    };
    let mut sizes = Vec::new();
    sizes.extend_from_slice(&(data.len() as u16).to_le_bytes());
    sizes.extend_from_slice(&uncompressed_size.to_le_bytes());
    fold(&sizes, fold(data, 0))
}

pub struct Block {
    pub data: Vec<u8>,
    pub uncompressed_size: u16,
    pub checksum: Option<u32>,
}

pub struct Folder {
    pub ctype: u16,
    pub blocks: Vec<Block>,
}

pub struct File {
    pub name: String,
    pub folder: u16,
    pub offset: u32,
    pub size: u32,
    pub date: u16,
    pub time: u16,
    pub attributes: u16,
}

/// A cabinet under construction.
#[derive(Default)]
pub struct TestCabinet {
    pub set_id: u16,
    pub set_index: u16,
    pub prev: Option<&'static str>,
    pub next: Option<&'static str>,
    pub folders: Vec<Folder>,
    pub files: Vec<File>,
}

impl TestCabinet {
    pub fn new() -> TestCabinet {
        TestCabinet::default()
    }

    /// Adds an LZX folder holding `data`, one data block per frame.
    pub fn lzx_folder(
        &mut self,
        window_bits: u8,
        data: &[u8],
        translation: Option<u32>,
    ) -> u16 {
        let blocks = stored_lzx(data, translation)
            .into_iter()
            .zip(data.chunks(FRAME_SIZE))
            .map(|(chunk, frame)| Block {
                data: chunk,
                uncompressed_size: frame.len() as u16,
                checksum: None,
            })
            .collect();
        self.raw_folder(3 | (window_bits as u16) << 8, blocks)
    }

    pub fn raw_folder(&mut self, ctype: u16, blocks: Vec<Block>) -> u16 {
        self.folders.push(Folder { ctype, blocks });
        (self.folders.len() - 1) as u16
    }

    pub fn file(&mut self, name: &str, folder: u16, offset: u32, size: u32) {
        self.files.push(File {
            name: name.to_string(),
            folder,
            offset,
            size,
            date: 0x4a85, // 2017-04-05
            time: 0x7a3a, // 15:17:52
            attributes: 0x20,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let mut names = Vec::new();
        let mut flags = 0u16;
        for (link, flag) in [(self.prev, 0x1), (self.next, 0x2)] {
            if let Some(name) = link {
                flags |= flag;
                names.extend_from_slice(name.as_bytes());
                names.push(0);
                names.extend_from_slice(b"DISK\0");
            }
        }
        let header_len = 36 + names.len();
        let files_offset = header_len + 8 * self.folders.len();
        let files_len: usize =
            self.files.iter().map(|file| 17 + file.name.len()).sum();
        let mut data_offset = files_offset + files_len;
        let mut folder_offsets = Vec::new();
        for folder in &self.folders {
            folder_offsets.push(data_offset);
            data_offset += folder
                .blocks
                .iter()
                .map(|block| 8 + block.data.len())
                .sum::<usize>();
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"MSCF\0\0\0\0");
        out.extend_from_slice(&(data_offset as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&(files_offset as u32).to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 3, 1]);
        out.extend_from_slice(&(self.folders.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.files.len() as u16).to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.set_id.to_le_bytes());
        out.extend_from_slice(&self.set_index.to_le_bytes());
        out.extend_from_slice(&names);
        for (folder, offset) in self.folders.iter().zip(folder_offsets) {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(folder.blocks.len() as u16).to_le_bytes());
            out.extend_from_slice(&folder.ctype.to_le_bytes());
        }
        for file in &self.files {
            out.extend_from_slice(&file.size.to_le_bytes());
            out.extend_from_slice(&file.offset.to_le_bytes());
            out.extend_from_slice(&file.folder.to_le_bytes());
            out.extend_from_slice(&file.date.to_le_bytes());
            out.extend_from_slice(&file.time.to_le_bytes());
            out.extend_from_slice(&file.attributes.to_le_bytes());
            out.extend_from_slice(file.name.as_bytes());
            out.push(0);
        }
        for folder in &self.folders {
            for block in &folder.blocks {
                let checksum = block.checksum.unwrap_or_else(|| {
                    block_checksum(&block.data, block.uncompressed_size)
                });
                out.extend_from_slice(&checksum.to_le_bytes());
                out.extend_from_slice(&(block.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&block.uncompressed_size.to_le_bytes());
                out.extend_from_slice(&block.data);
            }
        }
        assert_eq!(out.len(), data_offset);
        out
    }
}
