//! Canonical Huffman decoding tables.
//!
//! LZX transmits each tree as an array of code lengths.  Codes are assigned
//! canonically: symbols are ordered by (length, symbol index) and receive
//! consecutive code values within each length.  A table is decoded with a
//! direct lookup of `table_bits` bits, falling back to the per-length
//! canonical ranges for longer codes.

use crate::bits::BitReader;
use crate::error::{Error, Result};

/// Longest code length LZX allows in any tree.
pub const MAX_CODE_LENGTH: usize = 16;

/// Number of symbols in the pretree used to send code-length deltas.
pub const PRETREE_SIZE: usize = 20;
const PRETREE_TABLE_BITS: u32 = 6;

// Pretree symbols with special meaning:
const PRETREE_SHORT_ZERO_RUN: u16 = 17;
const PRETREE_LONG_ZERO_RUN: u16 = 18;
const PRETREE_SAME_RUN: u16 = 19;

/// A canonical Huffman decoding table.
#[derive(Clone, Debug)]
pub struct HuffmanTable {
    table_bits: u32,
    /// `(symbol, length)` for every code of at most `table_bits` bits; a
    /// length of zero marks an index that needs the slow path.
    fast: Vec<(u16, u8)>,
    first_code: [u32; MAX_CODE_LENGTH + 1],
    counts: [u16; MAX_CODE_LENGTH + 1],
    offsets: [u16; MAX_CODE_LENGTH + 1],
    sorted: Vec<u16>,
}

impl HuffmanTable {
    /// Returns a table with no symbols.  Decoding from it always fails.
    pub fn empty() -> HuffmanTable {
        HuffmanTable {
            table_bits: 0,
            fast: Vec::new(),
            first_code: [0; MAX_CODE_LENGTH + 1],
            counts: [0; MAX_CODE_LENGTH + 1],
            offsets: [0; MAX_CODE_LENGTH + 1],
            sorted: Vec::new(),
        }
    }

    /// Builds a table from per-symbol code lengths.
    ///
    /// The lengths must describe a complete prefix code, unless they are all
    /// zero, in which case an empty table is returned.
    pub fn new(lengths: &[u8], table_bits: u32) -> Result<HuffmanTable> {
        debug_assert!(table_bits as usize <= MAX_CODE_LENGTH);
        let mut counts = [0u16; MAX_CODE_LENGTH + 1];
        for &length in lengths {
            let length = length as usize;
            if length > MAX_CODE_LENGTH {
                return Err(Error::InvalidHuffmanTable(format!(
                    "code length {} exceeds maximum of {}",
                    length, MAX_CODE_LENGTH
                )));
            }
            counts[length] += 1;
        }
        counts[0] = 0;
        if counts.iter().all(|&count| count == 0) {
            return Ok(HuffmanTable::empty());
        }

        let mut space: u32 = 0;
        for (length, &count) in counts.iter().enumerate().skip(1) {
            space += (count as u32) << (MAX_CODE_LENGTH - length);
        }
        if space > 1 << MAX_CODE_LENGTH {
            return Err(Error::InvalidHuffmanTable(
                "code lengths are over-subscribed".to_string(),
            ));
        } else if space < 1 << MAX_CODE_LENGTH {
            return Err(Error::InvalidHuffmanTable(
                "code lengths are incomplete".to_string(),
            ));
        }

        let first_code = first_codes(&counts);
        let mut offsets = [0u16; MAX_CODE_LENGTH + 1];
        for length in 1..MAX_CODE_LENGTH {
            offsets[length + 1] = offsets[length] + counts[length];
        }
        let mut sorted = vec![0u16; lengths.len()];
        let mut next = offsets;
        for (symbol, &length) in lengths.iter().enumerate() {
            if length > 0 {
                sorted[next[length as usize] as usize] = symbol as u16;
                next[length as usize] += 1;
            }
        }
        sorted.truncate(next[MAX_CODE_LENGTH] as usize);

        let mut fast = vec![(0u16, 0u8); 1 << table_bits];
        let codes = canonical_codes(lengths);
        for (symbol, (&length, &code)) in
            lengths.iter().zip(codes.iter()).enumerate()
        {
            let length = length as u32;
            if length == 0 || length > table_bits {
                continue;
            }
            let start = (code << (table_bits - length)) as usize;
            let span = 1usize << (table_bits - length);
            for entry in &mut fast[start..start + span] {
                *entry = (symbol as u16, length as u8);
            }
        }

        Ok(HuffmanTable { table_bits, fast, first_code, counts, offsets, sorted })
    }

    /// Returns true if this table has no symbols.
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Decodes one symbol from the bitstream.
    pub fn decode(&self, reader: &mut BitReader) -> Result<u16> {
        if self.is_empty() {
            return Err(Error::InvalidHuffmanTable(
                "symbol decoded from an empty table".to_string(),
            ));
        }
        let peek = reader.peek_bits(MAX_CODE_LENGTH as u32);
        let index = (peek >> (MAX_CODE_LENGTH as u32 - self.table_bits)) as usize;
        let (symbol, length) = self.fast[index];
        if length > 0 {
            reader.consume_bits(length as u32)?;
            return Ok(symbol);
        }
        for length in (self.table_bits as usize + 1)..=MAX_CODE_LENGTH {
            let code = peek >> (MAX_CODE_LENGTH - length);
            let first = self.first_code[length];
            if code >= first && code - first < self.counts[length] as u32 {
                reader.consume_bits(length as u32)?;
                let index = self.offsets[length] as u32 + (code - first);
                return Ok(self.sorted[index as usize]);
            }
        }
        Err(Error::InvalidHuffmanTable("no code matches input".to_string()))
    }
}

fn first_codes(counts: &[u16; MAX_CODE_LENGTH + 1]) -> [u32; MAX_CODE_LENGTH + 1] {
    let mut first_code = [0u32; MAX_CODE_LENGTH + 1];
    let mut code = 0u32;
    for length in 1..=MAX_CODE_LENGTH {
        code = (code + counts[length - 1] as u32) << 1;
        first_code[length] = code;
    }
    first_code
}

/// Assigns canonical code values to each symbol.  Symbols with a length of
/// zero get a code of zero.
pub fn canonical_codes(lengths: &[u8]) -> Vec<u32> {
    let mut counts = [0u16; MAX_CODE_LENGTH + 1];
    for &length in lengths {
        counts[(length as usize).min(MAX_CODE_LENGTH)] += 1;
    }
    counts[0] = 0;
    let mut next = first_codes(&counts);
    lengths
        .iter()
        .map(|&length| {
            if length == 0 {
                return 0;
            }
            let code = next[length as usize];
            next[length as usize] += 1;
            code
        })
        .collect()
}

/// Reads a pretree followed by delta-coded updates to `lengths`.
///
/// Each pretree symbol 0-16 replaces a length `x` with `(x - symbol) mod 17`.
/// Symbol 17 writes a run of 4-19 zeros, symbol 18 a run of 20-51 zeros, and
/// symbol 19 a run of 4-5 copies of one delta-coded length.
pub fn read_delta_lengths(
    reader: &mut BitReader,
    lengths: &mut [u8],
) -> Result<()> {
    let mut pretree_lengths = [0u8; PRETREE_SIZE];
    for length in pretree_lengths.iter_mut() {
        *length = reader.read_bits(4)? as u8;
    }
    let pretree = HuffmanTable::new(&pretree_lengths, PRETREE_TABLE_BITS)?;
    let mut index = 0;
    while index < lengths.len() {
        match pretree.decode(reader)? {
            PRETREE_SHORT_ZERO_RUN => {
                let run = 4 + reader.read_bits(4)? as usize;
                fill_run(lengths, &mut index, run, 0)?;
            }
            PRETREE_LONG_ZERO_RUN => {
                let run = 20 + reader.read_bits(5)? as usize;
                fill_run(lengths, &mut index, run, 0)?;
            }
            PRETREE_SAME_RUN => {
                let run = 4 + reader.read_bits(1)? as usize;
                let delta = pretree.decode(reader)?;
                if delta > 16 {
                    return Err(Error::InvalidHuffmanTable(format!(
                        "pretree symbol {} cannot follow a repeat code",
                        delta
                    )));
                }
                let value = apply_delta(lengths[index], delta);
                fill_run(lengths, &mut index, run, value)?;
            }
            delta => {
                lengths[index] = apply_delta(lengths[index], delta);
                index += 1;
            }
        }
    }
    Ok(())
}

fn apply_delta(previous: u8, delta: u16) -> u8 {
    ((previous as u16 + 17 - delta) % 17) as u8
}

fn fill_run(
    lengths: &mut [u8],
    index: &mut usize,
    run: usize,
    value: u8,
) -> Result<()> {
    if *index + run > lengths.len() {
        return Err(Error::InvalidHuffmanTable(format!(
            "run of {} lengths overflows the table at {} of {}",
            run,
            *index,
            lengths.len()
        )));
    }
    for length in &mut lengths[*index..*index + run] {
        *length = value;
    }
    *index += run;
    Ok(())
}
