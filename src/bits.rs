use crate::error::{Error, Result};

/// Reads the LZX bitstream: 16-bit little-endian words whose bits are
/// consumed most-significant first.
///
/// Peeking past the end of the input yields zero bits, which lets Huffman
/// lookups near the end of a stream inspect a full table index; actually
/// consuming those padding bits fails with `TruncatedStream`.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buffer: u32,
    bits: u32,
    padding: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, pos: 0, buffer: 0, bits: 0, padding: 0 }
    }

    fn refill(&mut self) {
        while self.bits <= 16 {
            let word = if self.pos + 2 <= self.data.len() {
                let word = u16::from_le_bytes([
                    self.data[self.pos],
                    self.data[self.pos + 1],
                ]);
                self.pos += 2;
                word
            } else {
                self.padding += 16;
                0
            };
            self.buffer |= (word as u32) << (16 - self.bits);
            self.bits += 16;
        }
    }

    /// Returns the next `n` bits (at most 16) without consuming them.
    pub fn peek_bits(&mut self, n: u32) -> u32 {
        debug_assert!(n <= 16);
        if n == 0 {
            return 0;
        }
        if self.bits < n {
            self.refill();
        }
        self.buffer >> (32 - n)
    }

    /// Discards the next `n` bits (at most 16).
    pub fn consume_bits(&mut self, n: u32) -> Result<()> {
        debug_assert!(n <= 16);
        if n == 0 {
            return Ok(());
        }
        if self.bits < n {
            self.refill();
        }
        if n > self.bits - self.padding {
            return Err(Error::TruncatedStream);
        }
        self.buffer <<= n;
        self.bits -= n;
        Ok(())
    }

    /// Reads and consumes the next `n` bits (at most 32).
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        if n > 16 {
            let high = self.read_bits(n - 16)?;
            let low = self.read_bits(16)?;
            return Ok((high << 16) | low);
        }
        let value = self.peek_bits(n);
        self.consume_bits(n)?;
        Ok(value)
    }

    /// Returns true if no bits of a partially consumed word are pending.
    pub fn is_word_aligned(&self) -> bool {
        self.bits % 16 == 0
    }

    /// Discards the unconsumed bits of the current 16-bit word.
    pub fn align_to_word(&mut self) {
        let partial = self.bits % 16;
        self.buffer <<= partial;
        self.bits -= partial;
    }

    /// Switches from bit mode to byte mode: aligns to a word boundary and
    /// hands any whole words already buffered back to the byte cursor.
    pub fn align_to_bytes(&mut self) {
        self.align_to_word();
        let buffered_bytes = ((self.bits - self.padding) / 8) as usize;
        self.pos -= buffered_bytes;
        self.buffer = 0;
        self.bits = 0;
        self.padding = 0;
    }

    /// Returns up to `max` raw bytes from the input in byte mode.
    pub fn take_bytes(&mut self, max: usize) -> &'a [u8] {
        debug_assert_eq!(self.bits, 0);
        let count = max.min(self.data.len() - self.pos);
        let bytes = &self.data[self.pos..self.pos + count];
        self.pos += count;
        bytes
    }

    /// Reads a little-endian `u32` in byte mode.
    pub fn read_u32_le(&mut self) -> Result<u32> {
        let bytes = self.take_bytes(4);
        if bytes.len() < 4 {
            return Err(Error::TruncatedStream);
        }
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Returns the number of input bytes not yet consumed.
    pub fn bytes_remaining(&self) -> usize {
        (self.data.len() - self.pos) + ((self.bits - self.padding) / 8) as usize
    }
}
