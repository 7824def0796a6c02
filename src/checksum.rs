use std::convert::TryInto;

/// Computes the cabinet checksum of `data`, starting from `seed`.
///
/// Whole 32-bit little-endian words are XORed together; the one to three
/// trailing bytes are folded in with the first of them as the most
/// significant byte.
pub fn checksum(data: &[u8], seed: u32) -> u32 {
    let mut value = seed;
    let mut words = data.chunks_exact(4);
    for word in &mut words {
        value ^= u32::from_le_bytes(word.try_into().unwrap_or([0; 4]));
    }
    let tail = words
        .remainder()
        .iter()
        .fold(0u32, |tail, &byte| (tail << 8) | byte as u32);
    value ^ tail
}

/// Computes the checksum stored in a data block header: the checksum of
/// the compressed bytes, used as the seed for the checksum of the block's
/// size fields and reserve data.
pub fn data_block_checksum(
    compressed: &[u8],
    compressed_size: u16,
    uncompressed_size: u16,
    reserve: &[u8],
) -> u32 {
    let payload = checksum(compressed, 0);
    let mut header = Vec::with_capacity(4 + reserve.len());
    header.extend_from_slice(&compressed_size.to_le_bytes());
    header.extend_from_slice(&uncompressed_size.to_le_bytes());
    header.extend_from_slice(reserve);
    checksum(&header, payload)
}
