//! Undoing the x86 call translation ("E8 preprocessing") that LZX encoders
//! apply to executables.
//!
//! The encoder replaces the relative displacement after each `0xE8` (CALL)
//! opcode with an absolute target, which makes repeated calls to the same
//! function compress better.  The decoder reverses this per output frame.

/// Frames starting at or beyond this stream offset are never translated.
pub const TRANSLATION_LIMIT: u64 = 0x4000_0000;

/// Trailing bytes of each frame that are never scanned for opcodes.
const FRAME_TAIL: usize = 10;

const CALL_OPCODE: u8 = 0xe8;

/// Converts absolute call targets in one decoded frame back into relative
/// displacements.  `frame_start` is the frame's offset within the folder
/// stream; `translation_size` comes from the LZX stream header.
pub fn translate_frame(
    frame: &mut [u8],
    frame_start: u64,
    translation_size: u32,
) {
    if translation_size == 0
        || frame.len() <= FRAME_TAIL
        || frame_start >= TRANSLATION_LIMIT
    {
        return;
    }
    let size = translation_size as i32 as i64;
    let end = frame.len() - FRAME_TAIL;
    let mut index = 0;
    while index < end {
        if frame[index] != CALL_OPCODE {
            index += 1;
            continue;
        }
        let current = (frame_start + index as u64) as i64;
        let operand = &mut frame[index + 1..index + 5];
        let absolute =
            i32::from_le_bytes([operand[0], operand[1], operand[2], operand[3]])
                as i64;
        if absolute >= -current && absolute < size {
            let relative = if absolute >= 0 {
                absolute - current
            } else {
                absolute + size
            };
            operand.copy_from_slice(&(relative as i32).to_le_bytes());
        }
        index += 5;
    }
}
