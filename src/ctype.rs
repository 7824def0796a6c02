use crate::error::Result;
use crate::lzx::{LzxParams, MAX_WINDOW_BITS, MIN_WINDOW_BITS};

const CTYPE_NONE: u16 = 0;
const CTYPE_MSZIP: u16 = 1;
const CTYPE_QUANTUM: u16 = 2;
const CTYPE_LZX: u16 = 3;

/// A scheme for compressing data within the cabinet.
///
/// Only [`CompressionType::Lzx`] folders can be decoded; folders of any other
/// type are still listed, but decoding them fails with
/// [`Error::UnsupportedMethod`](crate::Error::UnsupportedMethod).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression.
    None,
    /// MSZIP compression.
    MsZip,
    /// Quantum compression with the given level and memory.
    Quantum(u16, u16),
    /// LZX compression with the given window exponent (15-21).  The LZX
    /// compression scheme is described further in
    /// [MS-PATCH](https://msdn.microsoft.com/en-us/library/cc483133.aspx).
    Lzx(u8),
    /// A method identifier this crate does not know about.
    Other(u16),
}

impl CompressionType {
    pub(crate) fn from_bitfield(bits: u16) -> Result<CompressionType> {
        match bits & 0x000f {
            CTYPE_NONE => Ok(CompressionType::None),
            CTYPE_MSZIP => Ok(CompressionType::MsZip),
            CTYPE_QUANTUM => {
                let level = (bits & 0x00f0) >> 4;
                let memory = (bits & 0x1f00) >> 8;
                Ok(CompressionType::Quantum(level, memory))
            }
            CTYPE_LZX => {
                let window = ((bits & 0x1f00) >> 8) as u8;
                if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&window) {
                    format_error!("Invalid LZX window: 0x{:02x}", window);
                }
                Ok(CompressionType::Lzx(window))
            }
            _ => Ok(CompressionType::Other(bits)),
        }
    }

    /// Returns the LZX parameters for this folder, or `None` if the folder
    /// is not LZX-compressed.
    pub fn lzx_params(&self) -> Option<LzxParams> {
        match *self {
            CompressionType::Lzx(window_bits) => {
                Some(LzxParams::new(window_bits))
            }
            _ => None,
        }
    }
}
