use std::io::Read;

use byteorder::ReadBytesExt;

use crate::consts;
use crate::error::Result;

/// Reads a NUL-terminated string of at most `MAX_STRING_SIZE` bytes.
///
/// Names flagged as UTF-8 that fail to decode are rejected; other names are
/// decoded lossily, since their code page is unknown.
pub(crate) fn read_null_terminated_string<R: Read>(
    reader: &mut R,
    is_utf8: bool,
) -> Result<String> {
    let mut bytes = Vec::<u8>::with_capacity(consts::MAX_STRING_SIZE);
    loop {
        let byte = reader.read_u8()?;
        if byte == 0 {
            break;
        } else if bytes.len() == consts::MAX_STRING_SIZE {
            format_error!(
                "String longer than maximum of {} bytes",
                consts::MAX_STRING_SIZE
            );
        }
        bytes.push(byte);
    }
    if is_utf8 {
        match String::from_utf8(bytes) {
            Ok(string) => Ok(string),
            Err(_) => format_error!("File name flagged as UTF-8 is not UTF-8"),
        }
    } else {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
