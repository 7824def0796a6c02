//! Slicing file extents out of decoded folder streams.

use tracing::warn;

use crate::error::Error;
use crate::file::FileEntry;
use crate::options::MissingVolumePolicy;

/// The part of one file that lies within a decoded folder stream.
#[derive(Clone, Debug)]
pub struct FilePart<'a> {
    /// The file this part belongs to.
    pub file: &'a FileEntry,
    /// The file's bytes that the stream covers.
    pub data: &'a [u8],
    /// True if the file begins before the start of the stream.
    pub missing_before: bool,
    /// True if the file ends after the end of the stream.
    pub missing_after: bool,
}

impl<'a> FilePart<'a> {
    /// Returns true if the stream covered the whole file.
    pub fn is_complete(&self) -> bool {
        !self.missing_before && !self.missing_after
    }

    /// Builds the error for an incomplete part, attaching the local bytes
    /// if the policy asks for them.
    pub(crate) fn into_missing_volume(self, policy: MissingVolumePolicy) -> Error {
        let name = self.file.name().to_string();
        let partial = match policy {
            MissingVolumePolicy::Fail => {
                warn!("File {:?} spans into a missing cabinet volume", name);
                None
            }
            MissingVolumePolicy::ReturnLocal => {
                warn!(
                    "File {:?} spans into a missing cabinet volume; \
                     returning {} of {} bytes",
                    name,
                    self.data.len(),
                    self.file.uncompressed_size()
                );
                Some(self.data.to_vec())
            }
        };
        Error::MissingVolume { name, partial }
    }
}

/// Slices `file` out of `stream`, where `stream_start` is the folder offset
/// of the stream's first byte.
pub fn slice_file<'a>(
    stream: &'a [u8],
    stream_start: u64,
    file: &'a FileEntry,
) -> FilePart<'a> {
    let stream_end = stream_start + stream.len() as u64;
    let file_start = file.uncompressed_offset() as u64;
    let file_end = file.end_in_folder();
    let start = file_start.clamp(stream_start, stream_end);
    let end = file_end.clamp(start, stream_end);
    FilePart {
        file,
        data: &stream
            [(start - stream_start) as usize..(end - stream_start) as usize],
        missing_before: file_start < stream_start,
        missing_after: file_end > stream_end,
    }
}

/// Slices every file in `files` out of `stream`, in order of folder offset.
pub fn slice_files<'a, I>(
    stream: &'a [u8],
    stream_start: u64,
    files: I,
) -> Vec<FilePart<'a>>
where
    I: IntoIterator<Item = &'a FileEntry>,
{
    let mut files: Vec<&FileEntry> = files.into_iter().collect();
    files.sort_by_key(|file| file.uncompressed_offset());
    files
        .into_iter()
        .map(|file| slice_file(stream, stream_start, file))
        .collect()
}
