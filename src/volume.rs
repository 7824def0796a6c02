use std::io::{Read, Seek};

use tracing::debug;

use crate::assemble::slice_file;
use crate::cabinet::Cabinet;
use crate::error::{Error, Result};
use crate::file::FileEntry;
use crate::folder::{verify_block, CancelToken, FolderDecoder, RawBlock};
use crate::options::{ChecksumPolicy, ExtractOptions};

/// The cabinets of a multi-volume set, ordered by their set index.
///
/// A folder may begin in one cabinet and continue into the next; the set
/// links these pieces so that they decode as a single stream.
pub struct CabinetSet<R> {
    volumes: Vec<Cabinet<R>>,
    options: ExtractOptions,
}

/// One cabinet's piece of a logical folder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FolderPiece {
    volume: usize,
    folder: usize,
}

impl<R: Read + Seek> CabinetSet<R> {
    /// Links the given cabinets into a set, using the default options.
    ///
    /// The cabinets may be supplied in any order, and volumes may be
    /// missing; files that need a missing volume fail with
    /// [`Error::MissingVolume`] when extracted.
    pub fn new(volumes: Vec<Cabinet<R>>) -> Result<CabinetSet<R>> {
        CabinetSet::with_options(volumes, ExtractOptions::default())
    }

    /// Links the given cabinets into a set.
    pub fn with_options(
        mut volumes: Vec<Cabinet<R>>,
        options: ExtractOptions,
    ) -> Result<CabinetSet<R>> {
        volumes.sort_by_key(|volume| volume.cabinet_set_index());
        if let Some(first) = volumes.first() {
            let set_id = first.cabinet_set_id();
            for volume in volumes.iter() {
                if volume.cabinet_set_id() != set_id {
                    format_error!(
                        "Cabinet set IDs do not match ({:#06x} and {:#06x})",
                        set_id,
                        volume.cabinet_set_id()
                    );
                }
            }
        }
        for pair in volumes.windows(2) {
            if pair[0].cabinet_set_index() == pair[1].cabinet_set_index() {
                format_error!(
                    "Two cabinets have the same set index {}",
                    pair[0].cabinet_set_index()
                );
            }
        }
        debug!("Linked {} cabinet volumes", volumes.len());
        Ok(CabinetSet { volumes, options })
    }

    /// Returns the cabinets of this set, ordered by set index.
    pub fn volumes(&self) -> &[Cabinet<R>] {
        &self.volumes
    }

    /// Returns every file in the set once.  Entries that merely repeat a
    /// file from an earlier volume of the set are skipped.
    pub fn file_entries(&self) -> impl Iterator<Item = &FileEntry> + '_ {
        self.volumes.iter().enumerate().flat_map(move |(position, volume)| {
            let has_prev = self.previous_volume(position).is_some();
            volume
                .file_entries()
                .filter(move |file| !(file.is_continued_from_prev() && has_prev))
        })
    }

    /// Returns the decompressed contents of the named file, decoding its
    /// folder across as many volumes as it spans.
    ///
    /// Under [`ChecksumPolicy::Warn`] a bad block is logged and decoded
    /// anyway.  Such blocks are not reported to the caller; use
    /// [`Cabinet::decode_folder_with`] on a single volume to get them.
    pub fn extract_file(&self, name: &str) -> Result<Vec<u8>> {
        let (volume, file) = self.find_file(name)?;
        let (pieces, truncated) = self.folder_pieces(volume, file)?;
        let first = pieces[0];
        let ctype = self.volumes[first.volume]
            .folder_info(first.folder)?
            .compression_type;
        for piece in pieces.iter() {
            let piece_ctype =
                self.volumes[piece.volume].folder_info(piece.folder)?.compression_type;
            if piece_ctype != ctype {
                format_error!(
                    "Spanned folder changes compression type from {:?} to {:?}",
                    ctype,
                    piece_ctype
                );
            }
        }
        debug!(
            "File {:?} lives in a folder spanning {} volume(s){}",
            name,
            pieces.len(),
            if truncated { ", some of them missing" } else { "" }
        );

        // Checksums are verified per piece before split blocks are joined,
        // so the decoder itself does not check them again.
        let decoder =
            FolderDecoder::new(first.folder, ctype, ChecksumPolicy::Ignore)?;
        let end = file.end_in_folder();
        let mut start = 0u64;
        let blocks: Vec<RawBlock> = self
            .joined_blocks(&pieces)?
            .into_iter()
            .take_while(|block| {
                let keep = start < end;
                start += block.header.uncompressed_size as u64;
                keep
            })
            .collect();
        let output =
            decoder.run(blocks.into_iter().map(Ok), end, &CancelToken::new())?;
        let part = slice_file(&output.data, 0, file);
        if part.missing_after {
            return Err(part.into_missing_volume(self.options.missing_volume));
        }
        Ok(part.data.to_vec())
    }

    /// Finds the earliest entry for the named file.
    fn find_file(&self, name: &str) -> Result<(usize, &FileEntry)> {
        self.volumes
            .iter()
            .enumerate()
            .find_map(|(position, volume)| {
                volume.get_file_entry(name).map(|file| (position, file))
            })
            .ok_or_else(|| {
                Error::NotFound(format!("No such file in cabinet set: {:?}", name))
            })
    }

    fn previous_volume(&self, position: usize) -> Option<usize> {
        let index = self.volumes[position].cabinet_set_index().checked_sub(1)?;
        self.volumes[..position]
            .iter()
            .rposition(|volume| volume.cabinet_set_index() == index)
    }

    fn next_volume(&self, position: usize) -> Option<usize> {
        let index = self.volumes[position].cabinet_set_index().checked_add(1)?;
        self.volumes
            .iter()
            .position(|volume| volume.cabinet_set_index() == index)
    }

    /// Collects the pieces of the logical folder holding `file`.  The flag
    /// is set when the folder continues into a volume that is not in the
    /// set.
    fn folder_pieces(
        &self,
        volume: usize,
        file: &FileEntry,
    ) -> Result<(Vec<FolderPiece>, bool)> {
        let mut pieces = vec![FolderPiece { volume, folder: file.folder }];
        loop {
            let piece = pieces[0];
            if piece.folder != 0 || !self.volumes[piece.volume].continues_from_prev()
            {
                break;
            }
            let prev = match self.previous_volume(piece.volume) {
                Some(prev) => prev,
                None => {
                    return Err(Error::MissingVolume {
                        name: file.name().to_string(),
                        partial: None,
                    })
                }
            };
            let folder = match self.volumes[prev].num_folders().checked_sub(1) {
                Some(folder) => folder,
                None => format_error!(
                    "Cabinet #{} continues into the next volume but has no \
                     folders",
                    self.volumes[prev].cabinet_set_index()
                ),
            };
            pieces.insert(0, FolderPiece { volume: prev, folder });
        }
        loop {
            let piece = pieces[pieces.len() - 1];
            let cabinet = &self.volumes[piece.volume];
            if piece.folder + 1 != cabinet.num_folders()
                || !cabinet.continues_to_next()
            {
                return Ok((pieces, false));
            }
            match self.next_volume(piece.volume) {
                Some(next)
                    if self.volumes[next].continues_from_prev()
                        && self.volumes[next].num_folders() > 0 =>
                {
                    pieces.push(FolderPiece { volume: next, folder: 0 });
                }
                _ => return Ok((pieces, true)),
            }
        }
    }

    /// Reads the data blocks of every piece, verifying each and joining
    /// blocks that were split across a volume boundary.
    fn joined_blocks(&self, pieces: &[FolderPiece]) -> Result<Vec<RawBlock>> {
        let policy = self.options.checksum;
        let mut blocks = Vec::new();
        let mut split: Option<RawBlock> = None;
        let mut index = 0;
        for piece in pieces {
            for block in self.volumes[piece.volume].read_raw_blocks(piece.folder)? {
                verify_block(index, &block.header, &block.data, policy)?;
                index += 1;
                let block = match split.take() {
                    Some(mut head) => {
                        // Only the payload matters from here on; the joined
                        // block carries no checksum to verify.
                        head.data.extend_from_slice(&block.data);
                        head.header.uncompressed_size =
                            block.header.uncompressed_size;
                        head.header.cumulative_size = block.header.cumulative_size;
                        head.header.checksum = 0;
                        head.header.reserve_data.clear();
                        head
                    }
                    None => block,
                };
                // The first half of a split block declares no output.
                if block.header.uncompressed_size == 0 {
                    split = Some(block);
                } else {
                    blocks.push(block);
                }
            }
        }
        Ok(blocks)
    }
}
