use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use rayon::prelude::*;
use tracing::debug;

use crate::assemble::slice_file;
use crate::consts;
use crate::error::{Error, Result};
use crate::file::{parse_file_entry, FileEntries, FileEntry, FileReader};
use crate::folder::{
    parse_data_blocks, parse_folder_entry, CancelToken, DataBlock,
    FolderDecoder, FolderEntries, FolderInfo, FolderOutput, FolderReader,
    RawBlock,
};
use crate::options::ExtractOptions;
use crate::string::read_null_terminated_string;

/// The name of an adjacent cabinet in a multi-volume set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeLink {
    cabinet_name: String,
    disk_name: String,
}

impl VolumeLink {
    /// Returns the file name of the linked cabinet.
    pub fn cabinet_name(&self) -> &str {
        &self.cabinet_name
    }

    /// Returns the user-readable name of the disk holding the linked
    /// cabinet.
    pub fn disk_name(&self) -> &str {
        &self.disk_name
    }
}

/// The fixed header of a cabinet file.
#[derive(Clone, Debug)]
pub struct CabinetHeader {
    total_size: u32,
    first_file_offset: u32,
    version_major: u8,
    version_minor: u8,
    flags: u16,
    num_folders: u16,
    num_files: u16,
    cabinet_set_id: u16,
    cabinet_set_index: u16,
    folder_reserve_size: u8,
    data_reserve_size: u8,
    reserve_data: Vec<u8>,
    prev_cabinet: Option<VolumeLink>,
    next_cabinet: Option<VolumeLink>,
}

impl CabinetHeader {
    /// Returns the declared size of the whole cabinet file, in bytes.
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Returns the offset of the first file entry.
    pub fn first_file_offset(&self) -> u32 {
        self.first_file_offset
    }

    /// Returns the format version as `(major, minor)`.
    pub fn version(&self) -> (u8, u8) {
        (self.version_major, self.version_minor)
    }

    /// Returns the raw header flags.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Returns the number of folders in this cabinet.
    pub fn num_folders(&self) -> u16 {
        self.num_folders
    }

    /// Returns the number of file entries in this cabinet.
    pub fn num_files(&self) -> u16 {
        self.num_files
    }

    /// Returns the cabinet set ID (an arbitrary number used to group together
    /// a set of cabinets).
    pub fn cabinet_set_id(&self) -> u16 {
        self.cabinet_set_id
    }

    /// Returns this cabinet's (zero-based) index within its cabinet set.
    pub fn cabinet_set_index(&self) -> u16 {
        self.cabinet_set_index
    }

    /// Returns the size of the per-folder reserve area.
    pub fn folder_reserve_size(&self) -> u8 {
        self.folder_reserve_size
    }

    /// Returns the size of the per-data-block reserve area.
    pub fn data_reserve_size(&self) -> u8 {
        self.data_reserve_size
    }

    /// Returns the application-defined reserve data stored in the header.
    pub fn reserve_data(&self) -> &[u8] {
        &self.reserve_data
    }

    /// Returns the link to the previous cabinet in the set, if any.
    pub fn prev_cabinet(&self) -> Option<&VolumeLink> {
        self.prev_cabinet.as_ref()
    }

    /// Returns the link to the next cabinet in the set, if any.
    pub fn next_cabinet(&self) -> Option<&VolumeLink> {
        self.next_cabinet.as_ref()
    }
}

/// Reports a directory cut short by the end of the stream as malformed.
fn truncated(error: Error, part: &str) -> Error {
    match error {
        Error::Io(ref io_error)
            if io_error.kind() == io::ErrorKind::UnexpectedEof =>
        {
            Error::Format(format!("Cabinet ends inside its {}", part))
        }
        other => other,
    }
}

fn check_directory_extent<R: Seek>(
    reader: &mut R,
    total_size: u64,
    part: &str,
) -> Result<()> {
    let end = reader.stream_position()?;
    if end > total_size {
        format_error!(
            "Cabinet {} ends at offset {}, past the cabinet end at {}",
            part,
            end,
            total_size
        );
    }
    Ok(())
}

fn parse_header<R: Read>(mut reader: R) -> Result<CabinetHeader> {
    let signature = reader.read_u32::<LittleEndian>()?;
    if signature != consts::FILE_SIGNATURE {
        format_error!("Not a cabinet file (invalid file signature)");
    }
    let _reserved1 = reader.read_u32::<LittleEndian>()?;
    let total_size = reader.read_u32::<LittleEndian>()?;
    if total_size > consts::MAX_TOTAL_CAB_SIZE {
        format_error!(
            "Cabinet total size field is too large \
             ({} bytes; max is {} bytes)",
            total_size,
            consts::MAX_TOTAL_CAB_SIZE
        );
    }
    let _reserved2 = reader.read_u32::<LittleEndian>()?;
    let first_file_offset = reader.read_u32::<LittleEndian>()?;
    if first_file_offset > total_size {
        format_error!(
            "File entries at offset {} lie beyond the end of the cabinet",
            first_file_offset
        );
    }
    let _reserved3 = reader.read_u32::<LittleEndian>()?;
    let version_minor = reader.read_u8()?;
    let version_major = reader.read_u8()?;
    if version_major > consts::VERSION_MAJOR
        || version_major == consts::VERSION_MAJOR
            && version_minor > consts::VERSION_MINOR
    {
        format_error!(
            "Version {}.{} cabinet files are not supported",
            version_major,
            version_minor
        );
    }
    let num_folders = reader.read_u16::<LittleEndian>()?;
    let num_files = reader.read_u16::<LittleEndian>()?;
    let flags = reader.read_u16::<LittleEndian>()?;
    let cabinet_set_id = reader.read_u16::<LittleEndian>()?;
    let cabinet_set_index = reader.read_u16::<LittleEndian>()?;
    let mut header_reserve_size = 0u16;
    let mut folder_reserve_size = 0u8;
    let mut data_reserve_size = 0u8;
    if (flags & consts::FLAG_RESERVE_PRESENT) != 0 {
        header_reserve_size = reader.read_u16::<LittleEndian>()?;
        folder_reserve_size = reader.read_u8()?;
        data_reserve_size = reader.read_u8()?;
    }
    if header_reserve_size as usize > consts::MAX_HEADER_RESERVE_SIZE {
        format_error!(
            "Cabinet header reserve size is too large \
             ({} bytes; max is {} bytes)",
            header_reserve_size,
            consts::MAX_HEADER_RESERVE_SIZE
        );
    }
    let mut reserve_data = vec![0u8; header_reserve_size as usize];
    reader.read_exact(&mut reserve_data)?;
    let prev_cabinet = if (flags & consts::FLAG_PREV_CABINET) != 0 {
        Some(read_volume_link(&mut reader)?)
    } else {
        None
    };
    let next_cabinet = if (flags & consts::FLAG_NEXT_CABINET) != 0 {
        Some(read_volume_link(&mut reader)?)
    } else {
        None
    };
    Ok(CabinetHeader {
        total_size,
        first_file_offset,
        version_major,
        version_minor,
        flags,
        num_folders,
        num_files,
        cabinet_set_id,
        cabinet_set_index,
        folder_reserve_size,
        data_reserve_size,
        reserve_data,
        prev_cabinet,
        next_cabinet,
    })
}

fn read_volume_link<R: Read>(reader: &mut R) -> Result<VolumeLink> {
    let cabinet_name = read_null_terminated_string(&mut *reader, false)?;
    let disk_name = read_null_terminated_string(&mut *reader, false)?;
    Ok(VolumeLink { cabinet_name, disk_name })
}

// ========================================================================= //

/// A structure for reading a cabinet file.
pub struct Cabinet<R> {
    header: CabinetHeader,
    folders: Vec<FolderInfo>,
    files: Vec<FileEntry>,
    options: ExtractOptions,
    reader: RefCell<R>,
}

impl<R: Read + Seek> Cabinet<R> {
    /// Open an existing cabinet file with the default options.
    pub fn new(reader: R) -> Result<Cabinet<R>> {
        Cabinet::with_options(reader, ExtractOptions::default())
    }

    /// Open an existing cabinet file.
    pub fn with_options(
        mut reader: R,
        options: ExtractOptions,
    ) -> Result<Cabinet<R>> {
        let header =
            parse_header(&mut reader).map_err(|e| truncated(e, "header"))?;
        let position = reader.stream_position()?;
        let stream_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(position))?;
        let total_size = (header.total_size as u64).min(stream_len);
        let mut folders = Vec::with_capacity(header.num_folders as usize);
        for _ in 0..header.num_folders {
            let entry = parse_folder_entry(
                &mut reader,
                header.folder_reserve_size as usize,
            )
            .map_err(|e| truncated(e, "folder table"))?;
            folders.push(entry);
        }
        check_directory_extent(&mut reader, total_size, "folder table")?;
        reader.seek(SeekFrom::Start(header.first_file_offset as u64))?;
        let mut files = Vec::with_capacity(header.num_files as usize);
        for _ in 0..header.num_files {
            let mut entry = parse_file_entry(&mut reader)
                .map_err(|e| truncated(e, "file table"))?;
            entry.folder = match entry.folder_index() {
                consts::FOLDER_CONTINUED_FROM_PREV
                | consts::FOLDER_CONTINUED_PREV_AND_NEXT => 0,
                consts::FOLDER_CONTINUED_TO_NEXT => {
                    folders.len().saturating_sub(1)
                }
                index => index as usize,
            };
            if entry.folder >= folders.len() {
                format_error!(
                    "File entry {:?} has folder index {} out of bounds",
                    entry.name(),
                    entry.folder_index()
                );
            }
            files.push(entry);
        }
        check_directory_extent(&mut reader, total_size, "file table")?;
        for folder in folders.iter_mut() {
            parse_data_blocks(
                &mut reader,
                folder,
                header.data_reserve_size as usize,
                total_size,
            )?;
        }

        let continues_from_prev =
            files.iter().any(FileEntry::is_continued_from_prev);
        for file in files.iter() {
            // Offsets in a folder carried over from the previous volume are
            // relative to the folder's start in that volume.
            if file.is_continued_from_prev()
                || file.is_continued_to_next()
                || (file.folder == 0 && continues_from_prev)
            {
                continue;
            }
            let folder_size = folders[file.folder].uncompressed_size();
            if file.end_in_folder() > folder_size {
                format_error!(
                    "File {:?} extends to offset {} of folder {}, \
                     which holds only {} bytes",
                    file.name(),
                    file.end_in_folder(),
                    file.folder,
                    folder_size
                );
            }
        }
        debug!(
            "Opened cabinet {}#{} ({} folders, {} files)",
            header.cabinet_set_id,
            header.cabinet_set_index,
            folders.len(),
            files.len()
        );
        Ok(Cabinet {
            header,
            folders,
            files,
            options,
            reader: RefCell::new(reader),
        })
    }

    /// Returns the parsed cabinet header.
    pub fn header(&self) -> &CabinetHeader {
        &self.header
    }

    /// Returns the options used when decoding this cabinet's folders.
    pub fn options(&self) -> ExtractOptions {
        self.options
    }

    /// Replaces the options used when decoding this cabinet's folders.
    pub fn set_options(&mut self, options: ExtractOptions) {
        self.options = options;
    }

    /// Returns the cabinet set ID for this cabinet (an arbitrary number used
    /// to group together a set of cabinets).
    pub fn cabinet_set_id(&self) -> u16 {
        self.header.cabinet_set_id
    }

    /// Returns this cabinet's (zero-based) index within its cabinet set.
    pub fn cabinet_set_index(&self) -> u16 {
        self.header.cabinet_set_index
    }

    /// Returns the application-defined reserve data stored in the cabinet
    /// header.
    pub fn reserve_data(&self) -> &[u8] {
        &self.header.reserve_data
    }

    /// Returns an iterator over the folder entries in this cabinet.
    pub fn folder_entries(&self) -> FolderEntries {
        FolderEntries { iter: self.folders.iter().enumerate(), files: &self.files }
    }

    /// Returns an iterator over all file entries in this cabinet.
    pub fn file_entries(&self) -> FileEntries {
        FileEntries { iter: self.files.iter(), folder: None }
    }

    /// Returns the entry for the file with the given name, if any.
    pub fn get_file_entry(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|&file| file.name() == name)
    }

    /// Decodes the whole stream of the specified folder.
    pub fn decode_folder(&self, index: usize) -> Result<Vec<u8>> {
        let output = self.decode_folder_with(index, &CancelToken::new())?;
        Ok(output.data)
    }

    /// Decodes the specified folder, checking `cancel` between data blocks.
    pub fn decode_folder_with(
        &self,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<FolderOutput> {
        let folder = self.folder_info(index)?;
        let decoder = FolderDecoder::new(
            index,
            folder.compression_type,
            self.options.checksum,
        )?;
        let blocks = folder.blocks.iter().map(|block| self.read_raw_block(block));
        decoder.run(blocks, folder.uncompressed_size(), cancel)
    }

    /// Decodes several folders on a pool of at most `parallelism` threads.
    ///
    /// The compressed data of every folder is read up front; only the
    /// decoding runs in parallel.  Results are returned in the order of
    /// `indices`, and a failure in one folder does not affect the others.
    pub fn decode_folders(
        &self,
        indices: &[usize],
        parallelism: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Result<FolderOutput>>> {
        let jobs: Vec<Result<(FolderDecoder, Vec<RawBlock>, u64)>> = indices
            .iter()
            .map(|&index| self.prepare_folder(index))
            .collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .build()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        debug!(
            "Decoding {} folders on {} threads",
            jobs.len(),
            pool.current_num_threads()
        );
        Ok(pool.install(|| {
            jobs.into_par_iter()
                .map(|job| {
                    let (decoder, blocks, size) = job?;
                    decoder.run(blocks.into_iter().map(Ok), size, cancel)
                })
                .collect()
        }))
    }

    /// Returns the decompressed contents of a file in this cabinet.
    pub fn extract_file(&self, file: &FileEntry) -> Result<Vec<u8>> {
        if !self.is_local_start(file) {
            return Err(Error::MissingVolume {
                name: file.name().to_string(),
                partial: None,
            });
        }
        let folder = self.folder_info(file.folder)?;
        let decoder = FolderDecoder::new(
            file.folder,
            folder.compression_type,
            self.options.checksum,
        )?;
        let end = file.end_in_folder();
        let blocks = folder
            .blocks
            .iter()
            .take_while(|block| block.start() < end)
            .map(|block| self.read_raw_block(block));
        let output = decoder.run(blocks, end, &CancelToken::new())?;
        let part = slice_file(&output.data, 0, file);
        if part.missing_after {
            return Err(part.into_missing_volume(self.options.missing_volume));
        }
        Ok(part.data.to_vec())
    }

    /// Returns a reader over the decompressed data for the file in the cabinet
    /// with the given name.
    pub fn read_file(&self, name: &str) -> Result<FileReader<R>> {
        let file = match self.get_file_entry(name) {
            Some(file) => file,
            None => {
                return Err(Error::NotFound(format!(
                    "No such file in cabinet: {:?}",
                    name
                )))
            }
        };
        if !self.is_local_start(file) || file.is_continued_to_next() {
            return Err(Error::MissingVolume {
                name: name.to_string(),
                partial: None,
            });
        }
        let file_start_in_folder = file.uncompressed_offset() as u64;
        let mut folder_reader = FolderReader::new(self, file.folder)?;
        folder_reader.seek(SeekFrom::Start(file_start_in_folder))?;
        Ok(FileReader {
            reader: folder_reader,
            file_start_in_folder,
            offset: 0,
            size: file.uncompressed_size() as u64,
        })
    }

    /// Returns true if this file's folder stream begins in this cabinet.
    fn is_local_start(&self, file: &FileEntry) -> bool {
        !file.is_continued_from_prev()
            && !(file.folder == 0 && self.continues_from_prev())
    }

    /// Returns true if this cabinet's first folder is carried over from the
    /// previous cabinet in the set.
    pub(crate) fn continues_from_prev(&self) -> bool {
        self.files.iter().any(FileEntry::is_continued_from_prev)
    }

    /// Returns true if this cabinet's last folder continues into the next
    /// cabinet in the set.
    pub(crate) fn continues_to_next(&self) -> bool {
        self.files.iter().any(FileEntry::is_continued_to_next)
    }

    pub(crate) fn num_folders(&self) -> usize {
        self.folders.len()
    }

    pub(crate) fn folder_info(&self, index: usize) -> Result<&FolderInfo> {
        match self.folders.get(index) {
            Some(folder) => Ok(folder),
            None => Err(Error::NotFound(format!(
                "Folder index {} is out of range (cabinet has {} folders)",
                index,
                self.folders.len()
            ))),
        }
    }

    pub(crate) fn read_raw_block(&self, block: &DataBlock) -> Result<RawBlock> {
        let mut reader = self.reader.borrow_mut();
        reader.seek(SeekFrom::Start(block.data_offset))?;
        let mut data = vec![0u8; block.compressed_size as usize];
        reader.read_exact(&mut data)?;
        Ok(RawBlock { header: block.clone(), data })
    }

    pub(crate) fn read_raw_blocks(&self, index: usize) -> Result<Vec<RawBlock>> {
        self.folder_info(index)?
            .blocks
            .iter()
            .map(|block| self.read_raw_block(block))
            .collect()
    }

    fn prepare_folder(
        &self,
        index: usize,
    ) -> Result<(FolderDecoder, Vec<RawBlock>, u64)> {
        let folder = self.folder_info(index)?;
        let decoder = FolderDecoder::new(
            index,
            folder.compression_type,
            self.options.checksum,
        )?;
        let blocks = self.read_raw_blocks(index)?;
        Ok((decoder, blocks, folder.uncompressed_size()))
    }
}
