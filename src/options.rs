/// What to do when a data block's stored checksum does not match its
/// contents.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ChecksumPolicy {
    /// Fail the folder with [`Error::Checksum`](crate::Error::Checksum).
    #[default]
    Strict,
    /// Log a warning, record the block index and decode it anyway.
    Warn,
    /// Do not verify checksums at all.
    Ignore,
}

/// What to do when a file's data continues into a cabinet volume that was
/// not supplied.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum MissingVolumePolicy {
    /// Fail with [`Error::MissingVolume`](crate::Error::MissingVolume) and
    /// no data.
    #[default]
    Fail,
    /// Fail with [`Error::MissingVolume`](crate::Error::MissingVolume), but
    /// attach the portion of the file that could be decoded locally.
    ReturnLocal,
}

/// Options controlling how folders are decoded and files extracted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExtractOptions {
    /// Checksum verification policy.
    pub checksum: ChecksumPolicy,
    /// Policy for files that span into a missing volume.
    pub missing_volume: MissingVolumePolicy,
}

impl ExtractOptions {
    /// Returns the default options (strict checksums, fail on missing
    /// volumes).
    pub fn new() -> ExtractOptions {
        ExtractOptions::default()
    }

    /// Sets the checksum policy.
    pub fn checksum(mut self, policy: ChecksumPolicy) -> ExtractOptions {
        self.checksum = policy;
        self
    }

    /// Sets the missing-volume policy.
    pub fn missing_volume(
        mut self,
        policy: MissingVolumePolicy,
    ) -> ExtractOptions {
        self.missing_volume = policy;
        self
    }
}
