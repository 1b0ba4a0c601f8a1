//! The error set surfaced by the public API.
//!
//! Three kinds live in one enum: configuration errors (bad sizes, bad
//! partition index, double registration — reported synchronously, no state
//! change), device errors (fatal driver returns, exhausted busy retries), and
//! format errors (implausible BPB fields, FAT-sanity mismatches at mount).

use core::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The cache size handed to the constructor is zero or not a multiple of
    /// the block size.
    InvalidCacheSize,
    /// The manager block size is zero or not a multiple of 512.
    InvalidBlockSize,
    /// Primary partition index outside `0..=3`.
    InvalidPartitionNum,
    /// The MBR entry for the requested partition has a starting LBA of zero.
    NoMountablePartition,
    /// The MBR or BPB didn't provide sensible data.
    InvalidFormat,
    /// The volume could not be determined to be FAT (FAT[0] sanity check).
    NotFatFormatted,
    /// The block device driver failed a transfer, or no driver is registered.
    DeviceDriverFailed,
    /// A block device is already registered with this manager.
    DeviceAlreadyRegistered,
    /// The device block size is zero, not a multiple of 512, or not a
    /// multiple of the manager's block size.
    DeviceInvalidBlockSize,
}

impl Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        let msg = match self {
            InvalidCacheSize => "cache size is not a positive multiple of the block size",
            InvalidBlockSize => "block size is not a positive multiple of 512",
            InvalidPartitionNum => "primary partition number must be in 0..=3",
            NoMountablePartition => "no mountable partition at the requested index",
            InvalidFormat => "the MBR or partition boot block didn't provide sensible data",
            NotFatFormatted => "the volume could not be determined to be FAT formatted",
            DeviceDriverFailed => "the device driver failed, or no device is registered",
            DeviceAlreadyRegistered => "a block device is already registered",
            DeviceInvalidBlockSize => "device block size is incompatible with the manager",
        };

        write!(fmt, "{}", msg)
    }
}

using_std! {
    impl std::error::Error for Error { }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;
