//! The seam between the I/O manager and whatever actually stores sectors:
//! an SD card, a raw disk, a flash translation layer, or a disk image.
//!
//! Drivers deal in whole blocks. The manager always transfers one of its own
//! blocks at a time; a device may be registered with a larger block size as
//! long as it is a multiple of the manager's (the ratio surfaces as the
//! partition's `blk_factor`).

use core::fmt::{self, Debug, Display};

use alloc::sync::Arc;

/// Milliseconds slept between attempts when a driver reports itself busy.
pub const DRIVER_BUSY_SLEEP_MS: u64 = 20;

/// Bound on busy retries before the transfer is failed. A driver that stays
/// busy this long is treated the same as one that returned a fatal error.
pub const DRIVER_BUSY_RETRIES: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DriverError {
    /// Transient: the manager yields the scheduler, sleeps
    /// [`DRIVER_BUSY_SLEEP_MS`], and retries (up to [`DRIVER_BUSY_RETRIES`]
    /// times).
    Busy,
    /// Fatal device error for this call. The code is driver-defined and only
    /// logged.
    Fatal(i32),
}

impl Display for DriverError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Busy => write!(fmt, "driver busy"),
            DriverError::Fatal(code) => write!(fmt, "fatal driver error ({})", code),
        }
    }
}

using_std! {
    impl std::error::Error for DriverError { }
}

/// Implementors of this trait move whole blocks between memory and the
/// backing medium.
///
/// Methods take `&self`: the manager serialises access to any one cache slot
/// (via its in-service marking) but does *not* serialise the driver globally,
/// so transfers for different slots may run concurrently. Drivers that are
/// not reentrant must lock internally.
pub trait BlockDevice: Send + Sync {
    /// Reads `count` blocks starting at `first_lba` into `dst`.
    ///
    /// `dst` is exactly `count * block_size` bytes. Returns the number of
    /// blocks transferred; the caller compares it against `count`.
    fn read_blocks(&self, dst: &mut [u8], first_lba: u32, count: u32)
        -> Result<u32, DriverError>;

    /// Writes `count` blocks starting at `first_lba` from `src`.
    ///
    /// `src` is exactly `count * block_size` bytes. Returns the number of
    /// blocks transferred.
    fn write_blocks(&self, src: &[u8], first_lba: u32, count: u32)
        -> Result<u32, DriverError>;
}

/// What `register_device` records. The trait object owns whatever context
/// the driver needs (the original's opaque parameter pointer).
pub(crate) struct RegisteredDevice {
    pub blk_size: u16,
    pub dev: Arc<dyn BlockDevice>,
}

impl Debug for RegisteredDevice {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RegisteredDevice")
            .field("blk_size", &self.blk_size)
            .finish()
    }
}
