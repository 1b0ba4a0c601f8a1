//! The I/O manager: a fixed pool of sector buffers shared by concurrent
//! readers and writers, with lazy write-back.
//!
//! Every descriptor lives under one pool-wide mutex. The mutex is never held
//! across device I/O; the slot being transferred is protected by its
//! in-service flag instead, and no search selects an in-service slot.
//!
//! Coherence rules the rest of the crate relies on:
//!
//! * at most one slot per sector is ever in Write mode;
//! * whenever a slot enters Write mode for sector `s`, every other slot
//!   caching `s` is marked stale;
//! * an idle dirty slot is flushed and taken over, never refetched around —
//!   so a read can never bypass unflushed data — and while any transfer for
//!   `s` is in flight, no second transfer for `s` starts;
//! * a replica filled from the device while a Write slot for `s` exists
//!   anywhere comes back already marked stale.

mod buffer;

pub use buffer::Mode;
use buffer::{CacheMem, Pool, SlotMode};

#[cfg(test)]
use buffer::BufferDescriptor;

use crate::blockdev::{
    BlockDevice, DriverError, RegisteredDevice, DRIVER_BUSY_RETRIES, DRIVER_BUSY_SLEEP_MS,
};
use crate::error::Error;
use crate::fat::{self, Partition};
use crate::sync::{self, Mutex, MutexInterface};

use alloc::sync::Arc;

use core::fmt::{self, Debug};

pub struct IoManager {
    block_size: u16,
    num_blocks: usize,
    mem: CacheMem,
    pool: Mutex<Pool>,
    device: Mutex<Option<RegisteredDevice>>,
    partition: Mutex<Option<Partition>>,
}

/// What one search pass under the pool lock decided. Every variant except
/// `Hit` and `Restart` leaves the chosen slot marked in-service.
enum Plan {
    /// Clean read hit; the handle count was already bumped.
    Hit(usize),
    /// Matching Read slot gone stale with no holders; refetch it in place.
    Refill(usize),
    /// Matching dirty Write slot with no holders; flush it, then hand it to
    /// the acquirer.
    Takeover(usize),
    /// Repurpose an unpinned slot; flush its old sector first if dirty.
    Evict { slot: usize, flush_old: Option<u32> },
    /// Nothing usable right now; yield and search again.
    Restart,
}

/// Runs one single-block transfer with the busy-retry policy applied.
fn transfer<F>(mut op: F, what: &str, sector: u32) -> Result<(), Error>
where
    F: FnMut() -> Result<u32, DriverError>,
{
    let mut attempts = 0;

    loop {
        match op() {
            Ok(1) => return Ok(()),
            Ok(n) => {
                log::warn!("short {} of sector {}: {} blocks transferred", what, sector, n);
                return Err(Error::DeviceDriverFailed);
            }
            Err(DriverError::Busy) => {
                attempts += 1;
                if attempts > DRIVER_BUSY_RETRIES {
                    log::warn!(
                        "driver still busy after {} retries ({} of sector {})",
                        DRIVER_BUSY_RETRIES, what, sector
                    );
                    return Err(Error::DeviceDriverFailed);
                }

                sync::yield_now();
                sync::sleep_ms(DRIVER_BUSY_SLEEP_MS);
            }
            Err(DriverError::Fatal(code)) => {
                log::warn!("{} of sector {} failed ({})", what, sector, code);
                return Err(Error::DeviceDriverFailed);
            }
        }
    }
}

impl IoManager {
    /// Creates a manager owning a cache of `cache_bytes / block_size` slots.
    ///
    /// `block_size` must be a positive multiple of 512 and `cache_bytes` a
    /// positive multiple of `block_size`. The manager allocates and owns all
    /// of its memory; dropping it releases everything.
    pub fn new(cache_bytes: u32, block_size: u16) -> Result<Self, Error> {
        if block_size == 0 || block_size % 512 != 0 {
            return Err(Error::InvalidBlockSize);
        }
        if cache_bytes == 0 || cache_bytes % u32::from(block_size) != 0 {
            return Err(Error::InvalidCacheSize);
        }

        let num_blocks = (cache_bytes / u32::from(block_size)) as usize;
        if num_blocks > usize::from(u16::MAX) {
            return Err(Error::InvalidCacheSize);
        }

        Ok(Self {
            block_size,
            num_blocks,
            mem: CacheMem::new(cache_bytes as usize, usize::from(block_size)),
            pool: Mutex::new(Pool::new(num_blocks)),
            device: Mutex::new(None),
            partition: Mutex::new(None),
        })
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Number of cache slots.
    pub fn cache_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Registers the block device driver.
    ///
    /// `blk_size` must be a positive multiple of 512 and of the manager's
    /// own block size. Fails with `DeviceAlreadyRegistered` while a driver
    /// is installed — swapping drivers mid-flight would corrupt any I/O in
    /// progress — leaving the installed driver untouched.
    pub fn register_device(&self, blk_size: u16, dev: Arc<dyn BlockDevice>) -> Result<(), Error> {
        if blk_size == 0 || blk_size % 512 != 0 {
            return Err(Error::DeviceInvalidBlockSize);
        }
        if blk_size % self.block_size != 0 {
            return Err(Error::DeviceInvalidBlockSize);
        }

        self.device.cs(|installed| match installed {
            Some(_) => Err(Error::DeviceAlreadyRegistered),
            None => {
                *installed = Some(RegisteredDevice { blk_size, dev });
                Ok(())
            }
        })
    }

    fn device(&self) -> Result<Arc<dyn BlockDevice>, Error> {
        self.device
            .cs(|d| d.as_ref().map(|r| Arc::clone(&r.dev)))
            .ok_or(Error::DeviceDriverFailed)
    }

    /// Fetches `sector` into slot `slot`'s window.
    fn fill(&self, dev: &dyn BlockDevice, sector: u32, slot: usize) -> Result<(), Error> {
        // Safety: the slot is in service with no handles out; we are the
        // transferring thread.
        let buf = unsafe { self.mem.slot_mut(slot) };

        transfer(|| dev.read_blocks(&mut *buf, sector, 1), "read", sector)
    }

    /// Writes slot `slot`'s window out as `sector`.
    fn flush_slot(&self, dev: &dyn BlockDevice, sector: u32, slot: usize) -> Result<(), Error> {
        // Safety: the slot is in service with no handles out; transfers only
        // read from the window.
        let buf = unsafe { self.mem.slot(slot) };

        transfer(|| dev.write_blocks(buf, sector, 1), "write", sector)
    }

    /// Acquires `sector` in `mode`.
    ///
    /// The search order is: clean read hit, dirty-slot takeover, stale
    /// replica refetch, then repurposing the first unpinned slot. When every
    /// slot is pinned or in service the acquirer yields and restarts; it
    /// makes progress once any holder releases.
    ///
    /// A clean read hit is never enough for a writer: a writer always ends
    /// up with the sector's single Write slot. Note that because of the
    /// takeover step a *Read* acquire can stall on a device write.
    ///
    /// On a device failure the implicated slot is left unpinned with
    /// undefined contents (the next acquire refetches it) and the error is
    /// returned.
    pub fn acquire(&self, sector: u32, mode: Mode) -> Result<Buffer<'_>, Error> {
        let dev = self.device()?;

        loop {
            let plan = self.pool.cs(|pool| Self::search(pool, sector, mode));

            match plan {
                Plan::Hit(slot) => return Ok(self.handle(slot, sector, mode)),

                Plan::Refill(slot) => {
                    let res = self.fill(&*dev, sector, slot);

                    self.pool.cs(|pool| {
                        // a Write slot that appeared for this sector during
                        // the transfer supersedes what we just fetched
                        let superseded = pool.slots.iter().any(|b| {
                            b.id as usize != slot
                                && b.sector == sector
                                && b.mode == SlotMode::Write
                        });

                        let b = &mut pool.slots[slot];
                        b.in_service = false;

                        if res.is_ok() {
                            b.num_handles = 1;
                            b.persistence = b.persistence.wrapping_add(1);
                            b.modified = b.modified || superseded;
                        } else {
                            // the claim cleared the stale flag; restore it
                            // so the next acquire refetches
                            b.modified = true;
                        }
                    });

                    res?;
                    return Ok(self.handle(slot, sector, mode));
                }

                Plan::Takeover(slot) => {
                    let res = self.flush_slot(&*dev, sector, slot);

                    self.pool.cs(|pool| {
                        if res.is_ok() {
                            pool.invalidate_replicas(sector, slot);

                            let b = &mut pool.slots[slot];
                            b.mode = mode.into();
                            b.num_handles = 1;
                            b.persistence = b.persistence.wrapping_add(1);
                            b.modified = false;
                        }
                        // on failure the slot keeps its dirty bytes and Write
                        // mode for a later flush attempt
                        pool.slots[slot].in_service = false;
                    });

                    res?;
                    return Ok(self.handle(slot, sector, mode));
                }

                Plan::Evict { slot, flush_old } => {
                    if let Some(old) = flush_old {
                        if let Err(e) = self.flush_slot(&*dev, old, slot) {
                            // the slot keeps its dirty bytes and Write mode
                            // for a later attempt
                            self.pool.cs(|pool| pool.slots[slot].in_service = false);
                            return Err(e);
                        }

                        // The old data is on the media; retarget — unless
                        // the requested sector grew a Write slot while we
                        // were flushing, in which case we stand down as a
                        // clean replica of the old sector and search again.
                        let retargeted = self.pool.cs(|pool| {
                            let conflict = pool.slots.iter().any(|b| {
                                b.id as usize != slot
                                    && b.sector == sector
                                    && b.mode == SlotMode::Write
                            });

                            let b = &mut pool.slots[slot];
                            if conflict {
                                b.mode = SlotMode::Read;
                                b.modified = false;
                                b.in_service = false;
                                false
                            } else {
                                b.sector = sector;
                                b.mode = mode.into();
                                b.modified = false;
                                true
                            }
                        });

                        if !retargeted {
                            sync::yield_now();
                            continue;
                        }
                    }

                    let res = self.fill(&*dev, sector, slot);

                    self.pool.cs(|pool| {
                        // a Write slot for this sector elsewhere in the pool
                        // means this fresh replica is already superseded and
                        // must not serve clean hits later
                        let superseded = pool.slots.iter().any(|b| {
                            b.id as usize != slot
                                && b.sector == sector
                                && b.mode == SlotMode::Write
                        });

                        let b = &mut pool.slots[slot];
                        b.in_service = false;

                        match res {
                            Ok(()) => {
                                b.num_handles = 1;
                                b.persistence = 1;
                                if mode == Mode::Read {
                                    b.modified = b.modified || superseded;
                                }
                            }
                            Err(_) => {
                                // contents are undefined now; a Free slot
                                // can only be refilled, never hit
                                b.mode = SlotMode::Free;
                                b.modified = false;
                            }
                        }

                        if res.is_ok() && mode == Mode::Write {
                            pool.invalidate_replicas(sector, slot);
                        }
                    });

                    res?;
                    return Ok(self.handle(slot, sector, mode));
                }

                Plan::Restart => sync::yield_now(),
            }
        }
    }

    fn search(pool: &mut Pool, sector: u32, mode: Mode) -> Plan {
        if mode == Mode::Read {
            // a clean, settled replica is a straight hit
            for b in pool.slots.iter_mut() {
                if b.sector == sector
                    && b.mode == SlotMode::Read
                    && !b.modified
                    && !b.in_service
                {
                    b.num_handles += 1;
                    b.persistence = b.persistence.wrapping_add(1);
                    return Plan::Hit(b.id as usize);
                }
            }
        }

        // A Write slot for this sector holds (or is about to hold) the
        // newest bytes; acquirers go through it, not around it. While one
        // is in service everybody waits — a refetch racing its transfer
        // could capture pre-flush bytes. While one is merely held, writers
        // wait (never a second Write slot per sector) and readers fall
        // through to a device-backed replica.
        let mut dirty_held = false;
        let mut dirty_in_flight = false;
        for b in pool.slots.iter_mut() {
            if b.sector == sector && b.mode == SlotMode::Write {
                if b.num_handles == 0 && !b.in_service {
                    b.in_service = true;
                    return Plan::Takeover(b.id as usize);
                }
                dirty_held = true;
                if b.in_service {
                    dirty_in_flight = true;
                }
            }
        }
        if dirty_in_flight || (mode == Mode::Write && dirty_held) {
            return Plan::Restart;
        }

        if mode == Mode::Read {
            // Stale replica with no holders: refetch in place. The stale
            // flag is cleared here, under the claim; an invalidation that
            // lands mid-transfer re-marks the slot and must stick.
            for b in pool.slots.iter_mut() {
                if b.sector == sector
                    && b.mode == SlotMode::Read
                    && b.modified
                    && b.num_handles == 0
                    && !b.in_service
                {
                    b.in_service = true;
                    b.modified = false;
                    return Plan::Refill(b.id as usize);
                }
            }
        }

        // Last resort: repurpose an unpinned slot. Victims that cost nothing
        // (never populated) beat clean replicas beat dirty slots, which need
        // a flush before they can be reused.
        let mut victim: Option<usize> = None;
        let mut victim_rank = u8::MAX;
        for (i, b) in pool.slots.iter().enumerate() {
            if b.num_handles == 0 && !b.in_service {
                let rank = match b.mode {
                    SlotMode::Free => 0,
                    SlotMode::Read => 1,
                    SlotMode::Write => 2,
                };

                if rank < victim_rank {
                    victim = Some(i);
                    victim_rank = rank;
                    if rank == 0 {
                        break;
                    }
                }
            }
        }

        if let Some(slot) = victim {
            let b = &mut pool.slots[slot];

            // A dirty victim keeps its old identity until its data is
            // flushed — acquirers of that sector must keep waiting on it —
            // and is retargeted afterwards. A clean one is retargeted right
            // here, under the claim, so concurrent searchers and
            // invalidation sweeps already see its new identity during the
            // fill.
            if b.mode == SlotMode::Write {
                b.in_service = true;
                return Plan::Evict { slot, flush_old: Some(b.sector) };
            }

            b.sector = sector;
            b.mode = mode.into();
            b.modified = false;
            b.in_service = true;

            return Plan::Evict { slot, flush_old: None };
        }

        Plan::Restart
    }

    fn handle(&self, slot: usize, sector: u32, mode: Mode) -> Buffer<'_> {
        Buffer { ioman: self, slot, sector, mode }
    }

    /// Writes back every dirty slot that has no holders, downgrading each to
    /// a clean Read slot and invalidating its replicas.
    ///
    /// Stops at the first device failure; the failed slot keeps its Write
    /// mode and bytes so a later sweep can retry.
    pub fn flush_cache(&self) -> Result<(), Error> {
        let dev = self.device()?;

        for slot in 0..self.num_blocks {
            let claim = self.pool.cs(|pool| {
                let b = &mut pool.slots[slot];

                if b.mode == SlotMode::Write && b.num_handles == 0 && !b.in_service {
                    b.in_service = true;
                    Some(b.sector)
                } else {
                    None
                }
            });

            let sector = match claim {
                Some(s) => s,
                None => continue,
            };

            let res = self.flush_slot(&*dev, sector, slot);

            self.pool.cs(|pool| {
                if res.is_ok() {
                    pool.invalidate_replicas(sector, slot);

                    let b = &mut pool.slots[slot];
                    b.mode = SlotMode::Read;
                    b.modified = false;
                }
                pool.slots[slot].in_service = false;
            });

            res?;
        }

        Ok(())
    }

    /// Number of slots currently holding unflushed Write data.
    pub fn dirty_blocks(&self) -> usize {
        self.pool.cs(|pool| {
            pool.slots.iter().filter(|b| b.mode == SlotMode::Write).count()
        })
    }

    /// Mounts primary partition `partition_number` (`0..=3`) of the
    /// registered device, replacing any previously mounted volume. A failed
    /// mount leaves nothing mounted.
    pub fn mount_partition(&self, partition_number: u8) -> Result<(), Error> {
        self.partition.cs(|p| *p = None);

        let part = fat::mount(self, partition_number)?;

        log::debug!(
            "mounted {:?} volume at LBA {}: {} clusters of {} sectors",
            part.fat_type, part.begin_lba, part.num_clusters, part.sectors_per_cluster,
        );

        self.partition.cs(|p| *p = Some(part));

        Ok(())
    }

    /// The mounted volume's geometry, if a mount has succeeded.
    pub fn partition(&self) -> Option<Partition> {
        self.partition.cs(|p| *p)
    }

    /// Total bytes addressed by the mounted volume's clusters; zero when
    /// nothing is mounted. Exact for volumes past 4 GiB.
    pub fn volume_size(&self) -> u64 {
        self.partition.cs(|p| p.map(|part| part.volume_size()).unwrap_or(0))
    }

    #[cfg(test)]
    pub(crate) fn descriptor(&self, slot: usize) -> BufferDescriptor {
        self.pool.cs(|pool| pool.slots[slot])
    }
}

impl Debug for IoManager {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("IoManager")
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .finish()
    }
}

/// A borrowed view of one cache slot, valid until dropped.
///
/// Dropping the handle releases the slot exactly once. A released Write
/// buffer stays dirty in the cache; nothing reaches the device until the
/// slot is taken over, evicted, or swept by
/// [`flush_cache`](IoManager::flush_cache).
pub struct Buffer<'io> {
    ioman: &'io IoManager,
    slot: usize,
    sector: u32,
    mode: Mode,
}

impl Buffer<'_> {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The cached block.
    pub fn bytes(&self) -> &[u8] {
        // Safety: our handle pins the slot, and no transfer starts while
        // handles are out.
        unsafe { self.ioman.mem.slot(self.slot) }
    }

    /// The cached block, writable.
    ///
    /// Panics if the buffer was acquired for reading — Read slots are shared
    /// between holders.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        assert_eq!(self.mode, Mode::Write, "bytes_mut on a Read buffer");

        // Safety: a Write slot has exactly one holder, and no transfer
        // starts while handles are out.
        unsafe { self.ioman.mem.slot_mut(self.slot) }
    }

    /// Explicit spelling of dropping the handle.
    pub fn release(self) {}
}

impl Debug for Buffer<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Buffer")
            .field("slot", &self.slot)
            .field("sector", &self.sector)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.ioman.pool.cs(|pool| {
            pool.slots[self.slot].num_handles -= 1;
        });
    }
}


#[cfg(test)]
mod protocol {
    //! Descriptor-level checks that need to see inside the pool; the
    //! black-box counterparts live in `tests/cache.rs`.

    use super::*;
    use crate::ramdisk::RamDisk;

    fn manager(slots: u32) -> (IoManager, Arc<RamDisk>) {
        let ioman = IoManager::new(slots * 512, 512).unwrap();
        let disk = Arc::new(RamDisk::new(512, 64));
        ioman.register_device(512, disk.clone()).unwrap();

        (ioman, disk)
    }

    #[test]
    fn released_write_slot_stays_dirty() {
        let (ioman, disk) = manager(4);

        let mut buf = ioman.acquire(5, Mode::Write).unwrap();
        buf.bytes_mut()[0] = 0xAB;
        buf.release();

        let b = ioman.descriptor(0);
        assert_eq!(b.sector, 5);
        assert_eq!(b.mode, SlotMode::Write);
        assert_eq!(b.num_handles, 0);

        // nothing reached the device yet
        assert_eq!(disk.read_back(5)[0], 0);
    }

    #[test]
    fn flush_downgrades_every_idle_write_slot() {
        let (ioman, disk) = manager(4);

        for sector in [3u32, 9, 12].iter() {
            let mut buf = ioman.acquire(*sector, Mode::Write).unwrap();
            buf.bytes_mut()[0] = *sector as u8;
        }

        assert_eq!(ioman.dirty_blocks(), 3);
        ioman.flush_cache().unwrap();
        assert_eq!(ioman.dirty_blocks(), 0);

        for slot in 0..3 {
            assert_eq!(ioman.descriptor(slot).mode, SlotMode::Read);
        }
        for sector in [3u32, 9, 12].iter() {
            assert_eq!(disk.read_back(*sector)[0], *sector as u8);
        }
    }

    #[test]
    fn read_hits_bump_handles_and_persistence() {
        let (ioman, _disk) = manager(2);

        let a = ioman.acquire(7, Mode::Read).unwrap();
        let b = ioman.acquire(7, Mode::Read).unwrap();

        let d = ioman.descriptor(0);
        assert_eq!(d.num_handles, 2);
        assert_eq!(d.persistence, 2);

        a.release();
        b.release();
        assert_eq!(ioman.descriptor(0).num_handles, 0);
    }

    #[test]
    fn failed_fill_leaves_the_slot_free_and_unpinned() {
        use crate::blockdev::{BlockDevice, DriverError};

        struct BrokenReads;
        impl BlockDevice for BrokenReads {
            fn read_blocks(&self, _: &mut [u8], _: u32, _: u32) -> Result<u32, DriverError> {
                Err(DriverError::Fatal(-3))
            }
            fn write_blocks(&self, _: &[u8], _: u32, count: u32) -> Result<u32, DriverError> {
                Ok(count)
            }
        }

        let ioman = IoManager::new(2 * 512, 512).unwrap();
        ioman.register_device(512, Arc::new(BrokenReads)).unwrap();

        assert_eq!(ioman.acquire(1, Mode::Read).unwrap_err(), Error::DeviceDriverFailed);

        let b = ioman.descriptor(0);
        assert_eq!(b.mode, SlotMode::Free);
        assert_eq!(b.num_handles, 0);
        assert_eq!(b.in_service, false);
    }
}
