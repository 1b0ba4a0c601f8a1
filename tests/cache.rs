//! Cache and concurrency behaviour of the I/O manager, driven black-box
//! through the public API against in-memory devices.

use fatio::ramdisk::RamDisk;
use fatio::{BlockDevice, DriverError, Error, IoManager, Mode};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

const BLOCK: u16 = 512;

fn manager(slots: u32, disk_blocks: u32) -> (IoManager, Arc<RamDisk>) {
    let ioman = IoManager::new(u32::from(BLOCK) * slots, BLOCK).unwrap();
    let disk = Arc::new(RamDisk::new(BLOCK, disk_blocks));
    ioman.register_device(BLOCK, disk.clone()).unwrap();

    (ioman, disk)
}

// Deterministic xorshift64 so the randomised workloads replay.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn acquire_without_a_device_fails() {
    let ioman = IoManager::new(4 * 512, 512).unwrap();

    assert_eq!(
        ioman.acquire(0, Mode::Read).unwrap_err(),
        Error::DeviceDriverFailed
    );
}

#[test]
fn double_registration_keeps_the_first_device() {
    let ioman = IoManager::new(4 * 512, 512).unwrap();

    let first = Arc::new(RamDisk::new(512, 8));
    let mut sector = vec![0u8; 512];
    sector[0] = 0x11;
    first.write_blocks(&sector, 3, 1).unwrap();

    ioman.register_device(512, first).unwrap();

    assert_eq!(
        ioman
            .register_device(512, Arc::new(RamDisk::new(512, 8)))
            .unwrap_err(),
        Error::DeviceAlreadyRegistered
    );

    // the original device still serves reads
    let buf = ioman.acquire(3, Mode::Read).unwrap();
    assert_eq!(buf.bytes()[0], 0x11);
}

#[test]
fn registration_rejects_incompatible_block_sizes() {
    let ioman = IoManager::new(4 * 1024, 1024).unwrap();

    for bad in [0u16, 513].iter() {
        assert_eq!(
            ioman
                .register_device(*bad, Arc::new(RamDisk::new(512, 8)))
                .unwrap_err(),
            Error::DeviceInvalidBlockSize
        );
    }

    // a multiple of 512 but not of the manager's 1024
    assert_eq!(
        ioman
            .register_device(512, Arc::new(RamDisk::new(512, 8)))
            .unwrap_err(),
        Error::DeviceInvalidBlockSize
    );

    // the failed attempts left the slot open
    ioman
        .register_device(2048, Arc::new(RamDisk::new(2048, 8)))
        .unwrap();
}

#[test]
fn write_then_read_round_trip() {
    let (ioman, disk) = manager(4, 16);

    let mut buf = ioman.acquire(7, Mode::Write).unwrap();
    for (i, b) in buf.bytes_mut().iter_mut().enumerate() {
        *b = i as u8;
    }
    buf.release();

    // write-back is lazy: nothing has reached the device yet
    assert_eq!(disk.read_back(7)[5], 0);

    let buf = ioman.acquire(7, Mode::Read).unwrap();
    assert_eq!(buf.bytes()[5], 5);
    buf.release();

    // the read went through the dirty slot, flushing it on the way
    assert_eq!(disk.read_back(7)[5], 5);
}

#[test]
fn flush_cache_writes_everything_back() {
    let (ioman, disk) = manager(4, 32);

    for sector in [2u32, 11, 23].iter() {
        let mut buf = ioman.acquire(*sector, Mode::Write).unwrap();
        buf.bytes_mut()[0] = *sector as u8;
        buf.bytes_mut()[511] = 0x5A;
    }

    assert_eq!(ioman.dirty_blocks(), 3);

    ioman.flush_cache().unwrap();

    assert_eq!(ioman.dirty_blocks(), 0);
    for sector in [2u32, 11, 23].iter() {
        assert_eq!(disk.read_back(*sector)[0], *sector as u8);
        assert_eq!(disk.read_back(*sector)[511], 0x5A);
    }

    // an idle sweep is a no-op
    ioman.flush_cache().unwrap();
}

#[test]
fn held_replicas_are_invalidated_by_a_writer() {
    let (ioman, disk) = manager(4, 16);

    // pin a clean replica of sector 2
    let reader = ioman.acquire(2, Mode::Read).unwrap();

    // the writer takes a different slot; the pinned replica goes stale
    let mut w = ioman.acquire(2, Mode::Write).unwrap();
    w.bytes_mut()[0] = 0xEE;
    w.release();

    assert_eq!(reader.bytes()[0], 0); // the pinned view itself is unchanged
    reader.release();

    // a fresh read must observe the written bytes, not the old replica
    let buf = ioman.acquire(2, Mode::Read).unwrap();
    assert_eq!(buf.bytes()[0], 0xEE);
    buf.release();

    assert_eq!(disk.read_back(2)[0], 0xEE);
}

#[test]
fn in_service_slots_are_never_handed_out() {
    // A deliberately slow device: if a searcher could grab a slot while its
    // fill is still running it would observe a half-filled block.
    struct SlowDisk {
        inner: RamDisk,
    }

    impl BlockDevice for SlowDisk {
        fn read_blocks(&self, dst: &mut [u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.inner.read_blocks(dst, lba, count)
        }

        fn write_blocks(&self, src: &[u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            self.inner.write_blocks(src, lba, count)
        }
    }

    let slow = SlowDisk { inner: RamDisk::new(512, 16) };
    let pattern = vec![0xA5u8; 512];
    slow.inner.write_blocks(&pattern, 4, 1).unwrap();

    let ioman = IoManager::new(2 * 512, 512).unwrap();
    ioman.register_device(512, Arc::new(slow)).unwrap();
    let ioman = Arc::new(ioman);

    let mut threads = Vec::new();
    for _ in 0..8 {
        let m = ioman.clone();
        threads.push(std::thread::spawn(move || {
            for _ in 0..25 {
                let buf = m.acquire(4, Mode::Read).unwrap();
                assert!(buf.bytes().iter().all(|b| *b == 0xA5));
            }
        }));
    }

    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn concurrent_writers_never_share_a_write_handle() {
    let (ioman, disk) = manager(4, 128);
    let ioman = Arc::new(ioman);
    let holders = Arc::new(AtomicU32::new(0));

    let mut threads = Vec::new();
    for id in 1..=2u8 {
        let m = ioman.clone();
        let h = holders.clone();

        threads.push(std::thread::spawn(move || {
            for _ in 0..10_000 {
                let mut buf = m.acquire(100, Mode::Write).unwrap();

                // no other thread may hold a Write handle on this sector
                assert_eq!(h.fetch_add(1, Ordering::SeqCst), 0);
                buf.bytes_mut()[0] = id;
                h.fetch_sub(1, Ordering::SeqCst);

                buf.release();
            }
        }));
    }

    for t in threads {
        t.join().unwrap();
    }

    ioman.flush_cache().unwrap();

    let byte = disk.read_back(100)[0];
    assert!(byte == 1 || byte == 2, "device byte 0 was {:#x}", byte);
}

#[test]
fn random_workload_matches_a_shadow_model() {
    let (ioman, disk) = manager(4, 16);

    let mut shadow = vec![[0u8; 512]; 16];
    let mut rng = Rng(0x2545_F491_4F6C_DD1D);

    for _ in 0..1000 {
        let sector = (rng.next() % 16) as u32;

        if rng.next() % 2 == 0 {
            let fill = (rng.next() & 0xFF) as u8;

            let mut buf = ioman.acquire(sector, Mode::Write).unwrap();
            for (i, b) in buf.bytes_mut().iter_mut().enumerate() {
                *b = fill ^ (i as u8);
            }
            for (i, b) in shadow[sector as usize].iter_mut().enumerate() {
                *b = fill ^ (i as u8);
            }
        } else {
            let buf = ioman.acquire(sector, Mode::Read).unwrap();
            assert_eq!(buf.bytes(), &shadow[sector as usize][..], "sector {}", sector);
        }
    }

    // after a full sweep the device must agree with the model exactly
    ioman.flush_cache().unwrap();
    for sector in 0..16u32 {
        assert_eq!(
            disk.read_back(sector).as_slice(),
            &shadow[sector as usize][..],
            "sector {}",
            sector
        );
    }
}

#[test]
fn busy_drivers_are_retried() {
    struct BusyAtFirst {
        inner: RamDisk,
        remaining: AtomicU32,
    }

    impl BlockDevice for BusyAtFirst {
        fn read_blocks(&self, dst: &mut [u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            if self.remaining.load(Ordering::SeqCst) > 0 {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(DriverError::Busy);
            }
            self.inner.read_blocks(dst, lba, count)
        }

        fn write_blocks(&self, src: &[u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            self.inner.write_blocks(src, lba, count)
        }
    }

    let dev = BusyAtFirst { inner: RamDisk::new(512, 8), remaining: AtomicU32::new(3) };
    let mut sector = vec![0u8; 512];
    sector[0] = 0x42;
    dev.inner.write_blocks(&sector, 1, 1).unwrap();

    let ioman = IoManager::new(2 * 512, 512).unwrap();
    ioman.register_device(512, Arc::new(dev)).unwrap();

    let buf = ioman.acquire(1, Mode::Read).unwrap();
    assert_eq!(buf.bytes()[0], 0x42);
}

#[test]
fn write_failures_surface_and_the_data_survives_for_a_retry() {
    struct GatedWrites {
        inner: RamDisk,
        broken: AtomicBool,
    }

    impl BlockDevice for GatedWrites {
        fn read_blocks(&self, dst: &mut [u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            self.inner.read_blocks(dst, lba, count)
        }

        fn write_blocks(&self, src: &[u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DriverError::Fatal(-5));
            }
            self.inner.write_blocks(src, lba, count)
        }
    }

    let dev = Arc::new(GatedWrites { inner: RamDisk::new(512, 16), broken: AtomicBool::new(true) });

    let ioman = IoManager::new(4 * 512, 512).unwrap();
    ioman.register_device(512, dev.clone()).unwrap();

    let mut buf = ioman.acquire(6, Mode::Write).unwrap();
    buf.bytes_mut()[0] = 0x77;
    buf.release();

    assert_eq!(ioman.flush_cache().unwrap_err(), Error::DeviceDriverFailed);
    assert_eq!(ioman.dirty_blocks(), 1); // the slot kept its data

    dev.broken.store(false, Ordering::SeqCst);

    ioman.flush_cache().unwrap();
    assert_eq!(ioman.dirty_blocks(), 0);
    assert_eq!(dev.inner.read_back(6)[0], 0x77);
}

#[test]
fn fatal_reads_leave_the_manager_usable() {
    struct FlakySector {
        inner: RamDisk,
        bad_lba: u32,
        broken: AtomicBool,
    }

    impl BlockDevice for FlakySector {
        fn read_blocks(&self, dst: &mut [u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            if lba == self.bad_lba && self.broken.load(Ordering::SeqCst) {
                return Err(DriverError::Fatal(-1));
            }
            self.inner.read_blocks(dst, lba, count)
        }

        fn write_blocks(&self, src: &[u8], lba: u32, count: u32) -> Result<u32, DriverError> {
            self.inner.write_blocks(src, lba, count)
        }
    }

    let dev = Arc::new(FlakySector {
        inner: RamDisk::new(512, 16),
        bad_lba: 9,
        broken: AtomicBool::new(true),
    });
    let mut sector = vec![0u8; 512];
    sector[0] = 0x99;
    dev.inner.write_blocks(&sector, 9, 1).unwrap();

    let ioman = IoManager::new(2 * 512, 512).unwrap();
    ioman.register_device(512, dev.clone()).unwrap();

    assert_eq!(ioman.acquire(9, Mode::Read).unwrap_err(), Error::DeviceDriverFailed);

    // other sectors are unaffected
    let buf = ioman.acquire(3, Mode::Read).unwrap();
    assert_eq!(buf.bytes()[0], 0);
    buf.release();

    // and the failed sector recovers once the device does
    dev.broken.store(false, Ordering::SeqCst);
    let buf = ioman.acquire(9, Mode::Read).unwrap();
    assert_eq!(buf.bytes()[0], 0x99);
}
