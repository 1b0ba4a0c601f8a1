//! Zero-hardware smoke test of the whole core: assemble a FAT16 volume in a
//! RAM-backed block device, mount it, dump the geometry, and push a sector
//! through the cache.
//!
//! Run with `cargo run --example mount`.

use fatio::ramdisk::RamDisk;
use fatio::{BlockDevice, IoManager, Mode};

use std::sync::Arc;

fn put_u16(sector: &mut [u8], offset: usize, v: u16) {
    sector[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(sector: &mut [u8], offset: usize, v: u32) {
    sector[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn main() {
    // A small FAT16 layout: 32 reserved sectors, one 32-sector FAT, a
    // 32-sector root directory region, 16 sectors per cluster.
    let mut bpb = [0u8; 512];
    put_u16(&mut bpb, 0x00B, 512);
    bpb[0x00D] = 16;
    put_u16(&mut bpb, 0x00E, 32);
    bpb[0x010] = 1;
    put_u16(&mut bpb, 0x011, 512);
    bpb[0x015] = 0xF8;
    put_u16(&mut bpb, 0x016, 32);
    put_u32(&mut bpb, 0x020, 131_072);
    bpb[510] = 0x55;
    bpb[511] = 0xAA;

    let mut fat0 = [0u8; 512];
    fat0[0] = 0xF8;
    fat0[1] = 0xFF;
    fat0[2] = 0xFF;
    fat0[3] = 0xFF;

    let disk = RamDisk::new(512, 128);
    disk.write_blocks(&bpb, 0, 1).unwrap();
    disk.write_blocks(&fat0, 32, 1).unwrap();
    let disk = Arc::new(disk);

    let ioman = IoManager::new(8 * 512, 512).unwrap();
    ioman.register_device(512, disk.clone()).unwrap();
    ioman.mount_partition(0).unwrap();

    println!("{:#?}", ioman.partition().unwrap());
    println!("volume size: {} bytes", ioman.volume_size());

    // Scribble on the first data sector and read it back through the cache.
    let first_data = ioman.partition().unwrap().first_data_sector;

    let mut buf = ioman.acquire(first_data, Mode::Write).unwrap();
    buf.bytes_mut()[..13].copy_from_slice(b"hello, fatio!");
    buf.release();

    ioman.flush_cache().unwrap();

    let buf = ioman.acquire(first_data, Mode::Read).unwrap();
    println!(
        "sector {}: {:?}",
        first_data,
        core::str::from_utf8(&buf.bytes()[..13]).unwrap()
    );
    buf.release();

    println!("device sees: {:?}", &disk.read_back(first_data)[..13]);
}
