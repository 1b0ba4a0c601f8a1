//! Volume geometry: the partition descriptor, the mount procedure, and
//! FAT-type determination.

pub mod boot_sector;

use boot_sector::Bpb;

use crate::error::Error;
use crate::ioman::{IoManager, Mode};
use crate::mbr::PartitionEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Parsed geometry of a mounted FAT volume. Populated whole by the mount
/// procedure and read-only afterwards; remounting replaces it.
///
/// All `*_lba` fields are absolute device addresses in volume sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// First sector of the volume: 0 on unpartitioned media, else the MBR
    /// entry's starting LBA.
    pub begin_lba: u32,
    /// Bytes per volume sector, from the BPB.
    pub blk_size: u16,
    /// How many manager cache blocks one volume sector spans.
    pub blk_factor: u16,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    pub sectors_per_cluster: u8,
    pub fat_begin_lba: u32,
    pub cluster_begin_lba: u32,
    /// FAT32: the root directory's first cluster. FAT12/16: the literal 1,
    /// the sentinel for "fixed root region at `cluster_begin_lba`".
    pub root_dir_cluster: u32,
    pub root_dir_sectors: u32,
    pub first_data_sector: u32,
    pub total_sectors: u32,
    pub data_sectors: u32,
    pub num_clusters: u32,
    pub fat_type: FatType,
}

impl Partition {
    /// `num_clusters * sectors_per_cluster * blk_size`, carried out in 64
    /// bits so multi-TiB volumes come out exact.
    pub fn volume_size(&self) -> u64 {
        u64::from(self.num_clusters)
            * u64::from(self.sectors_per_cluster)
            * u64::from(self.blk_size)
    }
}

/// Locates the BPB: straight in sector 0 on unpartitioned media, else behind
/// the MBR entry for `partition_number`. Entry LBAs are absolute disk
/// addresses, for every index including the non-zero ones.
fn read_bpb(ioman: &IoManager, partition_number: u8) -> Result<(u32, Bpb), Error> {
    let sector0 = ioman.acquire(0, Mode::Read)?;

    if boot_sector::plausible_sector_size(boot_sector::bytes_per_sector(sector0.bytes())) {
        // the volume is not partitioned; sector 0 is the BPB itself
        return Ok((0, Bpb::read(sector0.bytes())));
    }

    let entry = PartitionEntry::read(sector0.bytes(), usize::from(partition_number));

    // released before the next acquire so a single-slot cache can remount
    sector0.release();

    let begin_lba = entry.first_lba;
    if begin_lba == 0 {
        return Err(Error::NoMountablePartition);
    }

    let boot = ioman.acquire(begin_lba, Mode::Read)?;
    if !boot_sector::plausible_sector_size(boot_sector::bytes_per_sector(boot.bytes())) {
        return Err(Error::InvalidFormat);
    }

    Ok((begin_lba, Bpb::read(boot.bytes())))
}

/// Mounts primary partition `partition_number`, returning the populated
/// descriptor. All buffers acquired along the way are released before
/// returning.
pub(crate) fn mount(ioman: &IoManager, partition_number: u8) -> Result<Partition, Error> {
    if usize::from(partition_number) >= crate::mbr::NUM_PRIMARY_PARTITIONS {
        return Err(Error::InvalidPartitionNum);
    }

    let (begin_lba, bpb) = read_bpb(ioman, partition_number)?;

    let blk_size = bpb.bytes_per_sector;
    if blk_size % ioman.block_size() != 0 {
        // a volume sector must span a whole number of cache blocks
        return Err(Error::InvalidFormat);
    }
    let blk_factor = blk_size / ioman.block_size();

    if bpb.sectors_per_cluster == 0 {
        return Err(Error::InvalidFormat);
    }

    let reserved_sectors = bpb.reserved_sectors;
    let num_fats = bpb.num_fats;
    let sectors_per_fat = bpb.sectors_per_fat();

    let fat_begin_lba = begin_lba + u32::from(reserved_sectors);
    let cluster_begin_lba = fat_begin_lba + u32::from(num_fats) * sectors_per_fat;

    let total_sectors = bpb.total_sectors();
    let root_dir_sectors = bpb.root_dir_sectors();

    // FAT32 signals itself with a zeroed 16-bit FAT size and keeps the root
    // directory in the cluster area; FAT12/16 use the fixed region instead.
    let root_dir_cluster = if bpb.sectors_per_fat_16 == 0 {
        bpb.root_dir_cluster
    } else {
        1
    };

    let overhead = u32::from(reserved_sectors)
        + u32::from(num_fats) * sectors_per_fat
        + root_dir_sectors;
    let data_sectors = total_sectors.checked_sub(overhead).ok_or(Error::InvalidFormat)?;

    let num_clusters = data_sectors / u32::from(bpb.sectors_per_cluster);
    let fat_type = classify(num_clusters);

    #[cfg(feature = "fat-check")]
    verify_fat_entry(ioman, fat_begin_lba, fat_type)?;

    Ok(Partition {
        begin_lba,
        blk_size,
        blk_factor,
        reserved_sectors,
        num_fats,
        sectors_per_fat,
        sectors_per_cluster: bpb.sectors_per_cluster,
        fat_begin_lba,
        cluster_begin_lba,
        root_dir_cluster,
        root_dir_sectors,
        first_data_sector: cluster_begin_lba + root_dir_sectors,
        total_sectors,
        data_sectors,
        num_clusters,
        fat_type,
    })
}

/// FAT type is determined by cluster count alone.
fn classify(num_clusters: u32) -> FatType {
    if num_clusters < 4085 {
        FatType::Fat12
    } else if num_clusters < 65525 {
        FatType::Fat16
    } else {
        FatType::Fat32
    }
}

/// Checks FAT[0] for the end-marker pattern each FAT type plants there;
/// volumes that fail are rejected as not FAT formatted.
#[cfg(feature = "fat-check")]
fn verify_fat_entry(
    ioman: &IoManager,
    fat_begin_lba: u32,
    fat_type: FatType,
) -> Result<(), Error> {
    use core::convert::TryInto;

    let buf = ioman.acquire(fat_begin_lba, Mode::Read)?;
    let fat = buf.bytes();

    let short = u16::from_le_bytes(fat[0..2].try_into().unwrap());
    let long = u32::from_le_bytes(fat[0..4].try_into().unwrap());

    let ok = match fat_type {
        FatType::Fat12 => (short & 0x3FF) == 0x3F8,
        FatType::Fat16 => short == 0xFFF8,
        FatType::Fat32 => (long & 0x0FFF_FFF8) == 0x0FFF_FFF8,
    };

    if ok {
        Ok(())
    } else {
        Err(Error::NotFatFormatted)
    }
}
