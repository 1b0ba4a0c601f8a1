//! An in-memory block device, for tests, demos, and benches.

use crate::blockdev::{BlockDevice, DriverError};

use std::sync::Mutex;

/// A sector-addressable chunk of memory behind a mutex.
///
/// Out-of-range transfers are clipped to the device end; the returned block
/// count reflects the clip, which is how real drivers report running off the
/// end of the medium.
pub struct RamDisk {
    block_size: usize,
    blocks: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: u16, num_blocks: u32) -> Self {
        Self {
            block_size: block_size as usize,
            blocks: Mutex::new(vec![0; block_size as usize * num_blocks as usize]),
        }
    }

    /// Wraps an existing image, padding it up to a whole number of blocks.
    pub fn from_image(block_size: u16, mut image: Vec<u8>) -> Self {
        let bs = block_size as usize;
        let rem = image.len() % bs;
        if rem != 0 {
            image.resize(image.len() + (bs - rem), 0);
        }

        Self {
            block_size: bs,
            blocks: Mutex::new(image),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> u32 {
        (self.blocks.lock().unwrap().len() / self.block_size) as u32
    }

    /// Copies one block out, bypassing any cache above us. Test inspection
    /// only.
    pub fn read_back(&self, lba: u32) -> Vec<u8> {
        let mem = self.blocks.lock().unwrap();
        let start = lba as usize * self.block_size;

        mem[start..start + self.block_size].to_vec()
    }

    // first byte offset + how many whole blocks actually fit
    fn clip(&self, mem_len: usize, first_lba: u32, count: u32) -> (usize, usize) {
        let start = (first_lba as usize).saturating_mul(self.block_size);
        if start >= mem_len {
            return (mem_len, 0);
        }

        let avail = (mem_len - start) / self.block_size;
        (start, avail.min(count as usize))
    }
}

impl BlockDevice for RamDisk {
    fn read_blocks(&self, dst: &mut [u8], first_lba: u32, count: u32)
        -> Result<u32, DriverError>
    {
        let mem = self.blocks.lock().unwrap();
        let (start, blocks) = self.clip(mem.len(), first_lba, count);

        let len = blocks * self.block_size;
        dst[..len].copy_from_slice(&mem[start..start + len]);

        Ok(blocks as u32)
    }

    fn write_blocks(&self, src: &[u8], first_lba: u32, count: u32)
        -> Result<u32, DriverError>
    {
        let mut mem = self.blocks.lock().unwrap();
        let (start, blocks) = self.clip(mem.len(), first_lba, count);

        let len = blocks * self.block_size;
        mem[start..start + len].copy_from_slice(&src[..len]);

        Ok(blocks as u32)
    }
}
