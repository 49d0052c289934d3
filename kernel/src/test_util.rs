//! Fixtures shared by the unit tests.

use crate::block::block_core::{Block, BlockOp, BlockSector, BlockType};
use crate::block::block_error::BlockError;
use crate::drivers::ram_disk::RamDisk;
use crate::mem::supplemental::{BackingFile, FileBacking};
use crate::mem::{VirtualMemory, VmConfig};
use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use vmkernel_shared::mem::SECTORS_PER_PAGE;

fn sectors_for(pages: usize) -> BlockSector {
    BlockSector::try_from(pages * SECTORS_PER_PAGE).unwrap()
}

/// A RAM-backed swap device with room for `pages` pages.
pub fn swap_block(pages: usize) -> Block {
    let sectors = sectors_for(pages);
    Block::new(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)))
}

/// A virtual memory system with `frames` user frames and `swap_pages` slots.
pub fn small_vm(frames: usize, swap_pages: usize) -> VirtualMemory {
    let config = VmConfig {
        frames,
        ..VmConfig::default()
    };
    VirtualMemory::new(config, swap_block(swap_pages))
}

/// RAM disk whose reads can be made to fail.
pub struct FlakyDisk {
    inner: RamDisk,
    fail_reads: Arc<AtomicBool>,
}

impl BlockOp for FlakyDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        self.inner.read(sector, buf)
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.inner.write(sector, buf)
    }
}

/// A swap device whose reads fail once the returned flag is set.
pub fn flaky_swap_block(pages: usize) -> (Block, Arc<AtomicBool>) {
    let fail_reads = Arc::new(AtomicBool::new(false));
    let sectors = sectors_for(pages);
    let driver = FlakyDisk {
        inner: RamDisk::new(sectors),
        fail_reads: fail_reads.clone(),
    };
    let block = Block::new(BlockType::Swap, "flaky-swap", sectors, Box::new(driver));
    (block, fail_reads)
}

/// Like [`small_vm`], but swapping to a [`flaky_swap_block`].
pub fn flaky_vm(frames: usize, swap_pages: usize) -> (VirtualMemory, Arc<AtomicBool>) {
    let (block, fail_reads) = flaky_swap_block(swap_pages);
    let config = VmConfig {
        frames,
        ..VmConfig::default()
    };
    (VirtualMemory::new(config, block), fail_reads)
}

/// A file kept in memory.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Backing for the page of this file starting at `offset`.
    pub fn backing(self: &Arc<Self>, offset: u64, read_bytes: usize, write_back: bool) -> FileBacking {
        FileBacking {
            file: self.clone(),
            offset,
            read_bytes,
            write_back,
        }
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, BlockError> {
        let data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| BlockError::ReadError)?;
        let Some(rest) = data.get(start..) else {
            return Ok(0);
        };
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, BlockError> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| BlockError::WriteError)?;
        if start > data.len() {
            return Err(BlockError::WriteError);
        }
        let n = (data.len() - start).min(buf.len());
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
