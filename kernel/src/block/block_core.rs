use super::block_error::BlockError;
use alloc::{boxed::Box, string::String};
use core::fmt;
use vmkernel_shared::sizes::SECTOR_SIZE;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by another operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// The name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,
    /// The read count
    read_count: u32,
    /// The write count
    write_count: u32,
}

impl Block {
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        log::info!(
            "registered block device \"{}\" ({} type) with {} sectors",
            block_name,
            block_type,
            block_size
        );
        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is exactly one sector long.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            log::warn!(
                "{}: invalid sector {} (block size: {})",
                self.block_name,
                sector,
                self.block_size
            );
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        // Never scribble over a partition that belongs to someone else.
        if self.block_type == BlockType::Foreign {
            return Err(BlockError::WriteError);
        }

        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count
    }
    pub fn write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;

    fn ram_block(block_type: BlockType, sectors: BlockSector) -> Block {
        Block::new(block_type, "ram", sectors, Box::new(RamDisk::new(sectors)))
    }

    #[test]
    fn test_read_write_counts() {
        let mut block = ram_block(BlockType::Raw, 4);
        let data = [0xabu8; BLOCK_SECTOR_SIZE];
        block.write(3, &data).unwrap();
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        block.read(3, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(block.read_count(), 1);
        assert_eq!(block.write_count(), 1);
    }

    #[test]
    fn test_sector_out_of_bounds() {
        let mut block = ram_block(BlockType::Swap, 2);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert!(matches!(
            block.read(2, &mut buf),
            Err(BlockError::SectorOutOfBounds)
        ));
        assert_eq!(block.read_count(), 0);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut block = ram_block(BlockType::Swap, 2);
        assert!(matches!(
            block.write(0, &[0u8; 16]),
            Err(BlockError::BufferInvalid)
        ));
    }

    #[test]
    fn test_foreign_block_is_read_only() {
        let mut block = ram_block(BlockType::Foreign, 2);
        assert!(matches!(
            block.write(0, &[0u8; BLOCK_SECTOR_SIZE]),
            Err(BlockError::WriteError)
        ));
        assert_eq!(block.write_count(), 0);
    }
}
