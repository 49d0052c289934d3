use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::mem::frame_table::{FrameId, PageFrame};
use crate::mem::VmError;
use crate::sync::mutex::Mutex;
use alloc::vec::Vec;
use vmkernel_shared::mem::SECTORS_PER_PAGE;
use zerocopy::AsBytes;

/// Index of a page-sized slot on the swap device.
///
/// Slot `i` covers sectors `i * SECTORS_PER_PAGE .. (i + 1) * SECTORS_PER_PAGE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlotId(pub usize);

struct SwapState {
    device: Block,
    /// Whether each slot handed out so far holds a page, indexed by `SwapSlotId`.
    used: Vec<bool>,
    /// Slots whose contents were pulled back in and may be reused.
    free: Vec<usize>,
    capacity: usize,
}

/// The swap partition and the in-memory record of which slots hold data.
///
/// Nothing about slot usage is written to the device, so swap contents do not
/// survive a reboot.
pub struct SwapSpace {
    state: Mutex<SwapState>,
}

fn sector_of(slot: usize, index: usize) -> Result<BlockSector, BlockError> {
    BlockSector::try_from(slot * SECTORS_PER_PAGE + index).map_err(|_| BlockError::SectorOutOfBounds)
}

impl SwapState {
    fn take_slot(&mut self) -> Option<usize> {
        if let Some(idx) = self.free.pop() {
            return Some(idx);
        }
        if self.used.len() < self.capacity {
            self.used.push(false);
            return Some(self.used.len() - 1);
        }
        None
    }

    fn write_page(&mut self, slot: usize, page: &PageFrame) -> Result<(), BlockError> {
        for (i, sector) in page.as_bytes().chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            self.device.write(sector_of(slot, i)?, sector)?;
        }
        Ok(())
    }

    fn read_page(&mut self, slot: usize, page: &mut PageFrame) -> Result<(), BlockError> {
        for (i, sector) in page
            .as_bytes_mut()
            .chunks_exact_mut(BLOCK_SECTOR_SIZE)
            .enumerate()
        {
            self.device.read(sector_of(slot, i)?, sector)?;
        }
        Ok(())
    }
}

impl SwapSpace {
    pub fn new(device: Block) -> Self {
        let capacity = device.get_size() as usize / SECTORS_PER_PAGE;
        log::info!("swap: {} slots on \"{}\"", capacity, device.get_name());
        Self {
            state: Mutex::new(SwapState {
                device,
                used: Vec::new(),
                free: Vec::new(),
                capacity,
            }),
        }
    }

    /// Number of page-sized slots the device can hold.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Number of slots currently holding an evicted page.
    pub fn slots_in_use(&self) -> usize {
        self.state.lock().used.iter().filter(|&&used| used).count()
    }

    /// Sector reads and writes issued to the swap device so far.
    pub fn io_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.device.read_count(), state.device.write_count())
    }

    /// Writes the contents of `frame` to a free slot and returns the slot.
    ///
    /// Reclaimed slots are reused before the device is grown into.
    pub fn push_to_swap(&self, frame: FrameId, page: &PageFrame) -> Result<SwapSlotId, VmError> {
        let mut state = self.state.lock();
        let idx = state.take_slot().ok_or(VmError::SwapFull)?;

        if let Err(err) = state.write_page(idx, page) {
            state.free.push(idx);
            return Err(err.into());
        }

        state.used[idx] = true;
        log::trace!("swap: frame {} -> slot {}", frame.0, idx);
        Ok(SwapSlotId(idx))
    }

    /// Reads `slot` back into `page` (the storage of `frame`) and frees the slot.
    ///
    /// On an I/O error the slot keeps its contents so the page is not lost.
    pub fn pull_from_swap(
        &self,
        slot: SwapSlotId,
        frame: FrameId,
        page: &mut PageFrame,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        if state.used.get(slot.0) != Some(&true) {
            return Err(VmError::BadSwapSlot);
        }

        state.read_page(slot.0, page)?;

        state.used[slot.0] = false;
        state.free.push(slot.0);
        log::trace!("swap: slot {} -> frame {}", slot.0, frame.0);
        Ok(())
    }

    /// Drops the contents of `slot` without reading them.
    pub fn free_slot(&self, slot: SwapSlotId) {
        let mut state = self.state.lock();
        if let Some(used) = state.used.get_mut(slot.0) {
            if *used {
                *used = false;
                state.free.push(slot.0);
            }
        }
    }
}
