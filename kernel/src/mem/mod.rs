//! User virtual memory: demand paging, eviction to swap and stack growth.
//!
//! Everything hangs off a [`VirtualMemory`], which owns the frame pool, the
//! swap space and the process registry. A page entry owns the frame backing
//! it; the frame only records a [`PageKey`](frame_table::PageKey) naming that
//! entry, which evictors resolve through the registry.

pub mod frame_table;
pub mod page_fault;
pub mod supplemental;


use crate::block::block_core::{Block, BlockSector, BlockType};
use crate::block::block_error::BlockError;
use crate::drivers::ram_disk::RamDisk;
use crate::swapping::SwapSpace;
use crate::sync::mutex::Mutex;
use crate::threading::{ProcessControlBlock, ProcessTable, Tid};
use alloc::{boxed::Box, sync::Arc};
use core::{error::Error, fmt};
use frame_table::FrameTable;
use vmkernel_shared::{
    mem::{MAX_STACK_SIZE, USER_STACK_TOP},
    paging::MAX_FRAME_NUMBER,
    sizes::{DEFAULT_USER_FRAMES, SWAP_SECTORS},
};

#[derive(Debug)]
pub enum VmError {
    /// The frame pool is empty.
    OutOfFrames,
    /// The page is already tracked by the process.
    AlreadyTracked,
    /// The process has no entry for the page.
    NoEntry,
    /// The page has a frame that was never installed.
    NotInstalled,
    AlreadyMapped,
    SwapFull,
    BadSwapSlot,
    NotUserAddress,
    Misaligned,
    NoProcess,
    Io(BlockError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "no user frames"),
            VmError::AlreadyTracked => write!(f, "page already tracked"),
            VmError::NoEntry => write!(f, "no such page"),
            VmError::NotInstalled => write!(f, "page has a frame but no mapping"),
            VmError::AlreadyMapped => write!(f, "page already mapped"),
            VmError::SwapFull => write!(f, "swap space full"),
            VmError::BadSwapSlot => write!(f, "swap slot not in use"),
            VmError::NotUserAddress => write!(f, "not a user address"),
            VmError::Misaligned => write!(f, "misaligned page or file region"),
            VmError::NoProcess => write!(f, "no such process"),
            VmError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub frames: usize,
    /// Size of the RAM swap device built by [`VirtualMemory::with_ram_swap`].
    pub swap_sectors: BlockSector,
    /// How far below `USER_STACK_TOP` a stack may grow.
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frames: DEFAULT_USER_FRAMES,
            swap_sectors: SWAP_SECTORS,
            max_stack_size: MAX_STACK_SIZE,
        }
    }
}

impl VmConfig {
    fn validate(&self) {
        assert!(
            self.frames <= MAX_FRAME_NUMBER + 1,
            "{} frames cannot be addressed by a page table entry",
            self.frames
        );
        assert!(
            self.max_stack_size <= USER_STACK_TOP,
            "stack limit {:#x} is larger than user space",
            self.max_stack_size
        );
    }
}

pub struct VirtualMemory {
    config: VmConfig,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapSpace,
    pub(crate) processes: ProcessTable,
    /// Held while a stack grows, so concurrent faults don't both extend it.
    extend_lock: Mutex<()>,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        config.validate();
        log::info!(
            "vm: {} user frames, stack limit {:#x}",
            config.frames,
            config.max_stack_size
        );
        Self {
            config,
            frames: FrameTable::new(config.frames),
            swap: SwapSpace::new(swap_device),
            processes: ProcessTable::new(),
            extend_lock: Mutex::new(()),
        }
    }

    /// Like [`VirtualMemory::new`], swapping to a RAM disk of
    /// `config.swap_sectors` sectors.
    pub fn with_ram_swap(config: VmConfig) -> Self {
        let driver = Box::new(RamDisk::new(config.swap_sectors));
        let swap = Block::new(BlockType::Swap, "ram-swap", config.swap_sectors, driver);
        Self::new(config, swap)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Registers a new process with an empty address space.
    pub fn create_process(&self) -> Arc<ProcessControlBlock> {
        let tid = self.processes.allocate_tid();
        log::debug!("vm: created tid {}", tid);
        self.processes.add(ProcessControlBlock::new(tid))
    }

    pub fn process(&self, tid: Tid) -> Option<Arc<ProcessControlBlock>> {
        self.processes.get(tid)
    }

    /// Records `status`, releases every page of `tid` and unregisters it.
    ///
    /// Returns the process so the caller can read its exit code.
    pub fn exit_process(&self, tid: Tid, status: i32) -> Option<Arc<ProcessControlBlock>> {
        let pcb = self.processes.get(tid)?;
        pcb.set_exit_code(status);
        // Stay registered while the pages go, so an evictor holding one of
        // our frames still finds the page entry to check against.
        self.page_table_destroy(&pcb);
        self.processes.remove(tid);
        log::info!("tid {}: exit({})", tid, status);
        Some(pcb)
    }

    /// Kills `tid` after a fault it may not recover from.
    pub fn terminate(&self, tid: Tid) {
        log::info!("tid {}: terminated by page fault", tid);
        self.exit_process(tid, -1);
    }

    pub fn resident_frames(&self) -> usize {
        self.frames.resident()
    }

    pub fn evictions(&self) -> usize {
        self.frames.evictions()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.slots_in_use()
    }

    pub fn frames_owned_by(&self, tid: Tid) -> usize {
        self.frames.frames_owned_by(tid)
    }
}
