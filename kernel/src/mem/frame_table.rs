use crate::paging::PageDirectory;
use crate::swapping::{PageReplacementPolicy, ReferenceBits, SecondChance, SwapSpace};
use crate::sync::mutex::Mutex;
use crate::threading::{ProcessControlBlock, ProcessTable, Tid};
use crate::mem::supplemental::PageStatus;
use crate::mem::VmError;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitbybit::bitfield;
use core::sync::atomic::{AtomicUsize, Ordering};
use vmkernel_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Index of a frame in the user pool. This is also the frame number the page
/// directory records for a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

/// Names the page a frame currently backs.
///
/// This is a lookup key, not a reference: the page entry owns the frame, and
/// the frame only remembers where to find that entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageKey {
    pub tid: Tid,
    pub upage: usize,
}

/// Storage for one physical page.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct PageFrame(pub [u8; PAGE_FRAME_SIZE]);

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    pub allocated: bool,
    /// Not eligible for eviction.
    #[bit(1, rw)]
    pub pinned: bool,
    /// The page was seen dirty by the clock and still has to be written out.
    #[bit(2, rw)]
    pub pending_write: bool,
    #[bit(3, rw)]
    pub writable: bool,
    /// An evictor has claimed the frame and is moving its page out.
    #[bit(4, rw)]
    pub evicting: bool,
}

#[derive(Clone, Copy)]
pub struct FrameEntry {
    pub state: CoreMapEntry,
    pub owner: Option<PageKey>,
}

impl Default for FrameEntry {
    fn default() -> Self {
        Self {
            state: CoreMapEntry::DEFAULT,
            owner: None,
        }
    }
}

struct CoreMap {
    frames: Box<[FrameEntry]>,
    policy: SecondChance,
    /// Where the next free-frame search starts.
    position: usize,
    resident: usize,
}

impl CoreMap {
    /// Next-fit search for a frame that is neither allocated nor pinned.
    fn claim_free(&mut self, key: PageKey, writable: bool) -> Option<FrameId> {
        let total = self.frames.len();
        for step in 0..total {
            let idx = (self.position + step) % total;
            let entry = &self.frames[idx];
            if entry.state.allocated() || entry.state.pinned() {
                continue;
            }
            self.assign(idx, key, writable);
            self.position = (idx + 1) % total;
            self.resident += 1;
            return Some(FrameId(idx));
        }
        None
    }

    fn assign(&mut self, idx: usize, key: PageKey, writable: bool) {
        self.frames[idx] = FrameEntry {
            state: CoreMapEntry::DEFAULT
                .with_allocated(true)
                .with_pinned(true)
                .with_writable(writable),
            owner: Some(key),
        };
    }

    fn clear(&mut self, idx: usize) {
        if self.frames[idx].state.allocated() {
            self.resident -= 1;
        }
        self.frames[idx] = FrameEntry::default();
    }
}

/// Samples reference bits through the owning process's page directory.
struct HardwareBits<'a> {
    processes: &'a ProcessTable,
}

impl ReferenceBits for HardwareBits<'_> {
    fn test_and_clear(&mut self, key: &PageKey) -> (bool, bool) {
        self.processes
            .get(key.tid)
            .map_or((false, false), |pcb| pcb.pagedir().clear_reference_bits(key.upage))
    }
}

/// The pool of user frames and the core map describing them.
///
/// Lock order: `eviction`, then `core_map`, then the process table and page
/// directories. A page table lock may be taken before `core_map` but never
/// after it. Frame storage locks nest inside page table and page directory
/// locks, and the swap lock nests inside storage.
pub struct FrameTable {
    memory: Box<[Mutex<Box<PageFrame>>]>,
    core_map: Mutex<CoreMap>,
    /// Serializes evictors so one victim is worked on at a time.
    eviction: Mutex<()>,
    evictions: AtomicUsize,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        let memory: Vec<_> = (0..frames)
            .map(|_| Mutex::new(PageFrame::new_box_zeroed()))
            .collect();
        Self {
            memory: memory.into_boxed_slice(),
            core_map: Mutex::new(CoreMap {
                frames: alloc::vec![FrameEntry::default(); frames].into_boxed_slice(),
                policy: SecondChance::new(),
                position: 0,
                resident: 0,
            }),
            eviction: Mutex::new(()),
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Frames currently allocated.
    pub fn resident(&self) -> usize {
        self.core_map.lock().resident
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn owner(&self, id: FrameId) -> Option<PageKey> {
        self.core_map.lock().frames[id.0].owner
    }

    pub fn frames_owned_by(&self, tid: Tid) -> usize {
        self.core_map
            .lock()
            .frames
            .iter()
            .filter(|entry| entry.owner.is_some_and(|key| key.tid == tid))
            .count()
    }

    pub fn is_pinned(&self, id: FrameId) -> bool {
        self.core_map.lock().frames[id.0].state.pinned()
    }

    /// Whether the clock found the page in `id` dirty since it was last saved.
    pub fn pending_write(&self, id: FrameId) -> bool {
        self.core_map.lock().frames[id.0].state.pending_write()
    }

    pub fn pin(&self, id: FrameId) {
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.frames[id.0];
        entry.state = entry.state.with_pinned(true);
    }

    pub fn unpin(&self, id: FrameId) {
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.frames[id.0];
        entry.state = entry.state.with_pinned(false);
    }

    /// Runs `f` on the storage of frame `id`.
    pub fn with_page<R>(&self, id: FrameId, f: impl FnOnce(&mut PageFrame) -> R) -> R {
        f(&mut self.memory[id.0].lock())
    }

    /// Returns a zeroed frame owned by `key`, evicting another page if the
    /// pool is exhausted.
    ///
    /// The frame comes back pinned; [`FrameTable::install_frame`] or
    /// [`FrameTable::release_frame`] ends the pin. Must not be called with a
    /// page table lock held.
    ///
    /// # Panics
    ///
    /// Panics if every frame is pinned or the evicted page cannot be saved.
    pub fn allocate_frame(
        &self,
        key: PageKey,
        writable: bool,
        processes: &ProcessTable,
        swap: &SwapSpace,
    ) -> Result<FrameId, VmError> {
        if self.is_empty() {
            return Err(VmError::OutOfFrames);
        }

        let claimed = self.core_map.lock().claim_free(key, writable);
        if let Some(id) = claimed {
            self.with_page(id, |page| page.zero());
            return Ok(id);
        }

        let _eviction = self.eviction.lock();
        // A frame may have been freed while we waited for the eviction lock.
        let claimed = self.core_map.lock().claim_free(key, writable);
        if let Some(id) = claimed {
            self.with_page(id, |page| page.zero());
            return Ok(id);
        }

        let id = self.evict(processes, swap);
        self.core_map.lock().assign(id.0, key, writable);
        Ok(id)
    }

    /// Picks a victim, moves its page out and returns the frame zeroed,
    /// allocated and pinned with no owner. Caller holds `eviction`.
    fn evict(&self, processes: &ProcessTable, swap: &SwapSpace) -> FrameId {
        let (victim, owner) = {
            let mut core_map = self.core_map.lock();
            let CoreMap {
                frames,
                policy,
                resident,
                ..
            } = &mut *core_map;
            let mut bits = HardwareBits { processes };
            let Some(idx) = policy.select_victim(frames, &mut bits) else {
                panic!(
                    "frame table: all {} frames pinned, no frame eligible for eviction",
                    frames.len()
                );
            };

            let entry = &mut frames[idx];
            if !entry.state.allocated() {
                *resident += 1;
            }
            entry.state = entry
                .state
                .with_allocated(true)
                .with_pinned(true)
                .with_evicting(true);
            (FrameId(idx), entry.owner)
        };

        if let Some(key) = owner {
            match processes.get(key.tid) {
                Some(pcb) => self.page_out(&pcb, key, victim, swap),
                None => log::debug!(
                    "evict: owner of frame {} (tid {}) is gone, taking it",
                    victim.0,
                    key.tid
                ),
            }
        }

        self.with_page(victim, |page| page.zero());
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.frames[victim.0];
        entry.owner = None;
        entry.state = entry.state.with_pending_write(false).with_evicting(false);
        drop(core_map);

        self.evictions.fetch_add(1, Ordering::Relaxed);
        victim
    }

    /// Unmaps the page `key` from `victim` and saves its contents.
    fn page_out(&self, pcb: &ProcessControlBlock, key: PageKey, victim: FrameId, swap: &SwapSpace) {
        let mut pages = pcb.pages.lock();
        let Some(entry) = pages.get_mut(key.upage) else {
            return;
        };
        if entry.status() != PageStatus::Present(victim) {
            return;
        }

        let mapping = pcb.pagedir().clear_page(key.upage);
        let pending = self.core_map.lock().frames[victim.0].state.pending_write();
        let dirty = pending || mapping.is_some_and(|mapping| mapping.dirty);

        let status = self.with_page(victim, |page| entry.page_out(page, victim, dirty, swap));
        log::trace!(
            "evict: tid {} page {:#x} from frame {} -> {:?}",
            key.tid,
            key.upage,
            victim.0,
            status
        );
        entry.set_status(status);
    }

    /// Maps `upage` to frame `id` in `pagedir` and unpins the frame.
    ///
    /// If `upage` is already mapped to another frame, `id` is released instead
    /// and `false` is returned. A frame that is already mapped at `upage` is
    /// left alone.
    #[must_use]
    pub fn install_frame(
        &self,
        id: FrameId,
        pagedir: &dyn PageDirectory,
        upage: usize,
        writable: bool,
    ) -> bool {
        if !pagedir.set_page(upage, id, writable) {
            log::warn!("install_frame: page {:#x} is already mapped", upage);
            if pagedir.get_page(upage).map(|mapping| mapping.frame) != Some(id) {
                self.release_frame(id);
            }
            return false;
        }

        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.frames[id.0];
        entry.state = entry.state.with_writable(writable).with_pinned(false);
        true
    }

    /// Unmaps the page `key` and gives its frame back to the pool.
    ///
    /// If an evictor has already claimed the frame only the ownership is
    /// dropped; the evictor keeps the frame. Does nothing to the core map if
    /// `key` no longer owns `id`.
    pub fn free_frame(&self, id: FrameId, key: PageKey, pagedir: &dyn PageDirectory) {
        pagedir.clear_page(key.upage);

        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.frames[id.0];
        if entry.owner != Some(key) {
            return;
        }
        if entry.state.evicting() {
            entry.owner = None;
            entry.state = entry.state.with_pending_write(false);
            return;
        }
        core_map.clear(id.0);
    }

    /// Returns a frame obtained from [`FrameTable::allocate_frame`] that was
    /// never installed.
    pub fn release_frame(&self, id: FrameId) {
        self.core_map.lock().clear(id.0);
    }
}
