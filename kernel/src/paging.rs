//! Per-process page directories.
//!
//! The virtual memory code only ever talks to a [`PageDirectory`]; the
//! software implementation here stands in for the MMU's page tables and also
//! models what the hardware does on a user access.

use crate::mem::frame_table::FrameId;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use bitbybit::bitfield;
use vmkernel_shared::paging::PageTableEntry;

/// Error code pushed by the CPU on a page fault.
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// Set when the page was present and the fault is a protection violation.
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub write: bool,
    #[bit(2, rw)]
    pub user: bool,
}

impl PageFaultErrorCode {
    pub fn not_present(&self) -> bool {
        !self.present()
    }
}

/// A user page mapping as the hardware sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub frame: FrameId,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

impl From<PageTableEntry> for Mapping {
    fn from(pte: PageTableEntry) -> Self {
        Self {
            frame: FrameId(pte.frame_number()),
            writable: pte.read_write(),
            accessed: pte.accessed(),
            dirty: pte.dirty(),
        }
    }
}

pub trait PageDirectory: Send + Sync {
    /// Maps `upage` to `frame`. Returns `false` and changes nothing if `upage`
    /// is already mapped.
    #[must_use]
    fn set_page(&self, upage: usize, frame: FrameId, writable: bool) -> bool;

    fn get_page(&self, upage: usize) -> Option<Mapping>;

    /// Unmaps `upage`, returning the mapping as it was at removal.
    fn clear_page(&self, upage: usize) -> Option<Mapping>;

    fn is_dirty(&self, upage: usize) -> bool;

    fn set_dirty(&self, upage: usize, dirty: bool);

    fn is_accessed(&self, upage: usize) -> bool;

    fn set_accessed(&self, upage: usize, accessed: bool);

    /// Reads and clears the accessed and dirty bits of `upage`.
    fn clear_reference_bits(&self, upage: usize) -> (bool, bool) {
        let bits = (self.is_accessed(upage), self.is_dirty(upage));
        self.set_accessed(upage, false);
        self.set_dirty(upage, false);
        bits
    }

    /// Performs a user access of `upage` the way the MMU would.
    ///
    /// On success the accessed bit (and the dirty bit for writes) is set and
    /// `f` runs with the backing frame while the mapping cannot change. On
    /// failure the fault error code is returned and `f` is not called.
    fn access(
        &self,
        upage: usize,
        write: bool,
        f: &mut dyn FnMut(FrameId),
    ) -> Result<(), PageFaultErrorCode>;
}

/// Page directory kept in a map from user page to page table entry.
#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of user pages currently mapped.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            *pte = f(*pte);
        }
    }
}

impl PageDirectory for SoftPageDirectory {
    fn set_page(&self, upage: usize, frame: FrameId, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return false;
        }
        entries.insert(upage, PageTableEntry::user_mapping(frame.0, writable));
        true
    }

    fn get_page(&self, upage: usize) -> Option<Mapping> {
        self.entries.lock().get(&upage).copied().map(Mapping::from)
    }

    fn clear_page(&self, upage: usize) -> Option<Mapping> {
        self.entries.lock().remove(&upage).map(Mapping::from)
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entries.lock().get(&upage).is_some_and(|pte| pte.dirty())
    }

    fn set_dirty(&self, upage: usize, dirty: bool) {
        self.update(upage, |pte| pte.with_dirty(dirty));
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entries.lock().get(&upage).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |pte| pte.with_accessed(accessed));
    }

    fn clear_reference_bits(&self, upage: usize) -> (bool, bool) {
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&upage) else {
            return (false, false);
        };
        let bits = (pte.accessed(), pte.dirty());
        *pte = pte.with_accessed(false).with_dirty(false);
        bits
    }

    fn access(
        &self,
        upage: usize,
        write: bool,
        f: &mut dyn FnMut(FrameId),
    ) -> Result<(), PageFaultErrorCode> {
        let fault = PageFaultErrorCode::DEFAULT.with_write(write).with_user(true);
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&upage) else {
            return Err(fault);
        };
        if write && !pte.read_write() {
            return Err(fault.with_present(true));
        }

        *pte = pte.with_accessed(true);
        if write {
            *pte = pte.with_dirty(true);
        }
        f(FrameId(pte.frame_number()));
        Ok(())
    }
}
