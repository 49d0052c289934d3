//! Per-process record of every user page, wherever its contents live.

use super::frame_table::{FrameId, PageFrame, PageKey};
use super::{VirtualMemory, VmError};
use crate::block::block_error::BlockError;
use crate::swapping::{SwapSlotId, SwapSpace};
use crate::threading::{ProcessControlBlock, Tid};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use vmkernel_shared::mem::{is_user_vaddr, pg_ofs, pg_round_down, PAGE_FRAME_SIZE};

/// Where the contents of a user page currently are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStatus {
    /// Entry is being set up and has no contents yet.
    NotExist,
    Present(FrameId),
    Swapped(SwapSlotId),
    /// Contents are in the page's backing file.
    InFilesystem,
}

/// A file a page can be read from and, for shared mappings, written back to.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number read,
    /// which is short only at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, BlockError>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, BlockError>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The file region behind a page.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    /// Bytes read from the file; the rest of the page is zero.
    pub read_bytes: usize,
    /// Modifications go back to the file instead of swap.
    pub write_back: bool,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("write_back", &self.write_back)
            .finish_non_exhaustive()
    }
}

impl FileBacking {
    pub(crate) fn read_page(&self, page: &mut PageFrame) -> Result<(), VmError> {
        let read = self.file.read_at(&mut page.0[..self.read_bytes], self.offset)?;
        page.0[read..].fill(0);
        Ok(())
    }

    /// Writes the file-backed part of `page` back, without growing the file.
    pub(crate) fn write_page(&self, page: &PageFrame) -> Result<(), VmError> {
        let len = self.file.len();
        if self.offset >= len {
            return Ok(());
        }
        let limit = usize::try_from(len - self.offset)
            .map_or(self.read_bytes, |rest| rest.min(self.read_bytes));
        self.file.write_at(&page.0[..limit], self.offset)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PageEntry {
    tid: Tid,
    upage: usize,
    status: PageStatus,
    writable: bool,
    backing: Option<FileBacking>,
    /// Contents no longer match the backing file, so a clean copy can't be
    /// reread from it.
    diverged: bool,
}

impl PageEntry {
    pub fn anonymous(tid: Tid, upage: usize, writable: bool) -> Self {
        Self {
            tid,
            upage,
            status: PageStatus::NotExist,
            writable,
            backing: None,
            diverged: false,
        }
    }

    pub fn file_backed(tid: Tid, upage: usize, backing: FileBacking, writable: bool) -> Self {
        Self {
            tid,
            upage,
            status: PageStatus::InFilesystem,
            writable,
            backing: Some(backing),
            diverged: false,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn key(&self) -> PageKey {
        PageKey {
            tid: self.tid,
            upage: self.upage,
        }
    }

    pub fn status(&self) -> PageStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: PageStatus) {
        self.status = status;
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    /// Saves the contents of `page`, which backs this entry in frame `frame`,
    /// and returns the status the entry should have afterwards.
    ///
    /// Anonymous pages always go to swap. A file page that never diverged and
    /// is clean is simply dropped. A dirty write-back page is written to its
    /// file. Everything else goes to swap and stops being rereadable from the
    /// file.
    ///
    /// # Panics
    ///
    /// Panics if swap is full or the swap device fails.
    pub(crate) fn page_out(
        &mut self,
        page: &PageFrame,
        frame: FrameId,
        dirty: bool,
        swap: &SwapSpace,
    ) -> PageStatus {
        if let Some(backing) = &self.backing {
            if !dirty && !self.diverged {
                return PageStatus::InFilesystem;
            }
            if backing.write_back {
                match backing.write_page(page) {
                    Ok(()) => return PageStatus::InFilesystem,
                    Err(err) => log::warn!(
                        "evict: write-back of page {:#x} failed ({}), using swap",
                        self.upage,
                        err
                    ),
                }
            }
        }

        match swap.push_to_swap(frame, page) {
            Ok(slot) => {
                self.diverged = true;
                PageStatus::Swapped(slot)
            }
            Err(VmError::SwapFull) => panic!("swap space exhausted"),
            Err(err) => panic!("evict: cannot write frame {} to swap: {}", frame.0, err),
        }
    }
}

/// A process's page entries, keyed by page-aligned user address.
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_page_entry(&self, upage: usize) -> Option<&PageEntry> {
        self.entries.get(&upage)
    }

    pub(crate) fn get_mut(&mut self, upage: usize) -> Option<&mut PageEntry> {
        self.entries.get_mut(&upage)
    }

    /// Adds `entry`, refusing to replace an entry for the same page.
    pub fn insert(&mut self, entry: PageEntry) -> Result<(), VmError> {
        if self.entries.contains_key(&entry.upage) {
            return Err(VmError::AlreadyTracked);
        }
        self.entries.insert(entry.upage, entry);
        Ok(())
    }

    pub fn remove(&mut self, upage: usize) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    fn take_all(&mut self) -> BTreeMap<usize, PageEntry> {
        core::mem::take(&mut self.entries)
    }
}

impl VirtualMemory {
    fn user_page(uaddr: usize) -> Result<usize, VmError> {
        if is_user_vaddr(uaddr) {
            Ok(pg_round_down(uaddr))
        } else {
            Err(VmError::NotUserAddress)
        }
    }

    /// Tracks the anonymous page containing `uaddr` and backs it with a zeroed
    /// frame.
    ///
    /// The frame stays pinned until [`VirtualMemory::install_page`] maps it, so
    /// the caller can fill it first.
    pub fn allocate_page(&self, tid: Tid, uaddr: usize) -> Result<FrameId, VmError> {
        let upage = Self::user_page(uaddr)?;
        let pcb = self.processes.get(tid).ok_or(VmError::NoProcess)?;
        pcb.pages
            .lock()
            .insert(PageEntry::anonymous(tid, upage, true))?;

        let key = PageKey { tid, upage };
        match self.frames.allocate_frame(key, true, &self.processes, &self.swap) {
            Ok(frame) => {
                if let Some(entry) = pcb.pages.lock().get_mut(upage) {
                    entry.set_status(PageStatus::Present(frame));
                }
                Ok(frame)
            }
            Err(err) => {
                pcb.pages.lock().remove(upage);
                Err(err)
            }
        }
    }

    /// Tracks the page at `uaddr` as backed by `backing`. Nothing is read until
    /// the page is first touched.
    pub fn allocate_file_page(
        &self,
        tid: Tid,
        uaddr: usize,
        backing: FileBacking,
        writable: bool,
    ) -> Result<(), VmError> {
        if pg_ofs(uaddr) != 0 || backing.read_bytes > PAGE_FRAME_SIZE {
            return Err(VmError::Misaligned);
        }
        let upage = Self::user_page(uaddr)?;
        let pcb = self.processes.get(tid).ok_or(VmError::NoProcess)?;
        let mut pages = pcb.pages.lock();
        pages.insert(PageEntry::file_backed(tid, upage, backing, writable))
    }

    /// Maps the frame given out by [`VirtualMemory::allocate_page`] for `uaddr`.
    ///
    /// Fails without side effects if the page is already mapped. Any other
    /// failure releases both the frame and the page entry.
    #[must_use]
    pub fn install_page(&self, tid: Tid, uaddr: usize, writable: bool) -> bool {
        let Some(pcb) = self.processes.get(tid) else {
            return false;
        };
        let upage = pg_round_down(uaddr);
        let mut pages = pcb.pages.lock();
        let Some(entry) = pages.get_mut(upage) else {
            return false;
        };
        let PageStatus::Present(frame) = entry.status() else {
            return false;
        };
        if pcb.pagedir().get_page(upage).is_some() {
            log::warn!("install_page: tid {} page {:#x} is already installed", tid, upage);
            return false;
        }

        entry.set_writable(writable);
        if self.frames.install_frame(frame, pcb.pagedir(), upage, writable) {
            true
        } else {
            pages.remove(upage);
            false
        }
    }

    /// Copy of the entry for the page containing `uaddr`.
    pub fn get_page_entry(&self, tid: Tid, uaddr: usize) -> Option<PageEntry> {
        let pcb = self.processes.get(tid)?;
        let pages = pcb.pages.lock();
        pages.get_page_entry(pg_round_down(uaddr)).cloned()
    }

    /// Brings the page containing `uaddr` into memory and maps it.
    #[must_use]
    pub fn load_page(&self, tid: Tid, uaddr: usize) -> bool {
        match self.try_load_page(tid, uaddr) {
            Ok(()) => true,
            Err(err) => {
                log::debug!("load_page: tid {} addr {:#x}: {}", tid, uaddr, err);
                false
            }
        }
    }

    fn try_load_page(&self, tid: Tid, uaddr: usize) -> Result<(), VmError> {
        let upage = Self::user_page(uaddr)?;
        let pcb = self.processes.get(tid).ok_or(VmError::NoProcess)?;
        let (status, writable, backing) = {
            let pages = pcb.pages.lock();
            let entry = pages.get_page_entry(upage).ok_or(VmError::NoEntry)?;
            (entry.status(), entry.writable(), entry.backing().cloned())
        };

        if let PageStatus::Present(_) = status {
            return match pcb.pagedir().get_page(upage) {
                Some(_) => Ok(()),
                None => Err(VmError::NotInstalled),
            };
        }

        let key = PageKey { tid, upage };
        let frame = self
            .frames
            .allocate_frame(key, writable, &self.processes, &self.swap)?;
        let filled = self.frames.with_page(frame, |page| match status {
            PageStatus::Swapped(slot) => self.swap.pull_from_swap(slot, frame, page),
            PageStatus::InFilesystem => backing.as_ref().ok_or(VmError::NoEntry)?.read_page(page),
            PageStatus::NotExist | PageStatus::Present(_) => Ok(()),
        });
        if let Err(err) = filled {
            self.frames.release_frame(frame);
            return Err(err);
        }

        let mut pages = pcb.pages.lock();
        let Some(entry) = pages.get_mut(upage) else {
            self.frames.release_frame(frame);
            return Err(VmError::NoEntry);
        };
        entry.set_status(PageStatus::Present(frame));
        if !self.frames.install_frame(frame, pcb.pagedir(), upage, writable) {
            pages.remove(upage);
            return Err(VmError::AlreadyMapped);
        }
        log::trace!("load_page: tid {} page {:#x} from {:?}", tid, upage, status);
        Ok(())
    }

    /// Stops tracking the page containing `uaddr` and releases whatever holds
    /// its contents.
    pub fn free_page(&self, tid: Tid, uaddr: usize) -> Result<(), VmError> {
        let pcb = self.processes.get(tid).ok_or(VmError::NoProcess)?;
        let mut pages = pcb.pages.lock();
        let entry = pages
            .remove(pg_round_down(uaddr))
            .ok_or(VmError::NoEntry)?;
        self.free_page_entry(&pcb, entry);
        Ok(())
    }

    /// Releases the frame or swap slot held by `entry`. Dirty write-back pages
    /// are flushed to their file first.
    ///
    /// Called with the owning page table locked, which keeps an evictor from
    /// moving the page out from under us.
    fn free_page_entry(&self, pcb: &ProcessControlBlock, entry: PageEntry) {
        match entry.status() {
            PageStatus::Present(frame) => {
                if let Some(backing) = entry.backing().filter(|backing| backing.write_back) {
                    let dirty = pcb.pagedir().is_dirty(entry.upage())
                        || self.frames.pending_write(frame);
                    if dirty || entry.diverged {
                        let written = self.frames.with_page(frame, |page| backing.write_page(page));
                        if let Err(err) = written {
                            log::warn!(
                                "free_page: write-back of {:#x} failed: {}",
                                entry.upage(),
                                err
                            );
                        }
                    }
                }
                self.frames.free_frame(frame, entry.key(), pcb.pagedir());
            }
            PageStatus::Swapped(slot) => self.swap.free_slot(slot),
            PageStatus::InFilesystem | PageStatus::NotExist => {}
        }
    }

    /// Releases every page of `pcb`.
    pub fn page_table_destroy(&self, pcb: &ProcessControlBlock) {
        let mut pages = pcb.pages.lock();
        let entries = pages.take_all();
        log::debug!("tid {}: releasing {} pages", pcb.tid, entries.len());
        for entry in entries.into_values() {
            self.free_page_entry(pcb, entry);
        }
    }
}
